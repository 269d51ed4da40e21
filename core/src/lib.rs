//! Cask Core - Foundational Types and Abstractions
//!
//! This module provides the foundational types shared across the cask
//! ecosystem: the error enum, content digests, and run configuration.

pub mod config;
pub mod digest;
pub mod error;

// Re-export commonly used types
pub use config::{MountMode, MountSpec, ResourceLimits, RunConfig, RuntimeOverrides, StoreConfig};
pub use digest::{Digest, DigestWriter};
pub use error::{CaskError, Result};

/// Cask version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
