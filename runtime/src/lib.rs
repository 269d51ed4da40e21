//! Cask Runtime - Content-addressed layer store and container runtime.
//!
//! This crate provides the engine implementation for cask: the layer store,
//! union filesystem assembly, image manifests, the tag registry, image
//! building, and container instance lifecycle management.

pub mod build;
pub mod container;
pub mod engine;
pub mod layer;
pub mod manifest;
pub mod store;
pub mod tag;
pub mod union;

// Re-export common types
pub use build::ImageBuilder;
pub use container::{
    ContainerManager, ContainerState, ContainerSummary, ExitStatus, HostRunner, ProcessHandle,
    ProcessRunner, ProcessSpec,
};
pub use engine::{Engine, GcReport};
pub use layer::{FileChange, Layer, MutationSet};
pub use manifest::{Manifest, ManifestStore};
pub use store::LayerStore;
pub use tag::{ImageRef, TagRegistry};
pub use union::{DirMaterializer, Materializer, UnionView, WorkingView};

/// Cask runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default grace period for container stop, in milliseconds.
pub const DEFAULT_STOP_GRACE_MS: u64 = 10_000;
