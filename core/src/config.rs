//! Run configuration and runtime overrides.
//!
//! [`RunConfig`] is the configuration block bound into an image manifest;
//! [`RuntimeOverrides`] carries the per-container adjustments applied at
//! create time. Maps use `BTreeMap` so serialized form is deterministic.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Run configuration bound into a manifest.
///
/// Changing any field changes the manifest's digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Entrypoint command
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Default command arguments
    #[serde(default)]
    pub cmd: Vec<String>,

    /// Environment variable assignments
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Exposed ports (e.g., "8080/tcp")
    #[serde(default)]
    pub exposed_ports: Vec<String>,

    /// Working directory
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Declared volume mount points
    #[serde(default)]
    pub volumes: Vec<String>,

    /// User to run as
    #[serde(default)]
    pub user: Option<String>,
}

impl RunConfig {
    /// Resolve the command line for a container: the override replaces the
    /// default arguments, the entrypoint always leads.
    pub fn command_line(&self, command_override: Option<&[String]>) -> Vec<String> {
        let args = command_override.unwrap_or(&self.cmd);
        let mut line = self.entrypoint.clone();
        line.extend(args.iter().cloned());
        line
    }

    /// Merge override variables into the configured environment.
    ///
    /// Override entries win on key conflicts.
    pub fn effective_env(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        for (k, v) in overrides {
            env.insert(k.clone(), v.clone());
        }
        env
    }
}

/// Access mode for a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// A mount specification: a (source, target, mode) triple bound into the
/// assembled filesystem view. The source's internal configuration is opaque
/// to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host-side source path
    pub source: PathBuf,

    /// Target path inside the container filesystem
    pub target: String,

    /// Access mode
    pub mode: MountMode,
}

/// Resource limits for a container instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU share (fractional CPUs)
    pub cpus: Option<f64>,

    /// Memory limit in bytes
    pub memory_bytes: Option<u64>,
}

/// Per-container runtime overrides applied at create time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOverrides {
    /// Extra environment variables (win over the manifest's)
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Mounts to bind into the assembled view
    #[serde(default)]
    pub mounts: Vec<MountSpec>,

    /// Resource limits
    #[serde(default)]
    pub resources: ResourceLimits,

    /// Command override (replaces the manifest's default arguments)
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for all persisted state
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let root = dirs::home_dir()
            .map(|h| h.join(".cask"))
            .unwrap_or_else(|| PathBuf::from(".cask"));
        Self { root }
    }
}

impl StoreConfig {
    /// A store rooted at the given directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}
