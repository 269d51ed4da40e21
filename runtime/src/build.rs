//! Image building.
//!
//! An [`ImageBuilder`] walks a sequence of build steps: each step's mutation
//! set is appended to the layer store as a new layer chained to the previous
//! one, and `finish` binds the accumulated stack plus run configuration into
//! a manifest, optionally pointing a tag at it. The step mutation sets are
//! supplied by the build orchestrator; interpreting build scripts is its
//! concern, not ours.

use std::sync::Arc;

use cask_core::config::RunConfig;
use cask_core::digest::Digest;
use cask_core::error::Result;

use crate::layer::MutationSet;
use crate::manifest::ManifestStore;
use crate::store::LayerStore;
use crate::tag::TagRegistry;

/// Accumulates build steps into an image.
///
/// Each `add_step` holds a store reference on its layer until `finish`
/// hands ownership to the built manifest. A builder dropped without
/// `finish` leaves those references behind; release them or run GC with
/// the layers unreachable to reclaim the blobs.
pub struct ImageBuilder {
    layers: Arc<LayerStore>,
    manifests: Arc<ManifestStore>,
    tags: Arc<TagRegistry>,
    stack: Vec<Digest>,
    config: RunConfig,
}

impl ImageBuilder {
    /// Start a build from an empty root.
    pub fn new(
        layers: Arc<LayerStore>,
        manifests: Arc<ManifestStore>,
        tags: Arc<TagRegistry>,
    ) -> Self {
        Self {
            layers,
            manifests,
            tags,
            stack: Vec::new(),
            config: RunConfig::default(),
        }
    }

    /// Start a build on top of an existing manifest's stack and config.
    pub async fn from_manifest(
        layers: Arc<LayerStore>,
        manifests: Arc<ManifestStore>,
        tags: Arc<TagRegistry>,
        base: &Digest,
    ) -> Result<Self> {
        let manifest = manifests.resolve(base).await?;
        for digest in &manifest.layers {
            layers.retain(digest).await?;
        }
        Ok(Self {
            layers,
            manifests,
            tags,
            stack: manifest.layers,
            config: manifest.config,
        })
    }

    /// Execute one build step: store `changes` as a new layer on top of the
    /// current stack. Returns the new layer's digest.
    pub async fn add_step(&mut self, changes: MutationSet) -> Result<Digest> {
        let parent = self.stack.last().cloned();
        let digest = self.layers.put(changes, parent).await?;
        tracing::debug!(step = self.stack.len() + 1, digest = %digest, "build step");
        self.stack.push(digest.clone());
        Ok(digest)
    }

    /// Layer digests accumulated so far, base to top.
    pub fn stack(&self) -> &[Digest] {
        &self.stack
    }

    /// Set the entrypoint command.
    pub fn entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.config.entrypoint = entrypoint;
        self
    }

    /// Set the default command arguments.
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.config.cmd = cmd;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.config.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: &str) -> Self {
        self.config.working_dir = Some(dir.to_string());
        self
    }

    /// Declare an exposed port (e.g., "8080/tcp").
    pub fn expose(mut self, port: &str) -> Self {
        self.config.exposed_ports.push(port.to_string());
        self
    }

    /// Declare a volume mount point.
    pub fn volume(mut self, path: &str) -> Self {
        self.config.volumes.push(path.to_string());
        self
    }

    /// Set the user to run as.
    pub fn user(mut self, user: &str) -> Self {
        self.config.user = Some(user.to_string());
        self
    }

    /// Replace the whole run configuration.
    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the accumulated stack and config into a manifest, optionally
    /// pointing `tag` at it. Returns the manifest digest.
    ///
    /// The builder's per-step store references are released once the
    /// manifest holds its own.
    pub async fn finish(self, tag: Option<&str>) -> Result<Digest> {
        let manifest_digest = self
            .manifests
            .build(self.stack.clone(), self.config)
            .await?;

        for digest in &self.stack {
            self.layers.release(digest).await?;
        }

        if let Some(name) = tag {
            self.tags.set(name, manifest_digest.clone()).await?;
        }

        tracing::info!(
            manifest = %manifest_digest,
            layers = self.stack.len(),
            tag = tag.unwrap_or("<none>"),
            "built image"
        );
        Ok(manifest_digest)
    }
}
