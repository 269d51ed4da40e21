//! Engine — the injectable store object owning every component.
//!
//! An [`Engine`] is opened at process start and holds the layer store,
//! manifest store, tag registry, and container manager for one store root.
//! Tests open independent engines over temp directories; nothing is ambient
//! global state.

use std::collections::HashSet;
use std::sync::Arc;

use cask_core::config::StoreConfig;
use cask_core::digest::Digest;
use cask_core::error::{CaskError, Result};

use crate::build::ImageBuilder;
use crate::container::{ContainerManager, HostRunner, ProcessRunner};
use crate::manifest::ManifestStore;
use crate::store::LayerStore;
use crate::tag::TagRegistry;

/// Result of a garbage-collection pass.
#[derive(Debug, Clone)]
pub struct GcReport {
    /// Layer digests deleted
    pub deleted: Vec<Digest>,
}

/// Owns the stores and the container manager for one store root.
pub struct Engine {
    layers: Arc<LayerStore>,
    manifests: Arc<ManifestStore>,
    tags: Arc<TagRegistry>,
    containers: Arc<ContainerManager>,
}

impl Engine {
    /// Open an engine at the configured root, with payloads running as host
    /// processes.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(HostRunner)).await
    }

    /// Open an engine with an injected payload runner.
    pub async fn with_runner(
        config: StoreConfig,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self> {
        let root = config.root;
        let layers = Arc::new(LayerStore::open(root.join("layers")).await?);
        let manifests = Arc::new(
            ManifestStore::open(root.join("manifests"), layers.clone()).await?,
        );
        let tags = Arc::new(TagRegistry::open(&root).await?);
        let containers = Arc::new(ContainerManager::new(
            layers.clone(),
            manifests.clone(),
            tags.clone(),
            runner,
            root.join("containers"),
        ));

        tracing::info!(root = %root.display(), "opened engine");
        Ok(Self {
            layers,
            manifests,
            tags,
            containers,
        })
    }

    /// The layer store.
    pub fn layers(&self) -> &Arc<LayerStore> {
        &self.layers
    }

    /// The manifest store.
    pub fn manifests(&self) -> &Arc<ManifestStore> {
        &self.manifests
    }

    /// The tag registry.
    pub fn tags(&self) -> &Arc<TagRegistry> {
        &self.tags
    }

    /// The container manager.
    pub fn containers(&self) -> &Arc<ContainerManager> {
        &self.containers
    }

    /// Start an image build against this engine's stores.
    pub fn builder(&self) -> ImageBuilder {
        ImageBuilder::new(
            self.layers.clone(),
            self.manifests.clone(),
            self.tags.clone(),
        )
    }

    /// Remove a manifest, releasing its layer references.
    ///
    /// Fails with [`CaskError::ResourceBusy`] while a tag or a live container
    /// still references it; the manifest stays addressable by digest until
    /// then.
    pub async fn remove_manifest(&self, digest: &Digest) -> Result<()> {
        if self.tags.references(digest) {
            return Err(CaskError::ResourceBusy(format!(
                "manifest {} is referenced by a tag",
                digest
            )));
        }
        if self
            .containers
            .referenced_manifests()
            .await
            .contains(digest)
        {
            return Err(CaskError::ResourceBusy(format!(
                "manifest {} is referenced by a container",
                digest
            )));
        }
        self.manifests.remove(digest).await
    }

    /// Garbage-collect unreferenced layers.
    ///
    /// Live roots are every stored manifest's layers plus the writable-layer
    /// parents of live containers; the layer store deletes what is
    /// reference-count zero and unreachable from those roots. Scheduling is
    /// the caller's concern — this is an explicit operation, not a background
    /// task.
    pub async fn gc(&self) -> Result<GcReport> {
        let mut roots: HashSet<Digest> = HashSet::new();
        for (_, manifest) in self.manifests.entries().await {
            roots.extend(manifest.layers);
        }
        roots.extend(self.containers.writable_parents().await);

        let roots: Vec<Digest> = roots.into_iter().collect();
        let deleted = self.layers.collect(&roots).await?;

        tracing::info!(deleted = deleted.len(), "garbage collection complete");
        Ok(GcReport { deleted })
    }
}
