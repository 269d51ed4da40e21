//! Image manifests.
//!
//! A manifest binds an ordered sequence of layer digests (base to top) and a
//! run configuration into one content-addressed unit. Its digest is computed
//! over the canonical serialization, so changing any layer or config field
//! changes the manifest's identity. Manifests are never edited; "updating an
//! image" means building a new manifest and repointing a tag.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use cask_core::config::RunConfig;
use cask_core::digest::Digest;
use cask_core::error::{CaskError, Result};

use crate::store::LayerStore;

/// An immutable image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Ordered layer digests, base to top
    pub layers: Vec<Digest>,

    /// Run configuration
    pub config: RunConfig,
}

impl Manifest {
    /// Compute this manifest's digest from its canonical serialization.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of_bytes(&serde_json::to_vec(self)?))
    }

    /// The topmost layer digest, if the manifest has any layers.
    pub fn top_layer(&self) -> Option<&Digest> {
        self.layers.last()
    }
}

/// Store of manifests, keyed by digest, persisted under `manifests/`.
pub struct ManifestStore {
    dir: PathBuf,
    layers: Arc<LayerStore>,
    index: RwLock<HashMap<Digest, Manifest>>,
}

impl ManifestStore {
    /// Open a manifest store at `dir`, loading persisted manifests.
    ///
    /// A persisted document whose recomputed digest disagrees with its file
    /// name is skipped with a warning rather than served.
    pub async fn open(dir: impl Into<PathBuf>, layers: Arc<LayerStore>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let manifest: Manifest = match serde_json::from_slice(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable manifest");
                    continue;
                }
            };
            let digest = manifest.digest()?;
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if stem != digest.hex() {
                tracing::warn!(path = %path.display(), "skipping manifest with mismatched digest");
                continue;
            }
            index.insert(digest, manifest);
        }

        Ok(Self {
            dir,
            layers,
            index: RwLock::new(index),
        })
    }

    /// Build and persist a manifest from an ordered layer list and config.
    ///
    /// Validates that every referenced layer exists in the layer store
    /// (fails with [`CaskError::MissingLayer`] before any mutation) and
    /// retains each layer for the manifest's lifetime. Two builds with
    /// identical inputs yield the same digest; rebuilding an existing
    /// manifest is a no-op returning the existing digest.
    pub async fn build(&self, layer_digests: Vec<Digest>, config: RunConfig) -> Result<Digest> {
        for digest in &layer_digests {
            if !self.layers.contains(digest) {
                return Err(CaskError::MissingLayer {
                    digest: digest.to_string(),
                });
            }
        }

        let manifest = Manifest {
            layers: layer_digests,
            config,
        };
        let digest = manifest.digest()?;

        {
            let index = self.index.read().await;
            if index.contains_key(&digest) {
                tracing::debug!(digest = %digest, "manifest already built");
                return Ok(digest);
            }
        }

        for layer in &manifest.layers {
            self.layers.retain(layer).await?;
        }

        let bytes = serde_json::to_vec_pretty(&manifest)?;
        crate::store::write_atomic(&self.manifest_path(&digest), bytes).await?;

        let mut index = self.index.write().await;
        if index.contains_key(&digest) {
            // A concurrent identical build won; drop this build's retains.
            drop(index);
            for layer in &manifest.layers {
                self.layers.release(layer).await?;
            }
            return Ok(digest);
        }
        index.insert(digest.clone(), manifest);
        drop(index);

        tracing::debug!(digest = %digest, "built manifest");
        Ok(digest)
    }

    /// Resolve a manifest by digest.
    pub async fn resolve(&self, digest: &Digest) -> Result<Manifest> {
        let index = self.index.read().await;
        index
            .get(digest)
            .cloned()
            .ok_or_else(|| CaskError::NotFound(format!("manifest {}", digest)))
    }

    /// Whether a manifest with `digest` exists.
    pub async fn contains(&self, digest: &Digest) -> bool {
        self.index.read().await.contains_key(digest)
    }

    /// Remove a manifest, releasing its layer references.
    ///
    /// The caller is responsible for checking that nothing still references
    /// the manifest; see `Engine::remove_manifest`.
    pub async fn remove(&self, digest: &Digest) -> Result<()> {
        let manifest = {
            let mut index = self.index.write().await;
            index
                .remove(digest)
                .ok_or_else(|| CaskError::NotFound(format!("manifest {}", digest)))?
        };

        for layer in &manifest.layers {
            self.layers.release(layer).await?;
        }

        match tokio::fs::remove_file(self.manifest_path(digest)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(digest = %digest, "removed manifest");
        Ok(())
    }

    /// All stored manifest digests.
    pub async fn list(&self) -> Vec<Digest> {
        self.index.read().await.keys().cloned().collect()
    }

    /// All stored manifests with their digests.
    pub async fn entries(&self) -> Vec<(Digest, Manifest)> {
        self.index
            .read()
            .await
            .iter()
            .map(|(d, m)| (d.clone(), m.clone()))
            .collect()
    }

    fn manifest_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(format!("{}.json", digest.hex()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::MutationSet;
    use tempfile::TempDir;

    async fn stores(tmp: &TempDir) -> (Arc<LayerStore>, ManifestStore) {
        let layers = Arc::new(LayerStore::open(tmp.path().join("layers")).await.unwrap());
        let manifests = ManifestStore::open(tmp.path().join("manifests"), layers.clone())
            .await
            .unwrap();
        (layers, manifests)
    }

    async fn put_layer(layers: &LayerStore, path: &str, content: &[u8]) -> Digest {
        let mut set = MutationSet::new();
        set.write(path, content.to_vec());
        layers.put(set, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_build_and_resolve() {
        let tmp = TempDir::new().unwrap();
        let (layers, manifests) = stores(&tmp).await;

        let layer = put_layer(&layers, "/a", b"1").await;
        let config = RunConfig {
            entrypoint: vec!["/bin/app".to_string()],
            ..Default::default()
        };

        let digest = manifests
            .build(vec![layer.clone()], config.clone())
            .await
            .unwrap();

        let manifest = manifests.resolve(&digest).await.unwrap();
        assert_eq!(manifest.layers, vec![layer]);
        assert_eq!(manifest.config, config);
    }

    #[tokio::test]
    async fn test_build_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let (layers, manifests) = stores(&tmp).await;

        let layer = put_layer(&layers, "/a", b"1").await;
        let config = RunConfig::default();

        let d1 = manifests
            .build(vec![layer.clone()], config.clone())
            .await
            .unwrap();
        let d2 = manifests.build(vec![layer.clone()], config).await.unwrap();
        assert_eq!(d1, d2);

        // The no-op rebuild did not retain the layer a second time.
        assert_eq!(layers.refcount(&layer), 2);
    }

    #[tokio::test]
    async fn test_build_config_changes_digest() {
        let tmp = TempDir::new().unwrap();
        let (layers, manifests) = stores(&tmp).await;

        let layer = put_layer(&layers, "/a", b"1").await;
        let d1 = manifests
            .build(vec![layer.clone()], RunConfig::default())
            .await
            .unwrap();

        let config = RunConfig {
            working_dir: Some("/srv".to_string()),
            ..Default::default()
        };
        let d2 = manifests.build(vec![layer], config).await.unwrap();
        assert_ne!(d1, d2);
    }

    #[tokio::test]
    async fn test_build_layer_order_changes_digest() {
        let tmp = TempDir::new().unwrap();
        let (layers, manifests) = stores(&tmp).await;

        let la = put_layer(&layers, "/a", b"1").await;
        let lb = put_layer(&layers, "/b", b"2").await;

        let d1 = manifests
            .build(vec![la.clone(), lb.clone()], RunConfig::default())
            .await
            .unwrap();
        let d2 = manifests
            .build(vec![lb, la], RunConfig::default())
            .await
            .unwrap();
        assert_ne!(d1, d2);
    }

    #[tokio::test]
    async fn test_build_missing_layer_fails_without_mutation() {
        let tmp = TempDir::new().unwrap();
        let (layers, manifests) = stores(&tmp).await;

        let real = put_layer(&layers, "/a", b"1").await;
        let missing = Digest::of_bytes(b"absent");

        let err = manifests
            .build(vec![real.clone(), missing], RunConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CaskError::MissingLayer { .. }));

        // Nothing was persisted or retained
        assert!(manifests.list().await.is_empty());
        assert_eq!(layers.refcount(&real), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_not_found() {
        let tmp = TempDir::new().unwrap();
        let (_layers, manifests) = stores(&tmp).await;

        let missing = Digest::of_bytes(b"no such manifest");
        assert!(matches!(
            manifests.resolve(&missing).await.unwrap_err(),
            CaskError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_releases_layers() {
        let tmp = TempDir::new().unwrap();
        let (layers, manifests) = stores(&tmp).await;

        let layer = put_layer(&layers, "/a", b"1").await;
        let digest = manifests
            .build(vec![layer.clone()], RunConfig::default())
            .await
            .unwrap();
        assert_eq!(layers.refcount(&layer), 2);

        manifests.remove(&digest).await.unwrap();
        assert_eq!(layers.refcount(&layer), 1);
        assert!(!manifests.contains(&digest).await);
    }

    #[tokio::test]
    async fn test_manifests_persist_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let layers = Arc::new(LayerStore::open(tmp.path().join("layers")).await.unwrap());

        let digest = {
            let manifests =
                ManifestStore::open(tmp.path().join("manifests"), layers.clone())
                    .await
                    .unwrap();
            let layer = put_layer(&layers, "/a", b"1").await;
            manifests
                .build(vec![layer], RunConfig::default())
                .await
                .unwrap()
        };

        let manifests = ManifestStore::open(tmp.path().join("manifests"), layers)
            .await
            .unwrap();
        assert!(manifests.contains(&digest).await);
    }

    #[tokio::test]
    async fn test_open_skips_tampered_manifest() {
        let tmp = TempDir::new().unwrap();
        let layers = Arc::new(LayerStore::open(tmp.path().join("layers")).await.unwrap());
        let dir = tmp.path().join("manifests");

        let digest = {
            let manifests = ManifestStore::open(&dir, layers.clone()).await.unwrap();
            let layer = put_layer(&layers, "/a", b"1").await;
            manifests
                .build(vec![layer], RunConfig::default())
                .await
                .unwrap()
        };

        // Tamper: change the config in place so the digest no longer matches
        // the file name.
        let path = dir.join(format!("{}.json", digest.hex()));
        let mut manifest: Manifest =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        manifest.config.working_dir = Some("/tampered".to_string());
        std::fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();

        let manifests = ManifestStore::open(&dir, layers).await.unwrap();
        assert!(!manifests.contains(&digest).await);
    }
}
