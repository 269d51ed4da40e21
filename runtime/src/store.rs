//! Content-addressed layer store.
//!
//! Layer blobs are persisted under `blobs/sha256/<hex>.json`, keyed by the
//! digest of their canonical serialization, so identical content shared
//! across images is only stored once. Per-digest reference counts live in a
//! concurrent map backed by a persistent `index.json`; counts reaching zero
//! mark a layer eligible for garbage collection but never delete inline.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::Mutex;

use cask_core::digest::Digest;
use cask_core::error::{CaskError, Result};

use crate::layer::{Layer, MutationSet};

/// Archive entry name for exported layer documents.
const ARCHIVE_ENTRY: &str = "layer.json";

/// Persistent reference-count index stored as JSON on disk.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct StoreIndex {
    refcounts: BTreeMap<String, u64>,
}

/// Content-addressed store for immutable layers.
pub struct LayerStore {
    /// Root directory for layer storage
    root: PathBuf,

    /// Per-digest reference counts. Entries with count zero are retained as
    /// garbage-collection candidates until collected.
    refcounts: DashMap<Digest, u64>,

    /// Serializes index file writes; never guards the in-memory counts.
    index_lock: Mutex<()>,
}

impl LayerStore {
    /// Open a layer store rooted at `root`.
    ///
    /// Creates the blob directory if it doesn't exist and loads any
    /// persisted reference-count index.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("blobs").join("sha256")).await?;

        let store = Self {
            root,
            refcounts: DashMap::new(),
            index_lock: Mutex::new(()),
        };
        store.load_index().await?;
        Ok(store)
    }

    /// Store a mutation set as a new immutable layer.
    ///
    /// The set is serialized deterministically, hashed, and persisted if no
    /// blob with that digest exists yet; either way the digest's reference
    /// count is incremented and the digest returned. Idempotent and safe to
    /// retry: concurrent identical puts converge on one physical blob and a
    /// correctly merged count.
    pub async fn put(&self, changes: MutationSet, parent: Option<Digest>) -> Result<Digest> {
        let layer = Layer::seal(changes, parent)?;
        let digest = layer.digest.clone();
        let blob_path = self.blob_path(&digest);

        if !blob_path.is_file() {
            let bytes = serde_json::to_vec(&layer)?;
            write_atomic(&blob_path, bytes).await?;
            tracing::debug!(
                digest = %digest,
                size_bytes = layer.size_bytes,
                "stored layer"
            );
        } else {
            tracing::debug!(digest = %digest, "layer already stored, deduplicated");
        }

        // Atomic merge on the per-digest counter: two concurrent puts for the
        // same content both land here and the count ends at 2.
        *self.refcounts.entry(digest.clone()).or_insert(0) += 1;

        self.save_index().await?;
        Ok(digest)
    }

    /// Fetch a layer by digest.
    ///
    /// Re-verifies the blob against its digest; disagreement is fatal
    /// ([`CaskError::IntegrityMismatch`]), never silently corrected.
    pub async fn get(&self, digest: &Digest) -> Result<Layer> {
        let blob_path = self.blob_path(digest);
        let bytes = match tokio::fs::read(&blob_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaskError::NotFound(format!("layer {}", digest)));
            }
            Err(e) => return Err(e.into()),
        };

        let layer: Layer = serde_json::from_slice(&bytes)?;
        let recomputed = layer.recompute_digest()?;
        if recomputed != *digest || layer.digest != *digest {
            return Err(CaskError::IntegrityMismatch {
                expected: digest.to_string(),
                actual: recomputed.to_string(),
            });
        }
        Ok(layer)
    }

    /// Whether a blob for `digest` is present.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Increment the reference count for `digest`.
    ///
    /// Returns the new count. Fails with `NotFound` if no blob exists.
    pub async fn retain(&self, digest: &Digest) -> Result<u64> {
        if !self.contains(digest) {
            return Err(CaskError::NotFound(format!("layer {}", digest)));
        }
        let count = {
            let mut entry = self.refcounts.entry(digest.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        self.save_index().await?;
        Ok(count)
    }

    /// Decrement the reference count for `digest`.
    ///
    /// A count of zero marks the layer eligible for garbage collection; the
    /// blob is not deleted until [`LayerStore::collect`] runs.
    pub async fn release(&self, digest: &Digest) -> Result<u64> {
        let count = match self.refcounts.get_mut(digest) {
            Some(mut entry) => {
                *entry = entry.saturating_sub(1);
                *entry
            }
            None => {
                return Err(CaskError::NotFound(format!("layer {}", digest)));
            }
        };
        self.save_index().await?;
        Ok(count)
    }

    /// Current reference count for `digest` (zero if untracked).
    pub fn refcount(&self, digest: &Digest) -> u64 {
        self.refcounts.get(digest).map(|rc| *rc).unwrap_or(0)
    }

    /// Delete layers whose reference count is zero and that are not
    /// transitively reachable, via parent pointers, from any of `live_roots`.
    ///
    /// Returns the digests deleted. Safe to run concurrently with reads and
    /// retains: each candidate is re-checked under its map entry at removal
    /// time, so a count bumped mid-collection survives. No lock is held
    /// across blob I/O.
    pub async fn collect(&self, live_roots: &[Digest]) -> Result<Vec<Digest>> {
        let reachable = self.reachable_from(live_roots).await?;

        let candidates: Vec<Digest> = self
            .refcounts
            .iter()
            .filter(|entry| *entry.value() == 0 && !reachable.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut deleted = Vec::new();
        for digest in candidates {
            // Double check: a concurrent retain since the scan keeps the layer.
            if self.refcounts.remove_if(&digest, |_, rc| *rc == 0).is_none() {
                continue;
            }
            match tokio::fs::remove_file(self.blob_path(&digest)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(digest = %digest, "collected layer");
            deleted.push(digest);
        }

        if !deleted.is_empty() {
            self.save_index().await?;
        }
        Ok(deleted)
    }

    /// All digests the store currently tracks.
    pub fn list(&self) -> Vec<Digest> {
        self.refcounts.iter().map(|e| e.key().clone()).collect()
    }

    /// Total size of all stored blobs in bytes.
    pub async fn disk_usage(&self) -> Result<u64> {
        let mut total = 0;
        let mut entries = tokio::fs::read_dir(self.blobs_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            total += entry.metadata().await?.len();
        }
        Ok(total)
    }

    /// Export a layer as a gzipped tar archive at `dest`.
    pub async fn export(&self, digest: &Digest, dest: &Path) -> Result<()> {
        let layer = self.get(digest).await?;
        let dest = dest.to_path_buf();
        tracing::debug!(digest = %digest, dest = %dest.display(), "exporting layer");
        tokio::task::spawn_blocking(move || -> Result<()> {
            let bytes = serde_json::to_vec(&layer)?;
            let file = std::fs::File::create(&dest)?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);

            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, ARCHIVE_ENTRY, bytes.as_slice())?;
            builder.into_inner()?.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| CaskError::Other(format!("export task failed: {}", e)))??;
        Ok(())
    }

    /// Import a layer from a gzipped tar archive, verifying its digest.
    ///
    /// The recomputed digest must match `expected` or the import fails with
    /// [`CaskError::IntegrityMismatch`] and nothing is stored.
    pub async fn import(&self, src: &Path, expected: &Digest) -> Result<Digest> {
        let src = src.to_path_buf();
        let layer: Layer = tokio::task::spawn_blocking(move || -> Result<Layer> {
            let file = std::fs::File::open(&src)?;
            let decoder = GzDecoder::new(file);
            let mut archive = tar::Archive::new(decoder);

            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.path()?.to_string_lossy() == ARCHIVE_ENTRY {
                    let mut bytes = Vec::new();
                    entry.read_to_end(&mut bytes)?;
                    return Ok(serde_json::from_slice(&bytes)?);
                }
            }
            Err(CaskError::Other(format!(
                "archive has no {} entry",
                ARCHIVE_ENTRY
            )))
        })
        .await
        .map_err(|e| CaskError::Other(format!("import task failed: {}", e)))??;

        let recomputed = layer.recompute_digest()?;
        if recomputed != *expected {
            return Err(CaskError::IntegrityMismatch {
                expected: expected.to_string(),
                actual: recomputed.to_string(),
            });
        }

        self.put(layer.changes, layer.parent).await
    }

    /// Walk parent pointers from `roots`, returning every reachable digest.
    async fn reachable_from(&self, roots: &[Digest]) -> Result<HashSet<Digest>> {
        let mut reachable = HashSet::new();
        let mut pending: Vec<Digest> = roots.to_vec();

        while let Some(digest) = pending.pop() {
            if !reachable.insert(digest.clone()) {
                continue;
            }
            match self.get(&digest).await {
                Ok(layer) => {
                    if let Some(parent) = layer.parent {
                        pending.push(parent);
                    }
                }
                Err(CaskError::NotFound(_)) => {
                    tracing::warn!(digest = %digest, "live root references a missing layer");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reachable)
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(format!("{}.json", digest.hex()))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Load the reference-count index from disk, keeping only entries whose
    /// blobs still exist.
    async fn load_index(&self) -> Result<()> {
        let index_path = self.index_path();
        if !index_path.is_file() {
            return Ok(());
        }

        let data = tokio::fs::read(&index_path).await?;
        let index: StoreIndex = serde_json::from_slice(&data)?;
        for (raw, count) in index.refcounts {
            let digest = Digest::parse(&raw)?;
            if self.contains(&digest) {
                self.refcounts.insert(digest, count);
            }
        }
        Ok(())
    }

    /// Persist the reference-count index.
    async fn save_index(&self) -> Result<()> {
        let snapshot: BTreeMap<String, u64> = self
            .refcounts
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect();
        let data = serde_json::to_vec_pretty(&StoreIndex {
            refcounts: snapshot,
        })?;

        let _guard = self.index_lock.lock().await;
        write_atomic(&self.index_path(), data).await
    }
}

/// Write `data` to `path` via a temp file and rename, so a crash never
/// leaves a half-written document.
pub(crate) async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| CaskError::Other(format!("no parent directory for {}", path.display())))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.persist(&path)
            .map_err(|e| CaskError::Other(format!("persist {} failed: {}", path.display(), e)))?;
        Ok(())
    })
    .await
    .map_err(|e| CaskError::Other(format!("write task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_set(path: &str, content: &[u8]) -> MutationSet {
        let mut set = MutationSet::new();
        set.write(path, content.to_vec());
        set
    }

    #[tokio::test]
    async fn test_open_creates_directories() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("layers");
        let _store = LayerStore::open(&root).await.unwrap();
        assert!(root.join("blobs/sha256").is_dir());
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let set = sample_set("/etc/hosts", b"127.0.0.1 localhost");
        let digest = store.put(set.clone(), None).await.unwrap();

        let layer = store.get(&digest).await.unwrap();
        assert_eq!(layer.changes, set);
        assert_eq!(layer.digest, digest);
        assert_eq!(layer.parent, None);
    }

    #[tokio::test]
    async fn test_put_identical_content_deduplicates() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let d1 = store.put(sample_set("/a", b"same"), None).await.unwrap();
        let d2 = store.put(sample_set("/a", b"same"), None).await.unwrap();

        assert_eq!(d1, d2);
        assert_eq!(store.refcount(&d1), 2);

        // Only one physical blob
        let blobs = std::fs::read_dir(tmp.path().join("blobs/sha256"))
            .unwrap()
            .count();
        assert_eq!(blobs, 1);
    }

    #[tokio::test]
    async fn test_put_different_parent_different_digest() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let base = store.put(sample_set("/base", b"b"), None).await.unwrap();
        let d1 = store.put(sample_set("/a", b"x"), None).await.unwrap();
        let d2 = store
            .put(sample_set("/a", b"x"), Some(base.clone()))
            .await
            .unwrap();
        assert_ne!(d1, d2);
    }

    #[tokio::test]
    async fn test_get_unknown_digest_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let missing = Digest::of_bytes(b"never stored");
        let err = store.get(&missing).await.unwrap_err();
        assert!(matches!(err, CaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_detects_corruption() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let digest = store.put(sample_set("/a", b"good"), None).await.unwrap();

        // Corrupt the blob in place: swap the content but keep valid JSON.
        let blob_path = tmp
            .path()
            .join("blobs/sha256")
            .join(format!("{}.json", digest.hex()));
        let mut layer: Layer =
            serde_json::from_slice(&std::fs::read(&blob_path).unwrap()).unwrap();
        layer.changes.write("/a", b"tampered".to_vec());
        std::fs::write(&blob_path, serde_json::to_vec(&layer).unwrap()).unwrap();

        let err = store.get(&digest).await.unwrap_err();
        assert!(matches!(err, CaskError::IntegrityMismatch { .. }));
    }

    #[tokio::test]
    async fn test_retain_release_adjust_count() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let digest = store.put(sample_set("/a", b"1"), None).await.unwrap();
        assert_eq!(store.refcount(&digest), 1);

        assert_eq!(store.retain(&digest).await.unwrap(), 2);
        assert_eq!(store.release(&digest).await.unwrap(), 1);
        assert_eq!(store.release(&digest).await.unwrap(), 0);

        // Release at zero saturates
        assert_eq!(store.release(&digest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retain_unknown_digest_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();
        let missing = Digest::of_bytes(b"nope");
        assert!(matches!(
            store.retain(&missing).await.unwrap_err(),
            CaskError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_collect_removes_unreferenced() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let digest = store.put(sample_set("/a", b"1"), None).await.unwrap();
        store.release(&digest).await.unwrap();

        let deleted = store.collect(&[]).await.unwrap();
        assert_eq!(deleted, vec![digest.clone()]);
        assert!(!store.contains(&digest));
        assert!(matches!(
            store.get(&digest).await.unwrap_err(),
            CaskError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_collect_spares_live_roots() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let digest = store.put(sample_set("/a", b"1"), None).await.unwrap();
        store.release(&digest).await.unwrap();

        let deleted = store.collect(&[digest.clone()]).await.unwrap();
        assert!(deleted.is_empty());
        assert!(store.contains(&digest));
    }

    #[tokio::test]
    async fn test_collect_spares_parents_of_live_roots() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let base = store.put(sample_set("/base", b"b"), None).await.unwrap();
        let top = store
            .put(sample_set("/top", b"t"), Some(base.clone()))
            .await
            .unwrap();

        // Base has no direct references left, but the top layer chains to it.
        store.release(&base).await.unwrap();

        let deleted = store.collect(&[top.clone()]).await.unwrap();
        assert!(deleted.is_empty());
        assert!(store.contains(&base));
    }

    #[tokio::test]
    async fn test_collect_keeps_positive_refcounts() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();

        let digest = store.put(sample_set("/a", b"1"), None).await.unwrap();
        let deleted = store.collect(&[]).await.unwrap();
        assert!(deleted.is_empty());
        assert_eq!(store.refcount(&digest), 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_puts_converge() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(LayerStore::open(tmp.path()).await.unwrap());

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.put(sample_set("/a", b"same"), None).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.put(sample_set("/a", b"same"), None).await })
        };

        let da = a.await.unwrap().unwrap();
        let db = b.await.unwrap().unwrap();
        assert_eq!(da, db);
        assert_eq!(store.refcount(&da), 2);
    }

    #[tokio::test]
    async fn test_index_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let digest = {
            let store = LayerStore::open(tmp.path()).await.unwrap();
            let d = store.put(sample_set("/a", b"1"), None).await.unwrap();
            store.retain(&d).await.unwrap();
            d
        };

        let store = LayerStore::open(tmp.path()).await.unwrap();
        assert_eq!(store.refcount(&digest), 2);
        assert!(store.contains(&digest));
    }

    #[tokio::test]
    async fn test_disk_usage_grows() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).await.unwrap();
        assert_eq!(store.disk_usage().await.unwrap(), 0);

        store
            .put(sample_set("/a", &[7u8; 1024]), None)
            .await
            .unwrap();
        assert!(store.disk_usage().await.unwrap() > 1024);
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let tmp = TempDir::new().unwrap();
        let source = LayerStore::open(tmp.path().join("src")).await.unwrap();
        let dest = LayerStore::open(tmp.path().join("dst")).await.unwrap();

        let digest = source
            .put(sample_set("/app", b"payload"), None)
            .await
            .unwrap();

        let archive = tmp.path().join("layer.tar.gz");
        source.export(&digest, &archive).await.unwrap();

        let imported = dest.import(&archive, &digest).await.unwrap();
        assert_eq!(imported, digest);

        let layer = dest.get(&digest).await.unwrap();
        assert_eq!(layer.changes, sample_set("/app", b"payload"));
    }

    #[tokio::test]
    async fn test_import_rejects_digest_mismatch() {
        let tmp = TempDir::new().unwrap();
        let source = LayerStore::open(tmp.path().join("src")).await.unwrap();
        let dest = LayerStore::open(tmp.path().join("dst")).await.unwrap();

        let digest = source
            .put(sample_set("/app", b"payload"), None)
            .await
            .unwrap();
        let archive = tmp.path().join("layer.tar.gz");
        source.export(&digest, &archive).await.unwrap();

        let wrong = Digest::of_bytes(b"advertised something else");
        let err = dest.import(&archive, &wrong).await.unwrap_err();
        assert!(matches!(err, CaskError::IntegrityMismatch { .. }));
        assert!(!dest.contains(&digest));
    }
}
