//! Union filesystem assembly.
//!
//! A union view composes an ordered stack of read-only mutation sets, bottom
//! to top, with an optional writable set above them. Resolution is a small
//! interpreter over the stack: search top to bottom, first entry for the path
//! wins, and a whiteout entry makes the path absent even when a lower layer
//! has it. Ordering in the stack is the sole tie-break.
//!
//! Resolution is pure and in-memory so it is unit-testable without real
//! filesystem I/O; the [`Materializer`] trait is the adapter seam that writes
//! a resolved view to disk for container start.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use cask_core::digest::Digest;
use cask_core::error::{CaskError, Result};
use cask_core::MountSpec;

use crate::layer::{normalize_path, FileChange, MutationSet};
use crate::store::LayerStore;

/// Resolve `path` against a layer stack ordered bottom to top.
///
/// Searches top-down; the first layer with an entry for the path decides:
/// content for a write, absence for a whiteout. Returns `None` when no layer
/// knows the path or the winning entry is a whiteout.
pub fn resolve<'a>(layers: &[&'a MutationSet], path: &str) -> Option<&'a [u8]> {
    let path = normalize_path(path);
    for layer in layers.iter().rev() {
        match layer.get(&path) {
            Some(FileChange::Write { content }) => return Some(content),
            Some(FileChange::Whiteout) => return None,
            None => continue,
        }
    }
    None
}

/// Flatten a layer stack (bottom to top) into the visible path → content map.
///
/// Applying writes and whiteouts in stack order is equivalent to top-down
/// first-match resolution for every path at once.
pub fn flatten<'a>(layers: &[&'a MutationSet]) -> BTreeMap<&'a str, &'a [u8]> {
    let mut visible: BTreeMap<&str, &[u8]> = BTreeMap::new();
    for layer in layers {
        for (path, change) in layer.iter() {
            match change {
                FileChange::Write { content } => {
                    visible.insert(path, content.as_slice());
                }
                FileChange::Whiteout => {
                    visible.remove(path);
                }
            }
        }
    }
    visible
}

/// An assembled read-only view over an ordered stack of layers.
#[derive(Debug, Clone, Default)]
pub struct UnionView {
    /// Owned mutation sets, bottom to top.
    layers: Vec<MutationSet>,
}

impl UnionView {
    /// Assemble a view by fetching every digest in `stack` from the store.
    ///
    /// Fails with [`CaskError::MissingLayer`] if any digest is unknown — a
    /// view is never assembled over an incomplete stack.
    pub async fn assemble(store: &LayerStore, stack: &[Digest]) -> Result<Self> {
        let mut layers = Vec::with_capacity(stack.len());
        for digest in stack {
            let layer = match store.get(digest).await {
                Ok(layer) => layer,
                Err(CaskError::NotFound(_)) => {
                    return Err(CaskError::MissingLayer {
                        digest: digest.to_string(),
                    });
                }
                Err(e) => return Err(e),
            };
            layers.push(layer.changes);
        }
        Ok(Self { layers })
    }

    /// A view directly over in-memory mutation sets (bottom to top).
    pub fn from_sets(layers: Vec<MutationSet>) -> Self {
        Self { layers }
    }

    /// Read the visible content at `path`.
    pub fn read(&self, path: &str) -> Option<&[u8]> {
        let refs: Vec<&MutationSet> = self.layers.iter().collect();
        resolve(&refs, path)
    }

    /// All visible paths and contents.
    pub fn entries(&self) -> BTreeMap<&str, &[u8]> {
        let refs: Vec<&MutationSet> = self.layers.iter().collect();
        flatten(&refs)
    }

    /// Read the visible content at `path` with `writable` stacked on top.
    pub fn read_with<'a>(&'a self, writable: &'a MutationSet, path: &str) -> Option<&'a [u8]> {
        let refs = self.layer_refs(Some(writable));
        resolve(&refs, path)
    }

    /// Number of layers in the stack.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    fn layer_refs<'a>(&'a self, writable: Option<&'a MutationSet>) -> Vec<&'a MutationSet> {
        let mut refs: Vec<&MutationSet> = self.layers.iter().collect();
        if let Some(w) = writable {
            refs.push(w);
        }
        refs
    }
}

/// A writable view: a read-only base stack plus one mutable top set.
///
/// All mutation lands in the writable set; the base layers are never touched.
pub struct WorkingView<'a> {
    base: &'a UnionView,
    writable: &'a mut MutationSet,
}

impl<'a> WorkingView<'a> {
    /// Compose a working view over `base` with `writable` on top.
    pub fn new(base: &'a UnionView, writable: &'a mut MutationSet) -> Self {
        Self { base, writable }
    }

    /// Read the visible content at `path`, writable set first.
    pub fn read(&self, path: &str) -> Option<&[u8]> {
        let refs = self.base.layer_refs(Some(&*self.writable));
        resolve(&refs, path)
    }

    /// Replace the content at `path`. Always lands in the writable set.
    pub fn write(&mut self, path: &str, content: impl Into<Vec<u8>>) {
        self.writable.write(path, content);
    }

    /// Append to the content at `path`.
    ///
    /// If the path is visible only in a lower read-only layer, its content is
    /// first copied up into the writable set; the lower layer is never
    /// mutated.
    pub fn append(&mut self, path: &str, bytes: &[u8]) {
        let mut content = self.read(path).map(|c| c.to_vec()).unwrap_or_default();
        content.extend_from_slice(bytes);
        self.writable.write(path, content);
    }

    /// Delete `path` from the view.
    ///
    /// A path that exists in a lower layer gets a whiteout in the writable
    /// set; a path that exists only in the writable set is simply dropped.
    /// Returns whether the path was visible before the delete.
    pub fn remove(&mut self, path: &str) -> bool {
        if self.read(path).is_none() {
            return false;
        }
        let base_refs: Vec<&MutationSet> = self.base.layers.iter().collect();
        if resolve(&base_refs, path).is_some() {
            self.writable.whiteout(path);
        } else {
            self.writable.remove_entry(path);
        }
        true
    }

    /// All visible paths and contents, writable set included.
    pub fn entries(&self) -> BTreeMap<&str, &[u8]> {
        let refs = self.base.layer_refs(Some(&*self.writable));
        flatten(&refs)
    }
}

/// Adapter that writes an assembled view into a real location.
#[async_trait]
pub trait Materializer: Send + Sync {
    /// Write the merged contents of `view` plus `writable` under `target`,
    /// then bind `mounts` into the result.
    async fn materialize(
        &self,
        view: &UnionView,
        writable: &MutationSet,
        mounts: &[MountSpec],
        target: &Path,
    ) -> Result<()>;
}

/// Materializer that writes the view into a plain directory tree.
///
/// File content blocks are copied verbatim; mounts are bound as symlinks so
/// the source stays host-visible and outlives the container.
pub struct DirMaterializer;

#[async_trait]
impl Materializer for DirMaterializer {
    async fn materialize(
        &self,
        view: &UnionView,
        writable: &MutationSet,
        mounts: &[MountSpec],
        target: &Path,
    ) -> Result<()> {
        let refs = view.layer_refs(Some(writable));
        let files: Vec<(String, Vec<u8>)> = flatten(&refs)
            .into_iter()
            .map(|(p, c)| (p.to_string(), c.to_vec()))
            .collect();
        let mounts = mounts.to_vec();
        let target = target.to_path_buf();
        let file_count = files.len();

        tracing::debug!(
            target = %target.display(),
            files = file_count,
            "materializing filesystem view"
        );

        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&target)?;
            for (path, content) in &files {
                let dest = target.join(path.trim_start_matches('/'));
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, content)?;
            }
            for mount in &mounts {
                bind_mount(&mount.source, &target, &mount.target)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| CaskError::Other(format!("materialize task failed: {}", e)))??;
        Ok(())
    }
}

fn bind_mount(source: &Path, root: &Path, mount_target: &str) -> Result<()> {
    let dest = root.join(normalize_path(mount_target).trim_start_matches('/'));
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if dest.exists() || dest.is_symlink() {
        // A mount shadows whatever the image put there.
        if dest.is_dir() && !dest.is_symlink() {
            std::fs::remove_dir_all(&dest)?;
        } else {
            std::fs::remove_file(&dest)?;
        }
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(source, &dest)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (source, dest);
        Err(CaskError::Other(
            "mount binding is only supported on unix".to_string(),
        ))
    }
}

/// A path inside the materialized tree for a container path.
pub fn materialized_path(root: &Path, container_path: &str) -> PathBuf {
    root.join(normalize_path(container_path).trim_start_matches('/'))
}
