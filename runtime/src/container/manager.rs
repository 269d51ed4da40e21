//! Container instance manager — lifecycle orchestration.
//!
//! Each instance owns a private writable mutation set stacked on top of its
//! manifest's layers. Locks guard only in-memory metadata updates; filesystem
//! assembly, materialization, and payload control all run with no lock held.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use cask_core::config::{RunConfig, RuntimeOverrides};
use cask_core::digest::Digest;
use cask_core::error::{CaskError, Result};

use crate::container::runner::{ProcessHandle, ProcessRunner, ProcessSpec};
use crate::container::state::{ContainerState, ExitStatus};
use crate::manifest::{Manifest, ManifestStore};
use crate::store::LayerStore;
use crate::tag::{ImageRef, TagRegistry};
use crate::union::{materialized_path, DirMaterializer, Materializer, UnionView, WorkingView};
use crate::layer::MutationSet;

/// Grace period used when a force-removal has to stop the payload first.
const FORCE_STOP_GRACE: Duration = Duration::from_secs(2);

/// A live container instance.
struct ContainerInstance {
    id: String,
    manifest_digest: Digest,
    manifest: Manifest,
    writable: MutationSet,
    writable_parent: Option<Digest>,
    view: Option<UnionView>,
    state: ContainerState,
    overrides: RuntimeOverrides,
    exit_status: Option<ExitStatus>,
    created_at: DateTime<Utc>,
}

/// Point-in-time snapshot of an instance, for listing and inspection.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    /// Instance identifier
    pub id: String,
    /// Manifest the instance was created from
    pub manifest_digest: Digest,
    /// Current lifecycle state
    pub state: ContainerState,
    /// Exit status, once stopped
    pub exit_status: Option<ExitStatus>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Manages container instances on top of the layer and manifest stores.
pub struct ContainerManager {
    layers: Arc<LayerStore>,
    manifests: Arc<ManifestStore>,
    tags: Arc<TagRegistry>,
    runner: Arc<dyn ProcessRunner>,
    materializer: Arc<dyn Materializer>,

    /// Root for per-instance materialized filesystems
    containers_dir: PathBuf,

    /// Instance records, by id
    instances: RwLock<HashMap<String, ContainerInstance>>,

    /// Payload handles for running instances. Kept apart from the records so
    /// waiting on a payload never blocks metadata access.
    handles: DashMap<String, Arc<Mutex<Box<dyn ProcessHandle>>>>,
}

impl ContainerManager {
    /// Create a manager over the given stores.
    pub fn new(
        layers: Arc<LayerStore>,
        manifests: Arc<ManifestStore>,
        tags: Arc<TagRegistry>,
        runner: Arc<dyn ProcessRunner>,
        containers_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            layers,
            manifests,
            tags,
            runner,
            materializer: Arc::new(DirMaterializer),
            containers_dir: containers_dir.into(),
            instances: RwLock::new(HashMap::new()),
            handles: DashMap::new(),
        }
    }

    /// Replace the materializer. Used by tests that assemble in memory.
    pub fn with_materializer(mut self, materializer: Arc<dyn Materializer>) -> Self {
        self.materializer = materializer;
        self
    }

    /// Create an instance from an image reference (tag name or digest).
    ///
    /// Allocates a fresh empty writable layer whose parent is the manifest's
    /// topmost layer digest and records the runtime overrides. Fails with
    /// `NotFound` — and performs no persistent mutation — if the reference
    /// does not resolve.
    pub async fn create(&self, reference: &str, overrides: RuntimeOverrides) -> Result<String> {
        let (manifest_digest, manifest) = self.resolve_reference(reference).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let instance = ContainerInstance {
            id: id.clone(),
            writable_parent: manifest.top_layer().cloned(),
            manifest_digest: manifest_digest.clone(),
            manifest,
            writable: MutationSet::new(),
            view: None,
            state: ContainerState::Created,
            overrides,
            exit_status: None,
            created_at: Utc::now(),
        };

        let mut instances = self.instances.write().await;
        instances.insert(id.clone(), instance);
        drop(instances);

        tracing::info!(container_id = %id, image = %manifest_digest, "created container");
        Ok(id)
    }

    /// Start an instance: assemble and materialize its filesystem view,
    /// apply mount overrides, launch the payload, transition to `Running`.
    ///
    /// Fails with `AlreadyRunning` unless the instance is `Created` or
    /// `Stopped`, and with `MissingLayer` if the stack is incomplete — a
    /// container never starts over a partial filesystem. Cancellation before
    /// materialization completes leaves the prior state untouched.
    pub async fn start(&self, id: &str) -> Result<()> {
        // Phase 1: snapshot what we need under the lock.
        let (stack, writable, overrides, config) = {
            let instances = self.instances.read().await;
            let instance = instances
                .get(id)
                .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
            match instance.state {
                ContainerState::Created | ContainerState::Stopped => {}
                _ => return Err(CaskError::AlreadyRunning(id.to_string())),
            }
            (
                instance.manifest.layers.clone(),
                instance.writable.clone(),
                instance.overrides.clone(),
                instance.manifest.config.clone(),
            )
        };

        // Assemble and materialize with no lock held.
        let view = UnionView::assemble(&self.layers, &stack).await?;
        let rootfs = self.rootfs_dir(id);
        self.materializer
            .materialize(&view, &writable, &overrides.mounts, &rootfs)
            .await?;

        // Launch the payload, if the image defines one.
        let command = config.command_line(overrides.command.as_deref());
        let handle = if command.is_empty() {
            None
        } else {
            let cwd = materialized_path(&rootfs, config.working_dir.as_deref().unwrap_or("/"));
            let spec = ProcessSpec {
                command,
                env: config.effective_env(&overrides.env),
                cwd,
                mounts: overrides.mounts.clone(),
            };
            Some(self.runner.spawn(&spec).await?)
        };

        // Phase 2: commit the transition, re-checking state.
        let mut instances = self.instances.write().await;
        let instance = match instances.get_mut(id) {
            Some(instance) => instance,
            None => {
                drop(instances);
                self.discard_handle(handle).await;
                return Err(CaskError::NotFound(format!("container {}", id)));
            }
        };
        match instance.state {
            ContainerState::Created | ContainerState::Stopped => {}
            _ => {
                drop(instances);
                self.discard_handle(handle).await;
                return Err(CaskError::AlreadyRunning(id.to_string()));
            }
        }
        instance.state = ContainerState::Running;
        instance.view = Some(view);
        instance.exit_status = None;
        drop(instances);

        if let Some(handle) = handle {
            self.handles
                .insert(id.to_string(), Arc::new(Mutex::new(handle)));
        }

        tracing::info!(container_id = %id, "started container");
        Ok(())
    }

    /// Stop an instance, gracefully then forcefully.
    ///
    /// Requests termination and waits up to `grace`; on expiry the payload is
    /// force-killed and the [`ExitStatus::ForceKilled`] sentinel recorded.
    pub async fn stop(&self, id: &str, grace: Duration) -> Result<ExitStatus> {
        {
            let instances = self.instances.read().await;
            let instance = instances
                .get(id)
                .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
            match instance.state {
                ContainerState::Running | ContainerState::Paused => {}
                state => {
                    return Err(CaskError::InvalidState(format!(
                        "cannot stop container {} in state {}",
                        id, state
                    )));
                }
            }
        }

        // Clone the handle out so the map guard is released before waiting.
        let handle = self.handles.get(id).map(|entry| entry.value().clone());
        let exit = match handle {
            None => ExitStatus::Code(0),
            Some(handle) => {
                let mut handle = handle.lock().await;
                // A paused payload cannot act on the termination request.
                handle.resume().await?;
                handle.terminate().await?;
                match tokio::time::timeout(grace, handle.wait()).await {
                    Ok(code) => ExitStatus::Code(code?),
                    Err(_) => {
                        tracing::warn!(container_id = %id, "grace period expired, force killing");
                        handle.kill().await?;
                        let _ = handle.wait().await;
                        ExitStatus::ForceKilled
                    }
                }
            }
        };

        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.state = ContainerState::Stopped;
            instance.exit_status = Some(exit);
        }
        drop(instances);
        self.handles.remove(id);

        tracing::info!(container_id = %id, exit = ?exit, "stopped container");
        Ok(exit)
    }

    /// Suspend a running instance.
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.transition_paused(id, ContainerState::Paused).await
    }

    /// Resume a paused instance.
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.transition_paused(id, ContainerState::Running).await
    }

    async fn transition_paused(&self, id: &str, target: ContainerState) -> Result<()> {
        {
            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
            if !instance.state.can_transition(target) {
                return Err(CaskError::InvalidState(format!(
                    "cannot move container {} from {} to {}",
                    id, instance.state, target
                )));
            }
            instance.state = target;
        }

        let handle = self.handles.get(id).map(|entry| entry.value().clone());
        if let Some(handle) = handle {
            let mut handle = handle.lock().await;
            match target {
                ContainerState::Paused => handle.suspend().await?,
                _ => handle.resume().await?,
            }
        }
        Ok(())
    }

    /// Remove an instance.
    ///
    /// Fails with `InvalidState` while the instance is running unless `force`
    /// is set, in which case it is stopped first (skipping graceful
    /// shutdown beyond a short grace). The writable layer is destroyed with
    /// the instance unless `keep_writable` is set, which freezes it into the
    /// layer store and returns its digest.
    pub async fn remove(
        &self,
        id: &str,
        keep_writable: bool,
        force: bool,
    ) -> Result<Option<Digest>> {
        let running = {
            let instances = self.instances.read().await;
            let instance = instances
                .get(id)
                .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
            matches!(
                instance.state,
                ContainerState::Running | ContainerState::Paused
            )
        };

        if running {
            if !force {
                return Err(CaskError::InvalidState(format!(
                    "cannot remove running container {} without force",
                    id
                )));
            }
            self.stop(id, FORCE_STOP_GRACE).await?;
        }

        let instance = {
            let mut instances = self.instances.write().await;
            instances
                .remove(id)
                .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?
        };

        let kept = if keep_writable && !instance.writable.is_empty() {
            let digest = self
                .layers
                .put(instance.writable, instance.writable_parent)
                .await?;
            Some(digest)
        } else {
            None
        };

        match tokio::fs::remove_dir_all(self.containers_dir.join(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(container_id = %id, kept_writable = kept.is_some(), "removed container");
        Ok(kept)
    }

    /// Commit the instance's writable layer into the store and build a new
    /// manifest referencing the old stack plus the now-frozen layer.
    ///
    /// `config` replaces the manifest's run configuration when given.
    pub async fn commit(&self, id: &str, config: Option<RunConfig>) -> Result<Digest> {
        let (writable, parent, mut layers, base_config) = {
            let instances = self.instances.read().await;
            let instance = instances
                .get(id)
                .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
            (
                instance.writable.clone(),
                instance.writable_parent.clone(),
                instance.manifest.layers.clone(),
                instance.manifest.config.clone(),
            )
        };

        let frozen = self.layers.put(writable, parent).await?;
        layers.push(frozen.clone());

        let manifest_digest = self
            .manifests
            .build(layers, config.unwrap_or(base_config))
            .await?;

        // The manifest holds its own reference now; drop the commit's.
        self.layers.release(&frozen).await?;

        tracing::info!(container_id = %id, manifest = %manifest_digest, "committed container");
        Ok(manifest_digest)
    }

    /// Snapshot a single instance.
    pub async fn inspect(&self, id: &str) -> Result<ContainerSummary> {
        let instances = self.instances.read().await;
        instances
            .get(id)
            .map(summarize)
            .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))
    }

    /// Snapshot all instances.
    pub async fn list(&self) -> Vec<ContainerSummary> {
        let instances = self.instances.read().await;
        instances.values().map(summarize).collect()
    }

    /// Write a file inside the instance's filesystem view.
    ///
    /// Always lands in the writable layer; lower layers are never mutated.
    pub async fn write_file(&self, id: &str, path: &str, content: Vec<u8>) -> Result<()> {
        self.ensure_view(id).await?;
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
        let view = match instance.view.as_ref() {
            Some(view) => view,
            None => return Err(missing_view(id)),
        };
        let mut working = WorkingView::new(view, &mut instance.writable);
        working.write(path, content);
        Ok(())
    }

    /// Append to a file inside the view, copying up from lower layers first.
    pub async fn append_file(&self, id: &str, path: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_view(id).await?;
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
        let view = match instance.view.as_ref() {
            Some(view) => view,
            None => return Err(missing_view(id)),
        };
        let mut working = WorkingView::new(view, &mut instance.writable);
        working.append(path, bytes);
        Ok(())
    }

    /// Read a file from the instance's filesystem view.
    pub async fn read_file(&self, id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_view(id).await?;
        let instances = self.instances.read().await;
        let instance = instances
            .get(id)
            .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
        let view = instance.view.as_ref().ok_or_else(|| missing_view(id))?;
        Ok(view
            .read_with(&instance.writable, path)
            .map(|content| content.to_vec()))
    }

    /// Delete a file from the instance's view.
    ///
    /// Inserts a whiteout when the path exists in a lower layer; nothing is
    /// physically removed from lower layers. Returns whether the path was
    /// visible.
    pub async fn remove_file(&self, id: &str, path: &str) -> Result<bool> {
        self.ensure_view(id).await?;
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
        let view = match instance.view.as_ref() {
            Some(view) => view,
            None => return Err(missing_view(id)),
        };
        let mut working = WorkingView::new(view, &mut instance.writable);
        Ok(working.remove(path))
    }

    /// Manifest digests referenced by live instances.
    pub async fn referenced_manifests(&self) -> Vec<Digest> {
        let instances = self.instances.read().await;
        instances
            .values()
            .map(|i| i.manifest_digest.clone())
            .collect()
    }

    /// Writable-layer parent digests of live instances, for GC root
    /// computation.
    pub async fn writable_parents(&self) -> Vec<Digest> {
        let instances = self.instances.read().await;
        instances
            .values()
            .filter_map(|i| i.writable_parent.clone())
            .collect()
    }

    /// Resolve a reference string to a manifest: `sha256:...` and
    /// `name@sha256:...` resolve by digest, anything else through the tag
    /// registry.
    async fn resolve_reference(&self, reference: &str) -> Result<(Digest, Manifest)> {
        let digest = if reference.trim().starts_with("sha256:") {
            Digest::parse(reference)?
        } else {
            let image_ref = ImageRef::parse(reference)?;
            match image_ref.digest {
                Some(digest) => digest,
                None => {
                    let name = image_ref
                        .name()
                        .ok_or_else(|| CaskError::InvalidReference(reference.to_string()))?;
                    self.tags.resolve(&name).await?
                }
            }
        };
        let manifest = self.manifests.resolve(&digest).await?;
        Ok((digest, manifest))
    }

    /// Build and cache the instance's union view if it isn't assembled yet.
    async fn ensure_view(&self, id: &str) -> Result<()> {
        let stack = {
            let instances = self.instances.read().await;
            let instance = instances
                .get(id)
                .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
            if instance.view.is_some() {
                return Ok(());
            }
            instance.manifest.layers.clone()
        };

        let view = UnionView::assemble(&self.layers, &stack).await?;

        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| CaskError::NotFound(format!("container {}", id)))?;
        if instance.view.is_none() {
            instance.view = Some(view);
        }
        Ok(())
    }

    async fn discard_handle(&self, handle: Option<Box<dyn ProcessHandle>>) {
        if let Some(mut handle) = handle {
            let _ = handle.kill().await;
        }
    }

    fn rootfs_dir(&self, id: &str) -> PathBuf {
        self.containers_dir.join(id).join("rootfs")
    }
}

/// `ensure_view` runs before every view access, and nothing clears a view
/// short of removing the instance; hitting this is a bug.
fn missing_view(id: &str) -> CaskError {
    CaskError::Other(format!("container {} has no assembled view", id))
}

fn summarize(instance: &ContainerInstance) -> ContainerSummary {
    ContainerSummary {
        id: instance.id.clone(),
        manifest_digest: instance.manifest_digest.clone(),
        state: instance.state,
        exit_status: instance.exit_status,
        created_at: instance.created_at,
    }
}
