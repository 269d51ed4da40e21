//! Tag registry and image reference parsing.
//!
//! Tags are the one genuinely mutable entity in the model: a human-readable
//! `repository:tag` name pointing at a manifest digest. Re-assigning a tag is
//! an atomic pointer swap; the manifest it used to point at is untouched and
//! stays addressable by digest.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use cask_core::digest::Digest;
use cask_core::error::{CaskError, Result};

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
///
/// Supports formats:
/// - `myapp` → `myapp:latest`
/// - `myapp:v1` → `myapp:v1`
/// - `team/myapp:v1` → `team/myapp:v1`
/// - `myapp@sha256:<hex>` → digest reference, no tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Repository name (e.g., "myapp", "team/myapp")
    pub repository: String,
    /// Tag (e.g., "latest", "v1")
    pub tag: Option<String>,
    /// Manifest digest, for `@sha256:...` references
    pub digest: Option<Digest>,
}

impl ImageRef {
    /// Parse an image reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(CaskError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest_part)) => (name, Some(Digest::parse(digest_part)?)),
            None => (reference, None),
        };

        // Split tag on the last colon
        let (repository, tag) = match name_tag.rsplit_once(':') {
            Some((name, tag)) => (name.to_string(), Some(tag.to_string())),
            None => (name_tag.to_string(), None),
        };

        if repository.is_empty() {
            return Err(CaskError::InvalidReference(format!(
                "empty repository in reference '{}'",
                reference
            )));
        }
        if !repository
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c))
        {
            return Err(CaskError::InvalidReference(format!(
                "invalid repository name '{}'",
                repository
            )));
        }
        if let Some(ref tag) = tag {
            if tag.is_empty()
                || !tag
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
            {
                return Err(CaskError::InvalidReference(format!(
                    "invalid tag '{}' in reference '{}'",
                    tag, reference
                )));
            }
        }

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageRef {
            repository,
            tag,
            digest,
        })
    }

    /// The canonical `repository:tag` name, if this reference carries a tag.
    pub fn name(&self) -> Option<String> {
        self.tag
            .as_ref()
            .map(|tag| format!("{}:{}", self.repository, tag))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Persistent tag index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TagIndex {
    tags: std::collections::BTreeMap<String, Digest>,
}

/// Mutable mapping from `repository:tag` names to manifest digests.
///
/// `set` and `resolve` are linearizable: the in-memory map is updated under
/// a write lock before `set` returns, so a `resolve` that starts afterwards
/// observes the new value. The lock guards only the in-memory update, never
/// disk I/O.
pub struct TagRegistry {
    path: PathBuf,
    tags: RwLock<HashMap<String, Digest>>,
}

impl TagRegistry {
    /// Open a tag registry persisted at `dir/tags.json`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("tags.json");

        let mut tags = HashMap::new();
        if path.is_file() {
            let bytes = tokio::fs::read(&path).await?;
            let index: TagIndex = serde_json::from_slice(&bytes)?;
            tags.extend(index.tags);
        }

        Ok(Self {
            path,
            tags: RwLock::new(tags),
        })
    }

    /// Point `name` at `digest`, atomically replacing any previous mapping.
    ///
    /// Returns the previous digest, if the tag existed. The previous manifest
    /// is not deleted — it remains addressable by digest.
    pub async fn set(&self, name: &str, digest: Digest) -> Result<Option<Digest>> {
        let name = canonical_name(name)?;
        let previous = {
            let mut tags = self.tags.write();
            tags.insert(name.clone(), digest.clone())
        };
        self.save().await?;

        tracing::debug!(tag = %name, digest = %digest, "tag set");
        Ok(previous)
    }

    /// Resolve `name` to its manifest digest.
    pub async fn resolve(&self, name: &str) -> Result<Digest> {
        let name = canonical_name(name)?;
        let tags = self.tags.read();
        tags.get(&name)
            .cloned()
            .ok_or_else(|| CaskError::NotFound(format!("tag {}", name)))
    }

    /// Delete the mapping for `name`.
    ///
    /// Does not cascade to the manifest or its layers.
    pub async fn remove(&self, name: &str) -> Result<Digest> {
        let name = canonical_name(name)?;
        let removed = {
            let mut tags = self.tags.write();
            tags.remove(&name)
        };
        let digest = removed.ok_or_else(|| CaskError::NotFound(format!("tag {}", name)))?;
        self.save().await?;

        tracing::debug!(tag = %name, "tag removed");
        Ok(digest)
    }

    /// All tag names, optionally filtered by repository prefix.
    ///
    /// Order is not guaranteed.
    pub fn list(&self, prefix: Option<&str>) -> Vec<String> {
        let tags = self.tags.read();
        tags.keys()
            .filter(|name| prefix.map_or(true, |p| name.starts_with(p)))
            .cloned()
            .collect()
    }

    /// All digests currently pointed at by some tag.
    pub fn referenced_digests(&self) -> Vec<Digest> {
        self.tags.read().values().cloned().collect()
    }

    /// Whether any tag points at `digest`.
    pub fn references(&self, digest: &Digest) -> bool {
        self.tags.read().values().any(|d| d == digest)
    }

    /// Persist the tag index. Called after the lock is dropped.
    async fn save(&self) -> Result<()> {
        let snapshot: std::collections::BTreeMap<String, Digest> = {
            let tags = self.tags.read();
            tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let bytes = serde_json::to_vec_pretty(&TagIndex { tags: snapshot })?;
        crate::store::write_atomic(&self.path, bytes).await
    }
}

/// Normalize a tag name to `repository:tag`, applying the default tag.
fn canonical_name(name: &str) -> Result<String> {
    let image_ref = ImageRef::parse(name)?;
    if image_ref.digest.is_some() {
        return Err(CaskError::InvalidReference(format!(
            "digest references cannot name a tag: '{}'",
            name
        )));
    }
    image_ref
        .name()
        .ok_or_else(|| CaskError::InvalidReference(format!("reference '{}' has no tag", name)))
}
