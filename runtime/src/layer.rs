//! Layer model — immutable filesystem deltas.
//!
//! A layer is an ordered set of filesystem mutation records relative to its
//! parent (or to an empty root if it has none): path writes with content, and
//! whiteouts marking a path deleted. Mutation sets are kept in a `BTreeMap`
//! so the canonical serialization is stable and the layer's digest is a pure
//! function of its content.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cask_core::digest::Digest;
use cask_core::error::Result;

/// A single mutation record for a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChange {
    /// The path exists with this content.
    Write { content: Vec<u8> },
    /// The path is deleted relative to lower layers.
    Whiteout,
}

/// An ordered set of filesystem mutation records, keyed by normalized
/// absolute path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationSet {
    entries: BTreeMap<String, FileChange>,
}

impl MutationSet {
    /// An empty mutation set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write of `content` at `path`.
    pub fn write(&mut self, path: &str, content: impl Into<Vec<u8>>) {
        self.entries.insert(
            normalize_path(path),
            FileChange::Write {
                content: content.into(),
            },
        );
    }

    /// Record a whiteout (deletion tombstone) at `path`.
    pub fn whiteout(&mut self, path: &str) {
        self.entries.insert(normalize_path(path), FileChange::Whiteout);
    }

    /// Drop any record for `path`. Returns the removed record.
    pub fn remove_entry(&mut self, path: &str) -> Option<FileChange> {
        self.entries.remove(&normalize_path(path))
    }

    /// Look up the record for `path`.
    pub fn get(&self, path: &str) -> Option<&FileChange> {
        self.entries.get(&normalize_path(path))
    }

    /// Iterate records in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileChange)> {
        self.entries.iter().map(|(p, c)| (p.as_str(), c))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalize a path to its canonical form: leading `/`, no empty or `.`
/// segments. `..` segments are dropped so a mutation set can never address
/// outside its root when materialized.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::from("/");
    for segment in path
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
    {
        normalized.push_str(segment);
        normalized.push('/');
    }
    if normalized.len() > 1 {
        normalized.pop();
    }
    normalized
}

/// An immutable layer as stored: the mutation set plus metadata.
///
/// The digest covers the canonical serialization of `(parent, changes)`;
/// `size_bytes` is the length of that serialization. Never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Content digest of the canonical serialization
    pub digest: Digest,

    /// Parent layer digest, if any
    pub parent: Option<Digest>,

    /// Size of the canonical serialization in bytes
    pub size_bytes: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// The mutation records
    pub changes: MutationSet,
}

/// The canonical document a layer digest is computed over.
#[derive(Serialize)]
struct CanonicalLayer<'a> {
    parent: Option<&'a Digest>,
    changes: &'a MutationSet,
}

/// Serialize a mutation set and its parent pointer deterministically.
///
/// Identical `(changes, parent)` inputs always yield identical bytes: the
/// mutation map is ordered, field order is fixed, and no volatile metadata
/// (timestamps, sizes) participates.
pub fn canonical_bytes(changes: &MutationSet, parent: Option<&Digest>) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&CanonicalLayer { parent, changes })?)
}

impl Layer {
    /// Build a layer record from a mutation set, computing its digest.
    pub fn seal(changes: MutationSet, parent: Option<Digest>) -> Result<Self> {
        let bytes = canonical_bytes(&changes, parent.as_ref())?;
        let digest = Digest::of_bytes(&bytes);
        Ok(Layer {
            digest,
            parent,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
            changes,
        })
    }

    /// Recompute the digest from the stored content.
    pub fn recompute_digest(&self) -> Result<Digest> {
        let bytes = canonical_bytes(&self.changes, self.parent.as_ref())?;
        Ok(Digest::of_bytes(&bytes))
    }
}
