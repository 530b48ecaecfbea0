// ABOUTME: File manifests and manifest diffing for incremental sync
// ABOUTME: Fingerprints are SHA-256 digests, stable across processes and releases

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Fingerprint of file content as lowercase hex SHA-256
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub content_hash: String,
    pub size_bytes: u64,
}

impl ManifestEntry {
    pub fn from_content(path: impl Into<String>, content: &[u8]) -> Self {
        Self {
            path: path.into(),
            content_hash: content_hash(content),
            size_bytes: content.len() as u64,
        }
    }
}

/// Snapshot of a file tree keyed by path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ManifestEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

impl FromIterator<ManifestEntry> for Manifest {
    fn from_iter<I: IntoIterator<Item = ManifestEntry>>(iter: I) -> Self {
        let mut manifest = Manifest::new();
        for entry in iter {
            manifest.insert(entry);
        }
        manifest
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestDiff {
    pub added_or_changed: Vec<String>,
    pub deleted: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added_or_changed.is_empty() && self.deleted.is_empty()
    }
}

/// Compare two snapshots. Both lists come back sorted by path.
pub fn diff_manifests(current: &Manifest, previous: &Manifest) -> ManifestDiff {
    let added_or_changed = current
        .entries
        .values()
        .filter(|entry| {
            previous
                .get(&entry.path)
                .map_or(true, |old| old.content_hash != entry.content_hash)
        })
        .map(|entry| entry.path.clone())
        .collect();

    let deleted = previous
        .paths()
        .filter(|path| current.get(path).is_none())
        .cloned()
        .collect();

    ManifestDiff {
        added_or_changed,
        deleted,
    }
}
