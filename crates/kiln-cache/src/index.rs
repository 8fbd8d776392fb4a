//! On-disk index documents

use crate::types::ArtifactMetadata;
use kiln_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One cached artifact as recorded in an index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Artifact location relative to the index file's directory
    pub relative_path: String,
    pub metadata: ArtifactMetadata,
    /// Unix seconds
    pub created_at: f64,
    /// Unix seconds
    pub last_accessed: f64,
    #[serde(default)]
    pub usage_count: u64,
}

/// Key-to-entry map persisted as a JSON object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheIndex {
    entries: BTreeMap<String, IndexEntry>,
}

impl CacheIndex {
    /// Load an index, treating a missing or unreadable file as empty
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read cache index");
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding corrupt cache index");
                Self::default()
            }
        }
    }

    /// Persist via write-to-temp then rename so readers never see a torn file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut IndexEntry> {
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, key: String, entry: IndexEntry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IndexEntry)> {
        self.entries.iter()
    }

    /// Remove entries created more than `ttl_secs` before `now`
    pub fn drain_expired(&mut self, now: f64, ttl_secs: f64) -> Vec<(String, IndexEntry)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now - e.created_at > ttl_secs)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e)))
            .collect()
    }
}
