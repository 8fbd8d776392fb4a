//! Two-layer artifact cache
//!
//! Layout under the workspace root:
//!
//! ```text
//! sessions/<session>/cache/index.json
//! sessions/<session>/cache/assets/<stem>.glb
//! caches/generated_assets/manifest.json
//! caches/generated_assets/<stem>.glb
//! ```

use crate::index::{CacheIndex, IndexEntry};
use crate::key::CacheKey;
use crate::types::{ArtifactMetadata, CacheHit, CacheLayer, CacheStats};
use kiln_core::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SECS_PER_DAY: f64 = 86_400.0;

/// Fraction of the byte cap the global layer is trimmed down to once the
/// cap is exceeded.
const EVICTION_TARGET_PERCENTAGE: f64 = 0.8;

const SESSION_INDEX: &str = "index.json";
const GLOBAL_INDEX: &str = "manifest.json";
const ARTIFACT_EXT: &str = "glb";

/// Global layer limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entries older than this are purged on access; 0 disables expiry
    pub ttl_days: u32,
    /// Byte cap in MiB; 0 disables eviction
    pub max_size_mb: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            max_size_mb: 10_240,
        }
    }
}

impl CacheSettings {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}

/// Result of a cap enforcement pass
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvictionReport {
    pub entries_removed: usize,
    pub bytes_freed: u64,
    pub size_before: u64,
    pub size_after: u64,
}

/// Session and global cache layers rooted at a workspace directory.
///
/// All index reads and read-modify-write cycles go through one mutex, so
/// concurrent stores of different keys never lose each other's entries.
/// Methods block on file I/O; async callers should use a blocking worker.
pub struct CacheStore {
    root: PathBuf,
    ttl_days: u32,
    max_size_bytes: u64,
    /// Read-through copies of index files, keyed by index path
    indexes: Mutex<HashMap<PathBuf, CacheIndex>>,
}

impl CacheStore {
    pub fn new<P: AsRef<Path>>(root: P, settings: &CacheSettings) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ttl_days: settings.ttl_days,
            max_size_bytes: settings.max_size_bytes(),
            indexes: Mutex::new(HashMap::new()),
        }
    }

    /// Override the byte cap with an exact value
    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session: &str) -> PathBuf {
        self.root.join("sessions").join(session).join("cache")
    }

    pub fn global_dir(&self) -> PathBuf {
        self.root.join("caches").join("generated_assets")
    }

    /// Look a key up in the session layer, then the global layer.
    ///
    /// Entries whose artifact file has disappeared are purged and count as
    /// a miss. A global hit is copied into the session layer.
    pub fn lookup(&self, key: &CacheKey, session: Option<&str>) -> Result<Option<CacheHit>> {
        if let Some(sid) = session {
            check_session_id(sid)?;
        }
        let mut indexes = self.lock()?;
        let now = now_secs();

        if let Some(sid) = session {
            let dir = self.session_dir(sid);
            let index_path = dir.join(SESSION_INDEX);
            let index = loaded(&mut indexes, &index_path);

            if let Some(entry) = index.get(key.as_str()) {
                let artifact = dir.join(&entry.relative_path);
                if artifact.is_file() {
                    let mut metadata = entry.metadata.clone();
                    metadata.served_from = Some(CacheLayer::Session);
                    tracing::info!(session = sid, cache_key = key.short(), "Session cache hit");
                    return Ok(Some(CacheHit {
                        path: artifact,
                        metadata,
                        layer: CacheLayer::Session,
                    }));
                }
                tracing::warn!(
                    session = sid,
                    cache_key = key.short(),
                    path = %artifact.display(),
                    "Session cache entry lost its artifact, purging"
                );
                index.remove(key.as_str());
                index.save(&index_path)?;
            }
        }

        let global_dir = self.global_dir();
        let index_path = global_dir.join(GLOBAL_INDEX);
        let index = self.global_index(&mut indexes, now)?;

        let hit = match index.get_mut(key.as_str()) {
            Some(entry) => {
                let artifact = global_dir.join(&entry.relative_path);
                if artifact.is_file() {
                    entry.usage_count += 1;
                    entry.last_accessed = now;
                    Some((artifact, entry.metadata.clone()))
                } else {
                    None
                }
            }
            None => {
                tracing::debug!(cache_key = key.short(), "Cache miss");
                return Ok(None);
            }
        };

        let Some((artifact, mut metadata)) = hit else {
            tracing::warn!(
                cache_key = key.short(),
                "Global cache entry lost its artifact, purging"
            );
            index.remove(key.as_str());
            index.save(&index_path)?;
            return Ok(None);
        };
        index.save(&index_path)?;
        tracing::info!(cache_key = key.short(), "Global cache hit");

        if let Some(sid) = session {
            if let Err(e) =
                self.put_session(&mut indexes, sid, key, &artifact, &metadata, now, false)
            {
                tracing::warn!(session = sid, error = %e, "Failed to replicate global hit into session");
            }
        }

        metadata.served_from = Some(CacheLayer::Global);
        Ok(Some(CacheHit {
            path: artifact,
            metadata,
            layer: CacheLayer::Global,
        }))
    }

    /// Add an artifact to the global layer and, when given, the session
    /// layer.
    ///
    /// If the key is already cached with an intact artifact, the existing
    /// artifact is kept and returned.
    pub fn store(
        &self,
        key: &CacheKey,
        artifact: &Path,
        metadata: &ArtifactMetadata,
        session: Option<&str>,
    ) -> Result<CacheHit> {
        self.put(key, artifact, metadata, session, false)
    }

    /// Like [`store`](Self::store), but overwrites any existing entry.
    pub fn replace(
        &self,
        key: &CacheKey,
        artifact: &Path,
        metadata: &ArtifactMetadata,
        session: Option<&str>,
    ) -> Result<CacheHit> {
        self.put(key, artifact, metadata, session, true)
    }

    fn put(
        &self,
        key: &CacheKey,
        artifact: &Path,
        metadata: &ArtifactMetadata,
        session: Option<&str>,
        overwrite: bool,
    ) -> Result<CacheHit> {
        if let Some(sid) = session {
            check_session_id(sid)?;
        }
        if !artifact.is_file() {
            return Err(KilnError::Cache(format!(
                "Artifact to cache does not exist: {}",
                artifact.display()
            )));
        }

        let hit = {
            let mut indexes = self.lock()?;
            let now = now_secs();

            let (global_path, stored) =
                self.put_global(&mut indexes, key, artifact, metadata, now, overwrite)?;

            match session {
                Some(sid) => {
                    let (path, stored) = self.put_session(
                        &mut indexes,
                        sid,
                        key,
                        &global_path,
                        &stored,
                        now,
                        overwrite,
                    )?;
                    CacheHit {
                        path,
                        metadata: stored,
                        layer: CacheLayer::Session,
                    }
                }
                None => CacheHit {
                    path: global_path,
                    metadata: stored,
                    layer: CacheLayer::Global,
                },
            }
        };
        tracing::info!(cache_key = key.short(), "Stored in cache");

        if let Err(e) = self.cleanup_if_needed() {
            tracing::warn!(error = %e, "Cache size enforcement failed");
        }
        Ok(hit)
    }

    #[allow(clippy::too_many_arguments)]
    fn put_session(
        &self,
        indexes: &mut HashMap<PathBuf, CacheIndex>,
        session: &str,
        key: &CacheKey,
        source: &Path,
        metadata: &ArtifactMetadata,
        now: f64,
        overwrite: bool,
    ) -> Result<(PathBuf, ArtifactMetadata)> {
        let dir = self.session_dir(session);
        let relative = format!("assets/{}.{}", key.file_stem(), ARTIFACT_EXT);
        put_entry(indexes, &dir, SESSION_INDEX, relative, key, source, metadata, now, overwrite)
    }

    fn put_global(
        &self,
        indexes: &mut HashMap<PathBuf, CacheIndex>,
        key: &CacheKey,
        source: &Path,
        metadata: &ArtifactMetadata,
        now: f64,
        overwrite: bool,
    ) -> Result<(PathBuf, ArtifactMetadata)> {
        // Loads and applies the TTL before inserting
        self.global_index(indexes, now)?;
        let relative = format!("{}.{}", key.file_stem(), ARTIFACT_EXT);
        put_entry(
            indexes,
            &self.global_dir(),
            GLOBAL_INDEX,
            relative,
            key,
            source,
            metadata,
            now,
            overwrite,
        )
    }

    /// Trim the global layer to 80% of its byte cap once the cap is
    /// exceeded, least recently used entries first.
    pub fn cleanup_if_needed(&self) -> Result<EvictionReport> {
        if self.max_size_bytes == 0 {
            return Ok(EvictionReport::default());
        }

        let mut indexes = self.lock()?;
        let global_dir = self.global_dir();
        let index_path = global_dir.join(GLOBAL_INDEX);
        let index = self.global_index(&mut indexes, now_secs())?;

        let mut candidates: Vec<(f64, u64, String, u64)> = index
            .iter()
            .map(|(key, entry)| {
                let size = std::fs::metadata(global_dir.join(&entry.relative_path))
                    .map(|m| m.len())
                    .unwrap_or(0);
                (entry.last_accessed, entry.usage_count, key.clone(), size)
            })
            .collect();

        let size_before: u64 = candidates.iter().map(|c| c.3).sum();
        let mut report = EvictionReport {
            size_before,
            size_after: size_before,
            ..Default::default()
        };
        if size_before <= self.max_size_bytes {
            return Ok(report);
        }

        tracing::info!(
            size_bytes = size_before,
            limit_bytes = self.max_size_bytes,
            "Global cache over limit, evicting"
        );

        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let target = (self.max_size_bytes as f64 * EVICTION_TARGET_PERCENTAGE) as u64;
        let mut total = size_before;
        for (_, _, key, size) in candidates {
            if total <= target {
                break;
            }
            if let Some(entry) = index.remove(&key) {
                let path = global_dir.join(&entry.relative_path);
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to delete evicted artifact");
                    }
                }
                total = total.saturating_sub(size);
                report.entries_removed += 1;
                report.bytes_freed += size;
            }
        }
        index.save(&index_path)?;
        report.size_after = total;

        tracing::info!(
            removed = report.entries_removed,
            freed_bytes = report.bytes_freed,
            "Cache eviction completed"
        );
        Ok(report)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut indexes = self.lock()?;
        let global_dir = self.global_dir();
        let index = self.global_index(&mut indexes, now_secs())?;

        let global_size_bytes = index
            .iter()
            .filter_map(|(_, e)| std::fs::metadata(global_dir.join(&e.relative_path)).ok())
            .map(|m| m.len())
            .sum();

        Ok(CacheStats {
            global_entries: index.len(),
            global_size_bytes,
            global_limit_bytes: self.max_size_bytes,
            ttl_days: self.ttl_days,
        })
    }

    /// The global index with expired entries and their files removed
    fn global_index<'a>(
        &self,
        indexes: &'a mut HashMap<PathBuf, CacheIndex>,
        now: f64,
    ) -> Result<&'a mut CacheIndex> {
        let global_dir = self.global_dir();
        let index_path = global_dir.join(GLOBAL_INDEX);
        let index = loaded(indexes, &index_path);

        if self.ttl_days == 0 {
            return Ok(index);
        }
        let expired = index.drain_expired(now, self.ttl_days as f64 * SECS_PER_DAY);
        if !expired.is_empty() {
            for (_, entry) in &expired {
                std::fs::remove_file(global_dir.join(&entry.relative_path)).ok();
            }
            index.save(&index_path)?;
            tracing::info!(count = expired.len(), "Purged expired global cache entries");
        }
        Ok(index)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, CacheIndex>>> {
        self.indexes
            .lock()
            .map_err(|_| KilnError::Cache("Cache index lock poisoned".into()))
    }
}

fn loaded<'a>(indexes: &'a mut HashMap<PathBuf, CacheIndex>, path: &Path) -> &'a mut CacheIndex {
    indexes
        .entry(path.to_path_buf())
        .or_insert_with(|| CacheIndex::load(path))
}

#[allow(clippy::too_many_arguments)]
fn put_entry(
    indexes: &mut HashMap<PathBuf, CacheIndex>,
    dir: &Path,
    index_name: &str,
    relative: String,
    key: &CacheKey,
    source: &Path,
    metadata: &ArtifactMetadata,
    now: f64,
    overwrite: bool,
) -> Result<(PathBuf, ArtifactMetadata)> {
    let index_path = dir.join(index_name);
    let index = loaded(indexes, &index_path);

    let previous_usage = match index.get(key.as_str()) {
        Some(existing) => {
            let existing_path = dir.join(&existing.relative_path);
            if !overwrite && existing_path.is_file() {
                tracing::debug!(cache_key = key.short(), "Key already cached, keeping first artifact");
                return Ok((existing_path, existing.metadata.clone()));
            }
            existing.usage_count
        }
        None => 0,
    };

    let dest = dir.join(&relative);
    copy_atomic(source, &dest)?;

    let mut stored = metadata.clone();
    stored.served_from = None;
    index.insert(
        key.as_str().to_string(),
        IndexEntry {
            relative_path: relative,
            metadata: stored.clone(),
            created_at: now,
            last_accessed: now,
            usage_count: previous_usage + 1,
        },
    );
    index.save(&index_path)?;
    Ok((dest, stored))
}

/// Copy `source` to `dest` through a temp file, skipping identical paths
fn copy_atomic(source: &Path, dest: &Path) -> Result<()> {
    if same_file(source, dest) {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension(format!("{}.tmp", ARTIFACT_EXT));
    std::fs::copy(source, &tmp)?;
    std::fs::rename(&tmp, dest)?;
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn check_session_id(session: &str) -> Result<()> {
    let bad = session.is_empty()
        || session == "."
        || session == ".."
        || session.contains(['/', '\\']);
    if bad {
        return Err(KilnError::Validation(format!(
            "Invalid session id: {:?}",
            session
        )));
    }
    Ok(())
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
