//! Generation coordinator
//!
//! Cache lookup, then the fallback chain under concurrency control, then
//! normalization, delivery and cache store. Every outcome is returned as an
//! [`AssetResult`]; nothing below validation escapes as an error.

use crate::backend::{BackendContext, GenerationBackend};
use crate::concurrency::{ConcurrencyManager, GenerationJob};
use crate::config::KilnConfig;
use crate::providers::blocking;
use crate::request::{AssetRequest, RequestSource, ResolvedRequest};
use crate::selector::BackendSelector;
use crate::stats::{GenerationStats, StatisticsReport};
use chrono::Utc;
use kiln_cache::{ArtifactMetadata, CacheStore, EvictionReport, NormalizationSummary};
use kiln_core::{KilnError, Result};
use kiln_mesh::{MeshNormalizer, MeshReport, NormalizeOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Orphaned temp entries older than this are swept by `maintain`
const ORPHAN_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Success,
    Cached,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// One backend tried for a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub backend: String,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub message: Option<String>,
    pub duration_secs: f64,
}

/// Status-bearing outcome of [`GenerationCoordinator::generate`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetResult {
    pub status: AssetStatus,
    pub asset_id: String,
    #[serde(default)]
    pub metadata: Option<ArtifactMetadata>,
    /// Human-readable reason on failure
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl AssetResult {
    fn failed(asset_id: String, message: String, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            status: AssetStatus::Failed,
            asset_id,
            metadata: None,
            message: Some(message),
            attempts,
        }
    }

    /// Success or cached
    pub fn is_ok(&self) -> bool {
        self.status != AssetStatus::Failed
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.metadata.as_ref()?.artifact_path.as_deref()
    }
}

/// What a `maintain` pass cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MaintenanceReport {
    pub eviction: EvictionReport,
    pub jobs_pruned: usize,
    pub orphans_removed: usize,
}

/// Ties cache, selector, concurrency manager and normalizer together.
///
/// Backends are only referenced through the selector; the coordinator owns
/// each request's temp directory until the request finishes.
pub struct GenerationCoordinator {
    config: KilnConfig,
    selector: Arc<BackendSelector>,
    cache: Arc<CacheStore>,
    jobs: Arc<ConcurrencyManager>,
    normalizer: MeshNormalizer,
    stats: Mutex<GenerationStats>,
}

impl GenerationCoordinator {
    pub fn new(config: KilnConfig, selector: Arc<BackendSelector>) -> Self {
        let cache = Arc::new(CacheStore::new(&config.workspace_root, &config.cache));
        let jobs = Arc::new(ConcurrencyManager::new(
            config.generation.max_parallel,
            config.temp_root(),
        ));
        Self {
            config,
            selector,
            cache,
            jobs,
            normalizer: MeshNormalizer::new(),
            stats: Mutex::new(GenerationStats::default()),
        }
    }

    /// Load the backends named in `config`, probe them, and build a
    /// coordinator around the result
    pub async fn from_config(config: KilnConfig) -> Result<Self> {
        config.validate()?;
        let selector = Arc::new(BackendSelector::load(&config));
        selector.probe().await;
        Ok(Self::new(config, selector))
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn selector(&self) -> &Arc<BackendSelector> {
        &self.selector
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn jobs(&self) -> &Arc<ConcurrencyManager> {
        &self.jobs
    }

    /// Re-read backend configuration and re-probe. Running requests keep
    /// the backends they already hold.
    pub async fn reload_backends(&self, config: &KilnConfig) {
        self.selector.reload(config).await;
    }

    /// Directory artifacts are delivered to
    pub fn asset_dir(&self, session: Option<&str>) -> PathBuf {
        match session {
            Some(sid) => self
                .config
                .workspace_root
                .join("sessions")
                .join(sid)
                .join("assets"),
            None => self.config.workspace_root.join("assets"),
        }
    }

    /// Produce one model
    pub async fn generate(&self, request: AssetRequest) -> AssetResult {
        let start = Instant::now();
        let asset_id = request.id.clone();

        let to_resolve = request.clone();
        let resolved = match blocking(move || to_resolve.resolve()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(asset_id = %asset_id, error = %e, "Rejected request");
                return AssetResult::failed(asset_id, e.to_string(), Vec::new());
            }
        };
        let session = request.session_id.clone();

        if !request.force_regenerate {
            let cache = Arc::clone(&self.cache);
            let key = resolved.key.clone();
            let sid = session.clone();
            match blocking(move || cache.lookup(&key, sid.as_deref())).await {
                Ok(Some(hit)) => {
                    self.stats().record_hit();
                    let mut metadata = hit.metadata;
                    metadata.artifact_path = Some(hit.path);
                    tracing::info!(
                        asset_id = %asset_id,
                        layer = %hit.layer,
                        cache_key = resolved.key.short(),
                        "Served from cache"
                    );
                    return AssetResult {
                        status: AssetStatus::Cached,
                        asset_id,
                        metadata: Some(metadata),
                        message: None,
                        attempts: Vec::new(),
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(asset_id = %asset_id, error = %e, "Cache lookup failed, generating");
                }
            }
        }

        let chain = self.selector.ordered_for(resolved.source.kind());
        if chain.is_empty() {
            self.stats().record_failed();
            let err = KilnError::BackendUnavailable(format!(
                "no available backend supports {} input",
                resolved.source.kind()
            ));
            tracing::error!(asset_id = %asset_id, error = %err, "Cannot generate");
            return AssetResult::failed(asset_id, err.to_string(), Vec::new());
        }

        let temp = match self.jobs.scratch_dir(&format!("job_{}", asset_id)) {
            Ok(dir) => dir,
            Err(e) => {
                self.stats().record_failed();
                return AssetResult::failed(asset_id, e.to_string(), Vec::new());
            }
        };

        let mut attempts = Vec::new();
        let outcome = self
            .produce(&request, &resolved, &chain, temp.path(), &mut attempts)
            .await;
        drop(temp);

        match outcome {
            Ok(metadata) => {
                self.stats().record_generated(start.elapsed().as_secs_f64());
                tracing::info!(
                    asset_id = %asset_id,
                    backend = %metadata.backend,
                    vertices = metadata.vertex_count,
                    secs = start.elapsed().as_secs_f64(),
                    "Generated asset"
                );
                AssetResult {
                    status: AssetStatus::Success,
                    asset_id,
                    metadata: Some(metadata),
                    message: None,
                    attempts,
                }
            }
            Err(e) => {
                self.stats().record_failed();
                tracing::error!(asset_id = %asset_id, error = %e, "Generation failed");
                AssetResult::failed(asset_id, e.to_string(), attempts)
            }
        }
    }

    /// Fallback chain, normalization, delivery, cache store
    async fn produce(
        &self,
        request: &AssetRequest,
        resolved: &ResolvedRequest,
        chain: &[Arc<dyn GenerationBackend>],
        temp: &Path,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<ArtifactMetadata> {
        let (raw_path, backend_meta) = self
            .run_chain(&request.id, resolved, chain, temp, attempts)
            .await?;

        let normalized = temp.join(format!("{}.glb", request.id));
        let options = NormalizeOptions {
            target_size: request.target_size,
            pivot: request.pivot,
            max_vertex_count: self.config.generation.max_vertex_count,
            enabled: true,
        };
        let constrained = request.target_size.is_some() || request.pivot.is_some();
        let normalizer = self.normalizer;
        let output = normalized.clone();
        let (report, summary) = blocking(move || {
            finish_artifact(normalizer, &raw_path, &output, &options, constrained)
        })
        .await?;

        let dest = self
            .asset_dir(request.session_id.as_deref())
            .join(format!("{}.glb", request.id));
        let metadata = ArtifactMetadata {
            asset_id: request.id.clone(),
            artifact_path: Some(dest.clone()),
            backend: backend_meta.backend_name,
            external_job_id: backend_meta.external_job_id,
            generation_time_secs: backend_meta.generation_time_secs,
            vertex_count: report.vertex_count,
            triangle_count: report.triangle_count,
            material_count: report.material_count,
            file_size_bytes: report.file_size_bytes,
            bounds: report.bounds.map(|b| [b.min, b.max]),
            created_at: Utc::now(),
            params: resolved.params.clone(),
            normalization: summary,
            served_from: None,
        };

        let cache = Arc::clone(&self.cache);
        let key = resolved.key.clone();
        let session = request.session_id.clone();
        let force = request.force_regenerate;
        let to_store = metadata.clone();
        blocking(move || {
            deliver(&normalized, &dest)?;
            let stored = if force {
                cache.replace(&key, &dest, &to_store, session.as_deref())
            } else {
                cache.store(&key, &dest, &to_store, session.as_deref())
            };
            if let Err(e) = stored {
                tracing::warn!(cache_key = key.short(), error = %e, "Failed to cache artifact");
            }
            Ok(())
        })
        .await?;

        Ok(metadata)
    }

    /// Try each backend in order until one yields an artifact
    async fn run_chain(
        &self,
        asset_id: &str,
        resolved: &ResolvedRequest,
        chain: &[Arc<dyn GenerationBackend>],
        temp: &Path,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<(PathBuf, crate::backend::BackendMetadata)> {
        let timeout = Duration::from_secs(self.config.generation.attempt_timeout_secs);
        let poll = Duration::from_secs(self.config.generation.poll_interval_secs);

        for backend in chain {
            let name = backend.name().to_string();
            let ctx = BackendContext::new(temp.join(&name), asset_id).with_poll_interval(poll);
            let job = GenerationJob::new(&name, asset_id);
            let job_id = job.id.clone();
            let attempt_start = Instant::now();

            tracing::info!(asset_id, backend = %name, job_id = %job_id, "Attempting generation");
            let work = match &resolved.source {
                RequestSource::Image(bytes) => {
                    backend.generate_from_image(bytes, &resolved.params, &ctx)
                }
                RequestSource::Prompt(prompt) => {
                    backend.generate_from_prompt(prompt, &resolved.params, &ctx)
                }
            };
            let result = match self.jobs.run_job(job, timeout, work).await {
                Ok(output) => match output.artifact.into_file(&ctx.artifact_path()) {
                    Ok(path) => self.check_raw(&name, path).await.map(|p| (p, output.metadata)),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            let elapsed = attempt_start.elapsed().as_secs_f64();

            match result {
                Ok((path, mut metadata)) => {
                    let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    self.stats().record_attempt(&name, true, elapsed, bytes);
                    attempts.push(AttemptRecord {
                        backend: name.clone(),
                        outcome: AttemptOutcome::Succeeded,
                        message: None,
                        duration_secs: elapsed,
                    });
                    if metadata.backend_name.is_empty() {
                        metadata.backend_name = name;
                    }
                    return Ok((path, metadata));
                }
                Err(e) => {
                    self.stats().record_attempt(&name, false, elapsed, 0);
                    let outcome = if matches!(e, KilnError::Timeout { .. }) {
                        AttemptOutcome::TimedOut
                    } else {
                        AttemptOutcome::Failed
                    };
                    tracing::warn!(
                        asset_id,
                        backend = %name,
                        error = %e,
                        "Backend attempt failed, trying next"
                    );
                    attempts.push(AttemptRecord {
                        backend: name,
                        outcome,
                        message: Some(e.to_string()),
                        duration_secs: elapsed,
                    });
                }
            }
        }

        let summary = attempts
            .iter()
            .map(|a| format!("{}: {}", a.backend, a.message.as_deref().unwrap_or("failed")))
            .collect::<Vec<_>>()
            .join("; ");
        Err(KilnError::Generation(format!(
            "all {} backends failed ({})",
            attempts.len(),
            summary
        )))
    }

    /// Reject a backend artifact that is not a usable model
    async fn check_raw(&self, backend: &str, path: PathBuf) -> Result<PathBuf> {
        let normalizer = self.normalizer;
        let target = path.clone();
        let report = blocking(move || Ok(normalizer.validate(&target))).await?;
        if report.valid {
            return Ok(path);
        }
        Err(KilnError::Generation(format!(
            "{} returned an invalid model: {}",
            backend,
            report.errors.join("; ")
        )))
    }

    /// Running totals only
    pub fn generation_stats(&self) -> GenerationStats {
        self.stats().clone()
    }

    /// Running totals plus global cache occupancy
    pub async fn statistics(&self) -> StatisticsReport {
        let cache = Arc::clone(&self.cache);
        let cache_stats = match blocking(move || cache.stats()).await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read cache statistics");
                Default::default()
            }
        };
        StatisticsReport {
            generation: self.generation_stats(),
            cache: cache_stats,
        }
    }

    /// Enforce the cache cap, prune old job records and sweep orphaned
    /// temp entries
    pub async fn maintain(&self) -> Result<MaintenanceReport> {
        let cache = Arc::clone(&self.cache);
        let eviction = blocking(move || cache.cleanup_if_needed()).await?;

        let retention = Duration::from_secs(self.config.generation.job_retention_hours * 3600);
        let jobs_pruned = self.jobs.prune_finished(retention);

        let jobs = Arc::clone(&self.jobs);
        let orphans_removed = blocking(move || Ok(jobs.sweep_orphans(ORPHAN_MAX_AGE))).await?;

        let report = MaintenanceReport {
            eviction,
            jobs_pruned,
            orphans_removed,
        };
        tracing::info!(
            evicted = report.eviction.entries_removed,
            bytes_freed = report.eviction.bytes_freed,
            jobs_pruned,
            orphans_removed,
            "Maintenance complete"
        );
        Ok(report)
    }

    fn stats(&self) -> MutexGuard<'_, GenerationStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Normalize when constraints were requested, otherwise copy through.
/// Nothing that fails validation leaves this function.
fn finish_artifact(
    normalizer: MeshNormalizer,
    raw: &Path,
    output: &Path,
    options: &NormalizeOptions,
    constrained: bool,
) -> Result<(MeshReport, Option<NormalizationSummary>)> {
    if !constrained {
        std::fs::copy(raw, output)?;
        let report = normalizer.validate(output);
        if !report.valid {
            return Err(KilnError::Normalization(format!(
                "Model failed validation: {}",
                report.errors.join("; ")
            )));
        }
        return Ok((report, None));
    }

    let normalized = normalizer.normalize(raw, output, options)?;
    if !normalized.validation.valid {
        return Err(KilnError::Normalization(format!(
            "Model failed validation: {}",
            normalized.validation.errors.join("; ")
        )));
    }
    let summary = NormalizationSummary {
        operations: normalized.operations.clone(),
        skipped: normalized.skipped,
        skip_reason: normalized.skip_reason.clone(),
        scale_factor: normalized.scale_factor,
    };
    Ok((normalized.validation, Some(summary)))
}

/// Copy into place through a temp file so readers never see a partial GLB
fn deliver(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension("glb.tmp");
    std::fs::copy(source, &tmp)?;
    std::fs::rename(&tmp, dest)?;
    Ok(())
}
