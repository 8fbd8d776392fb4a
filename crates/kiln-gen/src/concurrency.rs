//! Job admission, tracking and temporary-resource ownership
//!
//! A counting semaphore bounds how many backend invocations run at once.
//! Jobs move from the active table (queued, then running) to the finished
//! table when they complete, fail or time out.

use chrono::{DateTime, Utc};
use kiln_core::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;

/// Status of a generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A tracked backend invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    /// Backend the job was assigned to
    pub backend: String,
    pub asset_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerationJob {
    pub fn new(backend: &str, asset_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            backend: backend.to_string(),
            asset_id: asset_id.to_string(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Wall time between start and finish
    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.finished_at?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Default)]
struct JobTables {
    active: HashMap<String, GenerationJob>,
    finished: HashMap<String, GenerationJob>,
}

impl JobTables {
    fn running(&self) -> usize {
        self.active
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }
}

/// Bounds concurrent generation and owns scratch directories
pub struct ConcurrencyManager {
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
    jobs: Mutex<JobTables>,
    peak: AtomicUsize,
    temp_root: PathBuf,
    temp_dirs: Mutex<HashSet<PathBuf>>,
}

impl ConcurrencyManager {
    pub fn new(max_parallel: usize, temp_root: impl Into<PathBuf>) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            jobs: Mutex::new(JobTables::default()),
            peak: AtomicUsize::new(0),
            temp_root: temp_root.into(),
            temp_dirs: Mutex::new(HashSet::new()),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Run `work` once a slot frees up, bounded by `timeout`.
    ///
    /// Waiting for a slot does not count against the timeout. On timeout
    /// the future is dropped and the job is recorded as failed.
    pub async fn run_job<T, F>(&self, job: GenerationJob, timeout: Duration, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let job_id = job.id.clone();
        let backend = job.backend.clone();
        self.tables().active.insert(job_id.clone(), job);
        // Settles the job as failed if this future is dropped early
        let guard = JobGuard {
            manager: self,
            job_id: job_id.clone(),
            settled: false,
        };

        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let err = KilnError::Generation("Job queue closed".to_string());
                guard.settle(Some(err.to_string()));
                return Err(err);
            }
        };

        {
            let mut tables = self.tables();
            if let Some(job) = tables.active.get_mut(&job_id) {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
            }
            let running = tables.running();
            self.peak.fetch_max(running, Ordering::SeqCst);
        }
        tracing::debug!(job_id = %job_id, backend = %backend, "Job started");

        let result = match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(KilnError::Timeout {
                what: format!("{} job {}", backend, job_id),
                secs: timeout.as_secs_f64(),
            }),
        };

        match &result {
            Ok(_) => guard.settle(None),
            Err(e) => guard.settle(Some(e.to_string())),
        }
        result
    }

    fn finish(&self, job_id: &str, error: Option<String>) {
        let mut tables = self.tables();
        if let Some(mut job) = tables.active.remove(job_id) {
            job.status = if error.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            job.finished_at = Some(Utc::now());
            job.error = error;
            tracing::debug!(
                job_id = %job.id,
                backend = %job.backend,
                status = ?job.status,
                "Job finished"
            );
            tables.finished.insert(job.id.clone(), job);
        }
    }

    /// Current snapshot of a job, active or finished
    pub fn job_status(&self, job_id: &str) -> Option<GenerationJob> {
        let tables = self.tables();
        tables
            .active
            .get(job_id)
            .or_else(|| tables.finished.get(job_id))
            .cloned()
    }

    pub fn running_count(&self) -> usize {
        self.tables().running()
    }

    pub fn queued_count(&self) -> usize {
        self.tables()
            .active
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .count()
    }

    /// Highest number of simultaneously running jobs observed
    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Finished jobs, most recent last
    pub fn finished_jobs(&self) -> Vec<GenerationJob> {
        let mut jobs: Vec<GenerationJob> = self.tables().finished.values().cloned().collect();
        jobs.sort_by_key(|j| j.finished_at);
        jobs
    }

    /// Drop finished jobs older than `retention`; returns how many went
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r));
        let Some(cutoff) = cutoff else {
            return 0;
        };

        let mut tables = self.tables();
        let before = tables.finished.len();
        tables
            .finished
            .retain(|_, job| job.finished_at.is_some_and(|t| t >= cutoff));
        before - tables.finished.len()
    }

    /// Create and track a scratch directory under the temp root
    pub fn create_temp_dir(&self, prefix: &str) -> Result<PathBuf> {
        let dir = self
            .temp_root
            .join(format!("{}_{}", prefix, uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir)?;
        self.temp_set().insert(dir.clone());
        Ok(dir)
    }

    /// Tracked scratch directory that is released when the handle drops
    pub fn scratch_dir(&self, prefix: &str) -> Result<ScratchDir<'_>> {
        let path = self.create_temp_dir(prefix)?;
        Ok(ScratchDir {
            manager: self,
            path,
        })
    }

    /// Delete a tracked path and stop tracking it
    pub fn release(&self, path: &Path) {
        self.temp_set().remove(path);
        remove_path(path);
    }

    /// Delete every tracked path; returns how many were tracked
    pub fn cleanup_all(&self) -> usize {
        let paths: Vec<PathBuf> = self.temp_set().drain().collect();
        for path in &paths {
            remove_path(path);
        }
        paths.len()
    }

    pub fn tracked_temp_count(&self) -> usize {
        self.temp_set().len()
    }

    /// Remove untracked entries in the temp root older than `max_age`
    pub fn sweep_orphans(&self, max_age: Duration) -> usize {
        let entries = match std::fs::read_dir(&self.temp_root) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let tracked = self.temp_set().clone();
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            if tracked.contains(&path) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age > max_age) {
                tracing::info!(path = %path.display(), "Removing orphaned temp entry");
                remove_path(&path);
                removed += 1;
            }
        }
        removed
    }

    fn tables(&self) -> MutexGuard<'_, JobTables> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn temp_set(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.temp_dirs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ConcurrencyManager {
    fn drop(&mut self) {
        let count = self.cleanup_all();
        if count > 0 {
            tracing::debug!(count, "Cleaned up temp directories on shutdown");
        }
    }
}

struct JobGuard<'a> {
    manager: &'a ConcurrencyManager,
    job_id: String,
    settled: bool,
}

impl JobGuard<'_> {
    fn settle(mut self, error: Option<String>) {
        self.settled = true;
        self.manager.finish(&self.job_id, error);
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(job_id = %self.job_id, "Job cancelled before completion");
            self.manager
                .finish(&self.job_id, Some("cancelled".to_string()));
        }
    }
}

/// A temp directory owned by one request
pub struct ScratchDir<'a> {
    manager: &'a ConcurrencyManager,
    path: PathBuf,
}

impl ScratchDir<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.path);
    }
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        return;
    };
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp path");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("kiln_jobs_test_{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let manager = ConcurrencyManager::new(2, scratch());
        let job = GenerationJob::new("mock", "chair");
        let id = job.id.clone();

        let value = manager
            .run_job(job, Duration::from_secs(5), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let job = manager.job_status(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert!(job.duration_secs().is_some());
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_recorded() {
        let manager = ConcurrencyManager::new(1, scratch());
        let job = GenerationJob::new("meshy", "lamp");
        let id = job.id.clone();

        let err = manager
            .run_job::<(), _>(job, Duration::from_secs(5), async {
                Err(KilnError::Generation("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        let job = manager.job_status(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let manager = ConcurrencyManager::new(1, scratch());
        let job = GenerationJob::new("slow", "rock");
        let id = job.id.clone();

        let err = manager
            .run_job::<(), _>(job, Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Timeout { .. }));
        assert_eq!(manager.job_status(&id).unwrap().status, JobStatus::Failed);
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_job_is_settled_as_cancelled() {
        let manager = ConcurrencyManager::new(1, scratch());
        let job = GenerationJob::new("slow", "statue");
        let id = job.id.clone();

        let outer = tokio::time::timeout(
            Duration::from_millis(50),
            manager.run_job::<(), _>(job, Duration::from_secs(30), async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        )
        .await;
        assert!(outer.is_err());

        assert_eq!(manager.running_count(), 0);
        let job = manager.job_status(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("cancelled"));

        // the slot was returned
        manager
            .run_job(GenerationJob::new("mock", "next"), Duration::from_secs(1), async { Ok(()) })
            .await
            .unwrap();
    }

    #[test]
    fn test_scratch_dir_released_on_drop() {
        let root = scratch();
        let manager = ConcurrencyManager::new(1, &root);
        let path = {
            let dir = manager.scratch_dir("job").unwrap();
            assert!(dir.path().is_dir());
            assert_eq!(manager.tracked_temp_count(), 1);
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(manager.tracked_temp_count(), 0);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_semaphore_bounds_running() {
        let manager = Arc::new(ConcurrencyManager::new(2, scratch()));
        let mut handles = Vec::new();
        for i in 0..6 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let job = GenerationJob::new("mock", &format!("a{}", i));
                manager
                    .run_job(job, Duration::from_secs(5), async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(manager.peak_running(), 2);
        assert_eq!(manager.finished_jobs().len(), 6);
    }

    #[tokio::test]
    async fn test_prune_finished() {
        let manager = ConcurrencyManager::new(1, scratch());
        manager
            .run_job(GenerationJob::new("mock", "x"), Duration::from_secs(1), async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(manager.prune_finished(Duration::from_secs(3600)), 0);
        assert_eq!(manager.prune_finished(Duration::ZERO), 1);
        assert!(manager.finished_jobs().is_empty());
    }

    #[test]
    fn test_temp_dirs_tracked_and_released() {
        let root = scratch();
        let manager = ConcurrencyManager::new(1, &root);

        let a = manager.create_temp_dir("job").unwrap();
        let b = manager.create_temp_dir("job").unwrap();
        assert!(a.is_dir() && b.is_dir());
        assert_eq!(manager.tracked_temp_count(), 2);

        manager.release(&a);
        assert!(!a.exists());
        assert_eq!(manager.cleanup_all(), 1);
        assert!(!b.exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_drop_cleans_tracked_dirs() {
        let root = scratch();
        let dir = {
            let manager = ConcurrencyManager::new(1, &root);
            manager.create_temp_dir("job").unwrap()
        };
        assert!(!dir.exists());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_sweep_orphans_skips_tracked() {
        let root = scratch();
        let manager = ConcurrencyManager::new(1, &root);
        let tracked = manager.create_temp_dir("live").unwrap();
        let orphan = root.join("crashed_job");
        std::fs::create_dir_all(&orphan).unwrap();

        assert_eq!(manager.sweep_orphans(Duration::from_secs(3600)), 0);
        assert!(orphan.exists());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(manager.sweep_orphans(Duration::from_millis(1)), 1);
        assert!(!orphan.exists());
        assert!(tracked.exists());

        drop(manager);
        std::fs::remove_dir_all(&root).ok();
    }
}
