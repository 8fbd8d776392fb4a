//! Batch generation
//!
//! Items are admitted through their own bounded pool on top of the
//! backend semaphore. A per-item failure is recorded, never raised; a batch
//! timeout stops admission but lets admitted items finish.

use crate::coordinator::{AssetResult, AssetStatus, GenerationCoordinator};
use crate::request::AssetRequest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// An item that did not produce a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub item_id: String,
    pub error: String,
}

/// Aggregated outcome of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub total: usize,
    /// Generated or cached items, in request order
    pub successes: Vec<AssetResult>,
    pub failures: Vec<BatchFailure>,
    /// `successes / total`; 0.0 for an empty batch
    pub success_rate: f64,
    pub cache_hit_count: usize,
    pub new_generation_count: usize,
    pub total_time_secs: f64,
}

impl BatchResult {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.item_id.as_str()).collect()
    }
}

impl GenerationCoordinator {
    /// Batch with the configured parallelism and timeout
    pub async fn run_batch(self: &Arc<Self>, requests: Vec<AssetRequest>) -> BatchResult {
        let max_parallel = self.config().generation.max_parallel;
        let timeout = self
            .config()
            .generation
            .batch_timeout_secs
            .map(Duration::from_secs);
        self.generate_batch(requests, max_parallel, timeout).await
    }

    /// Generate every request with at most `max_parallel` in flight
    pub async fn generate_batch(
        self: &Arc<Self>,
        requests: Vec<AssetRequest>,
        max_parallel: usize,
        batch_timeout: Option<Duration>,
    ) -> BatchResult {
        let start = Instant::now();
        let batch_id = uuid::Uuid::new_v4().to_string();
        let total = requests.len();
        let limiter = Arc::new(Semaphore::new(max_parallel.max(1)));
        let deadline = batch_timeout.map(|t| tokio::time::Instant::now() + t);

        tracing::info!(batch_id = %batch_id, total, max_parallel, "Starting batch");

        let mut handles = Vec::with_capacity(total);
        let mut not_started = Vec::new();
        let mut pending = requests.into_iter();

        while let Some(request) = pending.next() {
            let Some(permit) = admit(&limiter, deadline).await else {
                tracing::warn!(
                    batch_id = %batch_id,
                    remaining = pending.len() + 1,
                    "Batch timeout reached, not admitting further items"
                );
                not_started.push(request.id);
                not_started.extend(pending.by_ref().map(|r| r.id));
                break;
            };

            let coordinator = Arc::clone(self);
            let item_id = request.id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                coordinator.generate(request).await
            });
            handles.push((item_id, handle));
        }

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        let mut cache_hit_count = 0;
        let mut new_generation_count = 0;

        for (item_id, handle) in handles {
            match handle.await {
                Ok(result) => match result.status {
                    AssetStatus::Success => {
                        new_generation_count += 1;
                        successes.push(result);
                    }
                    AssetStatus::Cached => {
                        cache_hit_count += 1;
                        successes.push(result);
                    }
                    AssetStatus::Failed => failures.push(BatchFailure {
                        item_id,
                        error: result.message.unwrap_or_else(|| "generation failed".into()),
                    }),
                },
                Err(e) => failures.push(BatchFailure {
                    item_id,
                    error: format!("task aborted: {}", e),
                }),
            }
        }
        failures.extend(not_started.into_iter().map(|item_id| BatchFailure {
            item_id,
            error: "batch timed out before the item started".to_string(),
        }));

        let success_rate = if total == 0 {
            0.0
        } else {
            successes.len() as f64 / total as f64
        };

        let result = BatchResult {
            batch_id,
            total,
            successes,
            failures,
            success_rate,
            cache_hit_count,
            new_generation_count,
            total_time_secs: start.elapsed().as_secs_f64(),
        };
        tracing::info!(
            batch_id = %result.batch_id,
            succeeded = result.successes.len(),
            failed = result.failures.len(),
            cached = result.cache_hit_count,
            secs = result.total_time_secs,
            "Batch complete"
        );
        result
    }
}

/// Wait for a slot unless the deadline passes first
async fn admit(
    limiter: &Arc<Semaphore>,
    deadline: Option<tokio::time::Instant>,
) -> Option<OwnedSemaphorePermit> {
    match deadline {
        Some(deadline) => {
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::timeout_at(deadline, Arc::clone(limiter).acquire_owned())
                .await
                .ok()?
                .ok()
        }
        None => Arc::clone(limiter).acquire_owned().await.ok(),
    }
}
