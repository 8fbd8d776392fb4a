//! Mock backend for testing
//!
//! Writes a box GLB locally without any network calls. Availability,
//! failure, latency and capabilities are scriptable so selector, fallback
//! and concurrency behaviour can be exercised deterministically.

use crate::backend::*;
use kiln_cache::GenerationParams;
use kiln_core::{KilnError, Result, Vec3};
use kiln_mesh::{box_mesh, encode_glb, MaterialInfo};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the running counter when an attempt ends, even on timeout
struct RunningGuard(Arc<Counters>);

impl RunningGuard {
    fn enter(counters: &Arc<Counters>) -> Self {
        counters.calls.fetch_add(1, Ordering::SeqCst);
        let now = counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(counters))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A backend that produces placeholder boxes
#[derive(Debug, Clone)]
pub struct MockBackend {
    name: String,
    capabilities: Capabilities,
    available: bool,
    failure: Option<String>,
    delay: Duration,
    size: Vec3,
    payload: Option<Arc<Vec<u8>>>,
    counters: Arc<Counters>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            capabilities: Capabilities {
                image_to_3d: true,
                text_to_3d: true,
                formats: vec!["glb".to_string()],
            },
            available: true,
            failure: None,
            delay: Duration::ZERO,
            size: Vec3::ONE,
            payload: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Register under a different name (several mocks in one chain)
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Report unavailable from `probe()`
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Fail every generation with `message`
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Simulated generation latency
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Extents of the generated box
    pub fn with_size(mut self, size: Vec3) -> Self {
        self.size = size;
        self
    }

    /// Write `bytes` verbatim instead of a box model
    pub fn producing(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(Arc::new(bytes.into()));
        self
    }

    /// Number of generation calls received
    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    /// Highest number of generation calls observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    async fn run(&self, label: &str, ctx: &BackendContext) -> Result<BackendOutput> {
        let _guard = RunningGuard::enter(&self.counters);
        let start = Instant::now();

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(message) = &self.failure {
            return Err(KilnError::Generation(format!("{}: {}", self.name, message)));
        }

        let bytes = match &self.payload {
            Some(payload) => payload.as_ref().clone(),
            None => {
                let material = MaterialInfo {
                    name: label.to_string(),
                    ..MaterialInfo::default()
                };
                encode_glb(&box_mesh(self.size), &material)?
            }
        };

        let output_path = ctx.artifact_path();
        tokio::fs::create_dir_all(&ctx.output_dir).await?;
        tokio::fs::write(&output_path, &bytes).await?;

        tracing::debug!(backend = %self.name, path = %output_path.display(), "Mock artifact written");

        Ok(BackendOutput {
            artifact: Artifact::Path(output_path),
            metadata: BackendMetadata {
                generation_time_secs: start.elapsed().as_secs_f64(),
                backend_name: self.name.clone(),
                external_job_id: Some(format!("mock-{}", uuid::Uuid::new_v4())),
            },
        })
    }
}

impl GenerationBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn probe(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.available })
    }

    fn generate_from_image<'a>(
        &'a self,
        image: &'a [u8],
        _params: &'a GenerationParams,
        ctx: &'a BackendContext,
    ) -> BoxFuture<'a, Result<BackendOutput>> {
        Box::pin(async move {
            if image.is_empty() {
                return Err(KilnError::Generation("Empty image input".to_string()));
            }
            self.run("mock_image", ctx).await
        })
    }

    fn generate_from_prompt<'a>(
        &'a self,
        prompt: &'a str,
        _params: &'a GenerationParams,
        ctx: &'a BackendContext,
    ) -> BoxFuture<'a, Result<BackendOutput>> {
        Box::pin(async move {
            if prompt.trim().is_empty() {
                return Err(KilnError::Generation("Empty prompt".to_string()));
            }
            self.run("mock_prompt", ctx).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("kiln_mock_test_{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_generates_valid_glb() {
        let dir = scratch();
        let backend = MockBackend::new().with_size(Vec3::new(2.0, 1.0, 1.0));
        let ctx = BackendContext::new(&dir, "crate");

        let output = backend
            .generate_from_image(b"png", &GenerationParams::new(), &ctx)
            .await
            .unwrap();

        let Artifact::Path(path) = output.artifact else {
            panic!("expected a path artifact");
        };
        let report = kiln_mesh::validate_mesh(&path);
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.triangle_count, 12);
        assert_eq!(output.metadata.backend_name, "mock");
        assert_eq!(backend.calls(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_scripted_failure_and_probe() {
        let dir = scratch();
        let backend = MockBackend::new().named("broken").failing("quota exceeded").unavailable();
        let ctx = BackendContext::new(&dir, "x");

        assert!(!backend.probe().await);
        let err = backend
            .generate_from_prompt("a chair", &GenerationParams::new(), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(backend.calls(), 1);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_producing_writes_payload() {
        let dir = scratch();
        let backend = MockBackend::new().producing(b"not a model".to_vec());
        let ctx = BackendContext::new(&dir, "junk");

        let output = backend
            .generate_from_prompt("a chair", &GenerationParams::new(), &ctx)
            .await
            .unwrap();
        let Artifact::Path(path) = output.artifact else {
            panic!("expected a path artifact");
        };
        assert_eq!(std::fs::read(&path).unwrap(), b"not a model");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_peak_concurrency_tracked() {
        let dir = scratch();
        let backend = Arc::new(MockBackend::new().with_delay(Duration::from_millis(50)));

        let mut handles = Vec::new();
        for i in 0..3 {
            let backend = Arc::clone(&backend);
            let ctx = BackendContext::new(&dir, format!("m{}", i));
            handles.push(tokio::spawn(async move {
                backend
                    .generate_from_prompt("box", &GenerationParams::new(), &ctx)
                    .await
                    .map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.calls(), 3);
        assert!(backend.peak_concurrency() >= 2);
        assert!(backend.peak_concurrency() <= 3);

        std::fs::remove_dir_all(&dir).ok();
    }
}
