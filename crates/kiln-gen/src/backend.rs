//! Generation backend trait and its input/output types

use kiln_cache::GenerationParams;
use kiln_core::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

/// Boxed future so the backend trait stays object-safe
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a generation request starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Image,
    Prompt,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Image => write!(f, "image"),
            SourceKind::Prompt => write!(f, "prompt"),
        }
    }
}

/// Inputs a backend can accept and formats it can produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub image_to_3d: bool,
    pub text_to_3d: bool,
    pub formats: Vec<String>,
}

impl Capabilities {
    pub fn supports(&self, source: SourceKind) -> bool {
        match source {
            SourceKind::Image => self.image_to_3d,
            SourceKind::Prompt => self.text_to_3d,
        }
    }
}

/// Per-attempt context handed to a backend
#[derive(Debug, Clone)]
pub struct BackendContext {
    /// Job-scoped scratch directory; removed after the attempt
    pub output_dir: PathBuf,
    /// Interval between remote status polls
    pub poll_interval: Duration,
    /// Caller-chosen name for the artifact, without extension
    pub asset_name: String,
}

impl BackendContext {
    pub fn new(output_dir: impl Into<PathBuf>, asset_name: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            poll_interval: Duration::from_secs(3),
            asset_name: asset_name.into(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Where a backend should place its GLB
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.glb", self.asset_name))
    }
}

/// Raw model produced by a backend
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl Artifact {
    /// Ensure the artifact exists as a file, writing bytes to `fallback`
    pub fn into_file(self, fallback: &Path) -> Result<PathBuf> {
        match self {
            Artifact::Path(path) => {
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(KilnError::Generation(format!(
                        "Backend reported artifact {} but it does not exist",
                        path.display()
                    )))
                }
            }
            Artifact::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Err(KilnError::Generation("Backend returned an empty artifact".into()));
                }
                if let Some(parent) = fallback.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(fallback, bytes)?;
                Ok(fallback.to_path_buf())
            }
        }
    }
}

/// Provenance reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendMetadata {
    pub generation_time_secs: f64,
    pub backend_name: String,
    #[serde(default)]
    pub external_job_id: Option<String>,
}

/// Successful backend result
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    pub artifact: Artifact,
    pub metadata: BackendMetadata,
}

/// A 3D generation service.
///
/// Failures are returned as `Err(KilnError::Generation)`; the coordinator
/// moves on to the next backend.
pub trait GenerationBackend: Send + Sync {
    /// Registry name (e.g. "meshy", "sf3d", "mock")
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Lightweight reachability/credential check. Never errors.
    fn probe(&self) -> BoxFuture<'_, bool>;

    fn generate_from_image<'a>(
        &'a self,
        image: &'a [u8],
        params: &'a GenerationParams,
        ctx: &'a BackendContext,
    ) -> BoxFuture<'a, Result<BackendOutput>>;

    fn generate_from_prompt<'a>(
        &'a self,
        prompt: &'a str,
        params: &'a GenerationParams,
        ctx: &'a BackendContext,
    ) -> BoxFuture<'a, Result<BackendOutput>>;
}
