//! Cached artifact metadata

use crate::key::GenerationParams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Which cache layer served a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayer {
    Session,
    Global,
}

impl fmt::Display for CacheLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheLayer::Session => write!(f, "session"),
            CacheLayer::Global => write!(f, "global"),
        }
    }
}

/// What normalization did to an artifact before it was cached
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSummary {
    pub operations: Vec<String>,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f32>,
}

/// Metadata persisted alongside every cached artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub asset_id: String,
    /// Permanent location the asset was delivered to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_job_id: Option<String>,
    pub generation_time_secs: f64,
    pub vertex_count: usize,
    pub triangle_count: usize,
    pub material_count: usize,
    pub file_size_bytes: u64,
    /// `[min, max]` corners of the final bounding box
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[[f32; 3]; 2]>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizationSummary>,
    /// Set on lookup results only
    #[serde(skip)]
    pub served_from: Option<CacheLayer>,
}

/// A successful cache lookup or store
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// Artifact file inside the cache
    pub path: PathBuf,
    pub metadata: ArtifactMetadata,
    pub layer: CacheLayer,
}

/// Global layer occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub global_entries: usize,
    pub global_size_bytes: u64,
    pub global_limit_bytes: u64,
    pub ttl_days: u32,
}

impl CacheStats {
    pub fn global_size_mb(&self) -> f64 {
        self.global_size_bytes as f64 / (1024.0 * 1024.0)
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries, {:.2} MB / {} MB, TTL {} days",
            self.global_entries,
            self.global_size_mb(),
            self.global_limit_bytes / (1024 * 1024),
            self.ttl_days
        )
    }
}
