//! Structural validation of generated models

use crate::load::load_model;
use crate::types::{LoadedModel, MeshBounds};
use kiln_core::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Files above this size still validate but carry a warning
pub const LARGE_FILE_WARN_BYTES: u64 = 100 * 1024 * 1024;

/// Validation outcome for a model file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshReport {
    pub valid: bool,
    pub file_size_bytes: u64,
    pub vertex_count: usize,
    pub triangle_count: usize,
    pub primitive_count: usize,
    pub material_count: usize,
    pub bounds: Option<MeshBounds>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl MeshReport {
    pub fn file_size_mb(&self) -> f64 {
        self.file_size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Check that a file exists, parses as glTF, and holds triangle geometry.
///
/// Problems are reported in `errors` with `valid` unset rather than as an
/// `Err`.
pub fn validate_mesh<P: AsRef<Path>>(path: P) -> MeshReport {
    let path = path.as_ref();
    match inspect(path) {
        Ok((report, _)) => report,
        Err(e) => MeshReport {
            file_size_bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            errors: vec![e.to_string()],
            ..Default::default()
        },
    }
}

pub(crate) fn inspect(path: &Path) -> Result<(MeshReport, LoadedModel)> {
    let file_size_bytes = std::fs::metadata(path)
        .map_err(|e| KilnError::Import(format!("Cannot read {}: {}", path.display(), e)))?
        .len();

    let model = load_model(path)?;
    if model.triangle_count() == 0 {
        return Err(KilnError::Import(format!(
            "No triangle geometry found in {}",
            path.display()
        )));
    }

    let mut warnings = model.warnings.clone();
    if file_size_bytes > LARGE_FILE_WARN_BYTES {
        let mb = file_size_bytes as f64 / (1024.0 * 1024.0);
        tracing::warn!(path = %path.display(), size_mb = mb, "Large model file");
        warnings.push(format!("Large file size: {:.1}MB", mb));
    }

    let report = MeshReport {
        valid: true,
        file_size_bytes,
        vertex_count: model.vertex_count(),
        triangle_count: model.triangle_count(),
        primitive_count: model.primitives.len(),
        material_count: model.used_material_count(),
        bounds: model.bounds(),
        errors: Vec::new(),
        warnings,
    };
    Ok((report, model))
}
