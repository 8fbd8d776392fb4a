//! Backend registry
//!
//! Maps backend names to concrete implementations.

mod http;
pub mod meshy;
pub mod mock;
pub mod sf3d;

use crate::backend::GenerationBackend;
use crate::config::KilnConfig;
use kiln_core::{KilnError, Result};
use std::sync::Arc;

pub(crate) use http::blocking;

/// Create a backend by name with configuration
pub fn create_backend(name: &str, config: &KilnConfig) -> Result<Arc<dyn GenerationBackend>> {
    match name {
        "mock" => Ok(Arc::new(mock::MockBackend::new())),
        "meshy" => Ok(Arc::new(meshy::MeshyBackend::from_config(config)?)),
        "sf3d" => Ok(Arc::new(sf3d::Sf3dBackend::from_config(config)?)),
        _ => Err(KilnError::BackendUnavailable(format!(
            "Unknown backend '{}'. Available: {}",
            name,
            available_backends().join(", ")
        ))),
    }
}

/// List all built-in backend names
pub fn available_backends() -> Vec<&'static str> {
    vec!["meshy", "sf3d", "mock"]
}
