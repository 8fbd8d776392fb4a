//! Kiln Cache - content-addressed storage for generated models
//!
//! Artifacts are addressed by the hash of their source input plus the
//! generation parameters. A per-session layer sits in front of a shared
//! global layer that enforces a TTL and a byte cap.

mod index;
mod key;
mod store;
mod types;

pub use index::{CacheIndex, IndexEntry};
pub use key::{CacheKey, GenerationParams, ParamValue};
pub use store::{CacheSettings, CacheStore, EvictionReport};
pub use types::{ArtifactMetadata, CacheHit, CacheLayer, CacheStats, NormalizationSummary};
