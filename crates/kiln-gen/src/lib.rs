//! Kiln Gen - cached, fault-tolerant 3D model generation
//!
//! Turns a reference image or a text prompt into a normalized GLB by way of
//! interchangeable backends. Results are content-addressed in a two-layer
//! cache, backends are tried in priority order until one succeeds, and a
//! semaphore bounds how many generations run at once.

pub mod backend;
pub mod batch;
pub mod concurrency;
pub mod config;
pub mod coordinator;
pub mod providers;
pub mod request;
pub mod selector;
pub mod stats;

pub use backend::{
    Artifact, BackendContext, BackendMetadata, BackendOutput, BoxFuture, Capabilities,
    GenerationBackend, SourceKind,
};
pub use batch::{BatchFailure, BatchResult};
pub use concurrency::{ConcurrencyManager, GenerationJob, JobStatus};
pub use config::{GenerationConfig, KilnConfig, ProviderConfig};
pub use coordinator::{
    AssetResult, AssetStatus, AttemptOutcome, AttemptRecord, GenerationCoordinator,
    MaintenanceReport,
};
pub use providers::mock::MockBackend;
pub use providers::{available_backends, create_backend};
pub use request::AssetRequest;
pub use selector::{BackendEntry, BackendSelector, BackendState};
pub use stats::{BackendStats, GenerationStats, StatisticsReport};
