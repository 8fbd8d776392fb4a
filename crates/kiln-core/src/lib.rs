//! Kiln Core - Foundational types for the Kiln asset generation engine
//!
//! This crate provides the core types that all other Kiln crates depend on:
//! - `ContentHash` - Streaming SHA-256 content hashing
//! - `Vec3` - Size and pivot vectors
//! - Error types and Result alias

mod error;
mod hash;
mod types;

pub use error::{KilnError, Result};
pub use hash::ContentHash;
pub use types::Vec3;
