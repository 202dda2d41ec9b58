//! Identifier and sharded-path utilities.
//!
//! Jobs and batch jobs are persisted under sharded directories derived from their identifier.
//! To keep path derivation deterministic, store identifiers use a *canonical* UUID form:
//! **32 lowercase hexadecimal characters** (no hyphens).
//!
//! This crate provides:
//! - [`JobUuid`], a wrapper that guarantees the canonical format once constructed.
//! - [`new_resource_id`], which allocates ids for synthesized FHIR resources and bundles.
//!
//! ## Sharded directory layout
//! For a canonical UUID `u`, job records live under:
//! `parent_dir/<u[0..2]>/<u[2..4]>/<u>/`
//!
//! Example:
//! `job_data/jobs/55/0e/550e8400e29b41d4a716446655440000/job.json`
//!
//! Sharding keeps any single directory from growing without bound as jobs accumulate.

mod service;

pub use service::{new_resource_id, JobUuid, Uuid};

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;
