//! # RC-API Core
//!
//! Orchestration logic for the results combining service.
//!
//! A submission names a patient and a job package. The core resolves the package's libraries,
//! runs them concurrently on the structured-query and text-analytics backends, normalizes what
//! comes back and links it to the package's questions as an evidence `Bundle`:
//! - [`orchestrator`]: the pipeline and its sync, async and batch entry points
//! - [`dispatch`] / [`collector`]: bounded concurrent evaluation and failure classification
//! - [`normalizer`] / [`linker`]: flattening and answer synthesis
//! - [`store`]: persistence for async and batch jobs
//!
//! **No API concerns**: HTTP routing, request parsing and process setup belong in `api-rest`
//! and the `rcapi` CLI.

pub mod clients;
pub mod collector;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fakes;
pub mod job;
pub mod linker;
pub mod normalizer;
pub mod orchestrator;
pub mod store;
pub mod tuple;

pub use config::{core_config_from_lookup, CoreConfig, FhirAuth};
pub use error::{CoreError, CoreResult, StoreError, StoreResult};
pub use job::{BatchJob, BatchJobView, Job, JobResult, JobStatus};
pub use orchestrator::{Backends, Orchestrator};
pub use store::{FileJobStore, InMemoryJobStore, JobStore};
