//! FHIR wire/boundary support for the results combining orchestrator.
//!
//! This crate provides **wire models** and **translation helpers** for the FHIR R4 resources
//! the orchestrator consumes and produces:
//! - job packages (`Questionnaire`) and computation libraries (`Library`)
//! - request and job-status envelopes (`Parameters`)
//! - the evidence bundle (`Bundle`) and the resources synthesized into it
//! - error reporting (`OperationOutcome`)
//!
//! Resources that are only passed through (for example a `Patient` returned by a backend) stay
//! as `serde_json::Value`; resources the orchestrator builds itself are strongly typed so their
//! invariants can be checked before they are serialized.

pub mod bundle;
pub mod datatypes;
pub mod library;
pub mod outcome;
pub mod parameters;
pub mod questionnaire;
pub mod resources;

// Re-export facades
pub use bundle::{Bundle, BundleEntry};
pub use library::Library;
pub use outcome::{IssueCode, IssueSeverity, OperationOutcome, OperationOutcomeIssue};
pub use parameters::{BatchJobRequest, Parameter, Parameters, PatientSelector, StartJobsRequest};
pub use questionnaire::{
    BackendKind, Cardinality, JobPackage, LibraryRef, Question, QuestionGroup, TaskReference,
};
pub use resources::Resource;

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("translation error: {0}")]
    Translation(String),

    /// A required request parameter was absent.
    #[error("{0} was not found in the parameters posted")]
    MissingParameter(String),

    /// A request envelope was present but malformed.
    #[error("{0}")]
    Structure(String),

    #[error(
        "Library with name {0} does not contain a content type in content[0].contentType"
    )]
    MissingContentType(String),

    #[error(
        "Library with name {library} was found but content[0].contentType was {content_type}, not text/cql or text/nlpql"
    )]
    UnsupportedContentType {
        library: String,
        content_type: String,
    },

    #[error("Library {library} content could not be decoded: {reason}")]
    LibraryContent { library: String, reason: String },
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;

/// `strftime` pattern for the second-precision UTC timestamps written on synthesized resources
/// (`YYYY-MM-DDTHH:MM:SSZ`).
pub const FHIR_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
