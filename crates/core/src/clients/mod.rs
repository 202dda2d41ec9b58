//! Ports to the services the orchestrator depends on.
//!
//! Each collaborator sits behind an `async_trait` so the orchestrator can be exercised against
//! in-memory fakes in tests and against the HTTP clients in this module in production:
//! - [`StructuredQueryBackend`]: evaluates structured-query libraries for one patient
//! - [`TextAnalyticsBackend`]: registers and runs text-analytics libraries
//! - [`FormProvider`]: serves job packages
//! - [`LibraryRegistry`]: resolves library names to `Library` resources
//! - [`PatientDirectory`]: resolves patient identifiers and reads `Patient` resources

mod fhir_server;
mod structured;
mod text_analytics;

pub use fhir_server::ExternalFhirClient;
pub use structured::CqfRulerClient;
pub use text_analytics::NlpaasClient;

use crate::CoreResult;
use async_trait::async_trait;
use fhir::{JobPackage, Library, LibraryRef, Parameters};
use rc_types::IdentifierToken;

/// Errors from an outbound HTTP call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request itself failed (network, DNS, TLS, ...).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service could not be reached.
    #[error("could not connect to {service}: {reason}")]
    Connection {
        service: &'static str,
        reason: String,
    },

    /// The service answered with an unexpected status.
    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// The service answered 2xx with a body that could not be used.
    #[error("invalid response from {service}: {reason}")]
    InvalidResponse {
        service: &'static str,
        reason: String,
    },
}

impl ClientError {
    /// True when the failure happened before a response was received.
    pub fn is_connection(&self) -> bool {
        match self {
            ClientError::Request(err) => err.is_connect() || err.is_timeout(),
            ClientError::Connection { .. } => true,
            _ => false,
        }
    }
}

/// Status and JSON body of a backend evaluation.
///
/// Non-2xx responses are returned rather than raised so the collector can classify them.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl BackendResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 201)
    }
}

/// The structured-query (CQL) execution backend.
#[async_trait]
pub trait StructuredQueryBackend: Send + Sync {
    /// Evaluates every expression of one library against the patient named in `context`.
    async fn evaluate(
        &self,
        library_id: &str,
        context: &Parameters,
    ) -> Result<BackendResponse, ClientError>;

    /// Probes the backend; returns the HTTP status of its capability statement.
    async fn probe(&self) -> Result<u16, ClientError>;
}

/// The text-analytics (NLPQL) execution backend.
#[async_trait]
pub trait TextAnalyticsBackend: Send + Sync {
    /// Registers library source text; returns the run path relative to the backend base URL.
    async fn register(&self, source: &str) -> Result<String, ClientError>;

    /// Starts a registered run for one patient and waits for its records.
    async fn run(
        &self,
        run_path: &str,
        context: &serde_json::Value,
    ) -> Result<BackendResponse, ClientError>;

    async fn probe(&self) -> Result<u16, ClientError>;
}

/// Source of job packages.
#[async_trait]
pub trait FormProvider: Send + Sync {
    /// The named job package; the most recently updated one when `version` is `None`.
    ///
    /// # Errors
    ///
    /// [`crate::CoreError::NotFound`] if no package matches.
    async fn job_package(&self, name: &str, version: Option<&str>) -> CoreResult<JobPackage>;
}

/// Source of computation libraries.
#[async_trait]
pub trait LibraryRegistry: Send + Sync {
    /// Resolves a library reference to its `Library` resource.
    ///
    /// # Errors
    ///
    /// [`crate::CoreError::NotFound`] if the library does not exist and
    /// [`crate::CoreError::Transient`] if the registry could not be queried.
    async fn library(&self, library: &LibraryRef) -> CoreResult<Library>;
}

/// The external FHIR server holding patient data.
#[async_trait]
pub trait PatientDirectory: Send + Sync {
    /// Resolves a patient identifier to a server id.
    async fn resolve_identifier(&self, identifier: &IdentifierToken) -> CoreResult<String>;

    /// Reads a `Patient` resource, `None` if the server has no such patient.
    async fn patient(&self, patient_id: &str) -> CoreResult<Option<serde_json::Value>>;
}

/// Maps a non-2xx lookup status to a transient failure.
pub(crate) fn transient_status(what: &str, status: u16) -> crate::CoreError {
    crate::CoreError::Transient(format!(
        "Trying to {what} failed with status code {status}"
    ))
}
