use fhir::{FhirError, IssueCode, OperationOutcome};

/// Failures that abort an orchestration pass.
///
/// Each variant maps onto one FHIR issue code; the message is reported verbatim as the
/// outcome's `diagnostics`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{0}")]
    Required(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Structure(String),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn issue_code(&self) -> IssueCode {
        match self {
            CoreError::Required(_) => IssueCode::Required,
            CoreError::NotFound(_) => IssueCode::NotFound,
            CoreError::Transient(_) => IssueCode::Transient,
            CoreError::Timeout(_) => IssueCode::Timeout,
            CoreError::Invalid(_) | CoreError::Config(_) => IssueCode::Invalid,
            CoreError::Structure(_) => IssueCode::Structure,
            CoreError::Store(_) => IssueCode::Exception,
        }
    }

    /// The error as a single-issue `OperationOutcome`.
    pub fn to_outcome(&self) -> OperationOutcome {
        OperationOutcome::error(self.issue_code(), self.to_string())
    }
}

impl From<FhirError> for CoreError {
    fn from(err: FhirError) -> Self {
        match err {
            FhirError::MissingParameter(_) => CoreError::Required(err.to_string()),
            FhirError::Structure(_) => CoreError::Structure(err.to_string()),
            FhirError::InvalidInput(_)
            | FhirError::InvalidJson(_)
            | FhirError::Translation(_)
            | FhirError::MissingContentType(_)
            | FhirError::UnsupportedContentType { .. }
            | FhirError::LibraryContent { .. } => CoreError::Invalid(err.to_string()),
        }
    }
}

/// Errors raised by [`crate::store::JobStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create job storage directory: {0}")]
    StorageDirCreation(std::io::Error),
    #[error("failed to write job file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to read job file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to serialize job: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize job: {0}")]
    Deserialization(serde_json::Error),
    #[error("job {0} was not found")]
    NotFound(String),
    #[error("job {0} is already complete")]
    AlreadyComplete(String),
    #[error("job store internal error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fhir_errors_map_to_issue_codes() {
        let err: CoreError = FhirError::MissingParameter("jobPackage".into()).into();
        assert_eq!(err.issue_code(), IssueCode::Required);
        assert_eq!(
            err.to_string(),
            "jobPackage was not found in the parameters posted"
        );

        let err: CoreError = FhirError::MissingContentType("demographics".into()).into();
        assert_eq!(err.issue_code(), IssueCode::Invalid);
    }

    #[test]
    fn outcome_carries_message_as_diagnostics() {
        let outcome = CoreError::Timeout("upstream timeout".into()).to_outcome();
        let issue = outcome.primary().expect("one issue");
        assert_eq!(issue.code, IssueCode::Timeout);
        assert_eq!(issue.diagnostics, "upstream timeout");
    }
}
