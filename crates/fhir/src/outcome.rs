//! `OperationOutcome` wire model.
//!
//! Every failure the orchestrator reports to a caller (synchronously, or as the stored result
//! of an async job) is an `OperationOutcome` with a single issue. The issue code carries the
//! failure class so callers can tell a missing parameter from a backend timeout.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// FHIR issue type codes used by the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum IssueCode {
    /// A required request element was absent.
    Required,
    /// A referenced resource (job package, library, patient, job) does not exist.
    NotFound,
    /// A backend or collaborator failed in a way that may succeed later.
    Transient,
    /// A backend reported an upstream timeout.
    Timeout,
    /// Content was present but not acceptable.
    Invalid,
    /// A request envelope was structurally wrong.
    Structure,
    Processing,
    Informational,
    Deleted,
    Exception,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OperationOutcomeIssue {
    pub severity: IssueSeverity,
    pub code: IssueCode,
    pub diagnostics: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    #[schema(example = "OperationOutcome")]
    pub resource_type: String,
    pub issue: Vec<OperationOutcomeIssue>,
}

impl OperationOutcome {
    /// An outcome with one error-severity issue.
    pub fn error(code: IssueCode, diagnostics: impl Into<String>) -> Self {
        Self::with_severity(IssueSeverity::Error, code, diagnostics)
    }

    /// An outcome with one issue of the given severity.
    pub fn with_severity(
        severity: IssueSeverity,
        code: IssueCode,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::from_issues(vec![OperationOutcomeIssue {
            severity,
            code,
            diagnostics: diagnostics.into(),
        }])
    }

    pub fn from_issues(issue: Vec<OperationOutcomeIssue>) -> Self {
        Self {
            resource_type: "OperationOutcome".into(),
            issue,
        }
    }

    /// The first issue, which is the one callers branch on.
    pub fn primary(&self) -> Option<&OperationOutcomeIssue> {
        self.issue.first()
    }

    /// Returns true if a JSON payload is shaped like an `OperationOutcome`.
    pub fn is_outcome(value: &serde_json::Value) -> bool {
        value.get("resourceType").and_then(serde_json::Value::as_str) == Some("OperationOutcome")
    }
}
