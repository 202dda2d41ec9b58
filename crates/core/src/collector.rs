//! Result collection and failure classification.
//!
//! The collector awaits handles in dispatch order and tags each payload with the backend that
//! produced it. Classification rules:
//! - 504 or 408 from either backend is a hard timeout. Remaining handles are aborted and the
//!   whole pass fails with [`CoreError::Timeout`].
//! - Any other non-success status, an `OperationOutcome` body, or a `{"detail": ...}` body
//!   degrades that one library to [`RawPayload::Error`] and collection continues.

use crate::clients::BackendResponse;
use crate::constants::TIMEOUT_STATUS_CODES;
use crate::dispatch::{CorrelationId, TaskHandle};
use crate::{CoreError, CoreResult};
use fhir::{BackendKind, LibraryRef, OperationOutcome};

/// Backend-specific payload for one library, tagged at dispatch time.
#[derive(Clone, Debug, PartialEq)]
pub enum RawPayload {
    /// Named-entry collection from the structured-query backend.
    StructuredQuery(serde_json::Value),
    /// Flat record list from the text-analytics backend.
    TextAnalytics(serde_json::Value),
    /// The library failed; the body is kept for diagnostics only.
    Error(serde_json::Value),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawBackendResult {
    pub correlation: CorrelationId,
    pub library: LibraryRef,
    pub patient_id: String,
    pub payload: RawPayload,
}

/// Awaits every handle, in order.
///
/// # Errors
///
/// - [`CoreError::Timeout`] on a 504/408 from any library.
/// - [`CoreError::Transient`] if a handle yields a response for a different correlation id.
pub async fn collect(handles: Vec<TaskHandle>, patient_id: &str) -> CoreResult<Vec<RawBackendResult>> {
    let mut results = Vec::with_capacity(handles.len());
    let mut pending = handles.into_iter();

    while let Some(task) = pending.next() {
        let file_name = task.library.file_name();
        let payload = match task.handle.await {
            Err(join_error) => {
                tracing::error!("evaluation of {file_name} did not complete: {join_error}");
                RawPayload::Error(serde_json::Value::String(join_error.to_string()))
            }
            Ok((correlation, _)) if correlation != task.correlation => {
                pending.for_each(|rest| rest.abort());
                return Err(CoreError::Transient(format!(
                    "Result for {file_name} arrived with correlation {correlation}, expected {}",
                    task.correlation
                )));
            }
            Ok((_, Err(client_error))) => {
                if client_error.is_connection() {
                    tracing::error!("backend unreachable while evaluating {file_name}: {client_error}");
                } else {
                    tracing::error!("evaluation of {file_name} failed: {client_error}");
                }
                RawPayload::Error(serde_json::Value::String(client_error.to_string()))
            }
            Ok((_, Ok(response))) if TIMEOUT_STATUS_CODES.contains(&response.status) => {
                tracing::error!(
                    "There was an upstream request timeout for library {file_name} with status code {}",
                    response.status
                );
                pending.for_each(|rest| rest.abort());
                return Err(CoreError::Timeout(format!(
                    "There was an upstream request timeout for library {file_name} with status code {}",
                    response.status
                )));
            }
            Ok((_, Ok(response))) => classify(&task.library, response),
        };

        tracing::info!("Got result for {file_name}");
        results.push(RawBackendResult {
            correlation: task.correlation,
            library: task.library,
            patient_id: patient_id.to_owned(),
            payload,
        });
    }

    Ok(results)
}

fn classify(library: &LibraryRef, response: BackendResponse) -> RawPayload {
    let file_name = library.file_name();
    if !response.is_success() {
        tracing::error!(
            "There was an error for library {file_name} with status code {}",
            response.status
        );
        return RawPayload::Error(response.body);
    }
    let body = response.body;
    if OperationOutcome::is_outcome(&body) {
        tracing::error!("There were errors in {file_name}, see OperationOutcome: {body}");
        return RawPayload::Error(body);
    }
    if body.get("detail").is_some() {
        tracing::error!("{file_name} returned an error detail: {}", body["detail"]);
        return RawPayload::Error(body);
    }
    match library.kind {
        BackendKind::StructuredQuery => RawPayload::StructuredQuery(body),
        BackendKind::TextAnalytics => RawPayload::TextAnalytics(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientError;
    use crate::dispatch::TaskOutput;
    use serde_json::json;

    fn library(name: &str, kind: BackendKind) -> LibraryRef {
        LibraryRef {
            name: name.into(),
            kind,
        }
    }

    fn ready(id: u64, name: &str, kind: BackendKind, status: u16, body: serde_json::Value) -> TaskHandle {
        let correlation = CorrelationId::for_tests(id);
        let output: TaskOutput = (correlation, Ok(BackendResponse::new(status, body)));
        TaskHandle {
            correlation,
            library: library(name, kind),
            handle: tokio::spawn(async move { output }),
        }
    }

    #[tokio::test]
    async fn tags_payloads_by_backend() {
        let results = collect(
            vec![
                ready(1, "demographics", BackendKind::StructuredQuery, 200, json!({"resourceType": "Parameters"})),
                ready(2, "notes", BackendKind::TextAnalytics, 200, json!([])),
            ],
            "p1",
        )
        .await
        .expect("collect");

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].payload, RawPayload::StructuredQuery(_)));
        assert!(matches!(results[1].payload, RawPayload::TextAnalytics(_)));
        assert_eq!(results[1].patient_id, "p1");
    }

    #[tokio::test]
    async fn timeout_on_second_of_three_fails_the_pass() {
        let err = collect(
            vec![
                ready(1, "a", BackendKind::TextAnalytics, 200, json!([])),
                ready(2, "b", BackendKind::TextAnalytics, 504, json!(null)),
                ready(3, "c", BackendKind::TextAnalytics, 200, json!([])),
            ],
            "p1",
        )
        .await
        .expect_err("timeout");
        match err {
            CoreError::Timeout(msg) => assert!(msg.contains("b.nlpql")),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_payloads_degrade_one_library() {
        let results = collect(
            vec![
                ready(1, "a", BackendKind::StructuredQuery, 200, json!({"resourceType": "OperationOutcome", "issue": []})),
                ready(2, "b", BackendKind::StructuredQuery, 500, json!("boom")),
                ready(3, "c", BackendKind::StructuredQuery, 200, json!({"detail": "bad"})),
                ready(4, "d", BackendKind::StructuredQuery, 200, json!({"resourceType": "Parameters"})),
            ],
            "p1",
        )
        .await
        .expect("collect");

        assert!(matches!(results[0].payload, RawPayload::Error(_)));
        assert!(matches!(results[1].payload, RawPayload::Error(_)));
        assert!(matches!(results[2].payload, RawPayload::Error(_)));
        assert!(matches!(results[3].payload, RawPayload::StructuredQuery(_)));
    }

    #[tokio::test]
    async fn client_errors_degrade_one_library() {
        let correlation = CorrelationId::for_tests(9);
        let output: TaskOutput = (
            correlation,
            Err(ClientError::Connection {
                service: "structured-query backend",
                reason: "refused".into(),
            }),
        );
        let handle = TaskHandle {
            correlation,
            library: library("a", BackendKind::StructuredQuery),
            handle: tokio::spawn(async move { output }),
        };
        let results = collect(vec![handle], "p1").await.expect("collect");
        assert!(matches!(results[0].payload, RawPayload::Error(_)));
    }

    #[tokio::test]
    async fn detects_correlation_mismatch() {
        let mut handle = ready(1, "a", BackendKind::StructuredQuery, 200, json!({}));
        handle.correlation = CorrelationId::for_tests(2);
        let err = collect(vec![handle], "p1").await.expect_err("mismatch");
        assert!(matches!(err, CoreError::Transient(_)));
    }
}
