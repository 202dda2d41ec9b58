//! Concurrent dispatch of library evaluations.
//!
//! Every library becomes one spawned tokio task holding a permit from a shared semaphore, so
//! no more than the configured number of backend requests are in flight at once. Each task
//! carries a [`CorrelationId`] that it hands back with its response; the collector checks it
//! so a response can never be attributed to the wrong library.

use crate::clients::{BackendResponse, ClientError, StructuredQueryBackend, TextAnalyticsBackend};
use crate::config::FhirAuth;
use crate::{CoreError, CoreResult};
use fhir::{Library, LibraryRef, Parameters};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Identifies one dispatched evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationId(u64);

impl CorrelationId {
    #[cfg(test)]
    pub(crate) fn for_tests(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a spawned evaluation resolves to.
pub type TaskOutput = (CorrelationId, Result<BackendResponse, ClientError>);

/// An in-flight evaluation of one library.
#[derive(Debug)]
pub struct TaskHandle {
    pub correlation: CorrelationId,
    pub library: LibraryRef,
    pub(crate) handle: JoinHandle<TaskOutput>,
}

impl TaskHandle {
    /// Stops the evaluation if it has not finished.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// A library resolved from the registry, ready to run.
#[derive(Clone, Debug)]
pub struct ResolvedLibrary {
    pub reference: LibraryRef,
    pub library: Library,
}

impl ResolvedLibrary {
    /// The server id used in the evaluate URL, falling back to the library name.
    pub fn evaluation_id(&self) -> &str {
        self.library
            .id
            .as_deref()
            .unwrap_or(self.reference.name.as_str())
    }
}

/// Patient and data-source context shared by every evaluation in one run.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    pub patient_id: String,
    pub data_endpoint: String,
    pub auth: Option<FhirAuth>,
}

impl DispatchContext {
    /// Body posted to start a text-analytics run.
    pub fn text_analytics_body(&self) -> serde_json::Value {
        let mut fhir = serde_json::json!({ "service_url": self.data_endpoint });
        if let Some(auth) = &self.auth {
            fhir["auth"] = serde_json::json!({
                "auth_type": auth.scheme(),
                "token": auth.token(),
            });
        }
        serde_json::json!({ "patient_id": self.patient_id, "fhir": fhir })
    }
}

pub struct Dispatcher {
    structured: Arc<dyn StructuredQueryBackend>,
    text_analytics: Option<Arc<dyn TextAnalyticsBackend>>,
    permits: Arc<Semaphore>,
    next_correlation: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        structured: Arc<dyn StructuredQueryBackend>,
        text_analytics: Option<Arc<dyn TextAnalyticsBackend>>,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            structured,
            text_analytics,
            permits: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            next_correlation: AtomicU64::new(1),
        }
    }

    pub fn text_analytics_enabled(&self) -> bool {
        self.text_analytics.is_some()
    }

    fn correlation(&self) -> CorrelationId {
        CorrelationId(self.next_correlation.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts one evaluation per structured-query library, in order.
    pub fn dispatch_structured(
        &self,
        libraries: &[ResolvedLibrary],
        context: &DispatchContext,
    ) -> Vec<TaskHandle> {
        let parameters = Arc::new(Parameters::evaluation_context(
            &context.patient_id,
            &context.data_endpoint,
            context.auth.as_ref().map(FhirAuth::header_value).as_deref(),
        ));

        libraries
            .iter()
            .map(|resolved| {
                let correlation = self.correlation();
                let backend = Arc::clone(&self.structured);
                let permits = Arc::clone(&self.permits);
                let parameters = Arc::clone(&parameters);
                let library_id = resolved.evaluation_id().to_owned();
                tracing::info!(
                    "dispatching {} ({correlation})",
                    resolved.reference.file_name()
                );

                let handle = tokio::spawn(async move {
                    let result = match permits.acquire_owned().await {
                        Ok(_permit) => backend.evaluate(&library_id, &parameters).await,
                        Err(_) => Err(pool_closed()),
                    };
                    (correlation, result)
                });
                TaskHandle {
                    correlation,
                    library: resolved.reference.clone(),
                    handle,
                }
            })
            .collect()
    }

    /// Registers each text-analytics library and starts its run.
    ///
    /// Registration happens inline, one library at a time. The first registration failure
    /// aborts every run already started and fails the whole dispatch.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Transient`] if the backend is unreachable, rejects a registration, or a
    ///   library's source text cannot be decoded.
    pub async fn dispatch_text_analytics(
        &self,
        libraries: &[ResolvedLibrary],
        context: &DispatchContext,
    ) -> CoreResult<Vec<TaskHandle>> {
        let Some(backend) = &self.text_analytics else {
            return Ok(Vec::new());
        };
        let body = Arc::new(context.text_analytics_body());

        let mut handles: Vec<TaskHandle> = Vec::with_capacity(libraries.len());
        for resolved in libraries {
            let registered = match resolved.library.source_text() {
                Ok(source) => backend
                    .register(&source)
                    .await
                    .map_err(registration_error),
                Err(e) => Err(CoreError::from(e)),
            };
            let run_path = match registered {
                Ok(path) => path,
                Err(err) => {
                    handles.iter().for_each(TaskHandle::abort);
                    return Err(err);
                }
            };

            let correlation = self.correlation();
            let backend = Arc::clone(backend);
            let permits = Arc::clone(&self.permits);
            let body = Arc::clone(&body);
            tracing::info!(
                "dispatching {} ({correlation}) to {run_path}",
                resolved.reference.file_name()
            );

            let handle = tokio::spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => backend.run(&run_path, &body).await,
                    Err(_) => Err(pool_closed()),
                };
                (correlation, result)
            });
            handles.push(TaskHandle {
                correlation,
                library: resolved.reference.clone(),
                handle,
            });
        }
        Ok(handles)
    }
}

fn pool_closed() -> ClientError {
    ClientError::Connection {
        service: "dispatcher",
        reason: "request pool closed".into(),
    }
}

fn registration_error(err: ClientError) -> CoreError {
    tracing::error!("registering a text-analytics library failed: {err}");
    match err {
        ClientError::Status { status, .. } => CoreError::Transient(format!(
            "Trying to register NLPQL with NLPaaS failed with code {status}"
        )),
        ClientError::InvalidResponse { reason, .. } => CoreError::Transient(format!(
            "NLPaaS registration returned an unusable response: {reason}"
        )),
        _ => CoreError::Transient(
            "There was an issue connecting to NLPaaS, see the logs for the full HTTP error. Most often, this means that the DNS name cannot be resolved."
                .into(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_analytics_body_includes_split_auth() {
        let context = DispatchContext {
            patient_id: "p1".into(),
            data_endpoint: "http://ehr/fhir/".into(),
            auth: Some(FhirAuth::parse("Bearer abc").expect("auth")),
        };
        assert_eq!(
            context.text_analytics_body(),
            serde_json::json!({
                "patient_id": "p1",
                "fhir": {
                    "service_url": "http://ehr/fhir/",
                    "auth": {"auth_type": "Bearer", "token": "abc"}
                }
            })
        );

        let context = DispatchContext { auth: None, ..context };
        assert!(context.text_analytics_body()["fhir"].get("auth").is_none());
    }

    #[test]
    fn registration_errors_are_transient() {
        let err = registration_error(ClientError::Status {
            service: "text-analytics backend",
            status: 500,
            body: String::new(),
        });
        assert_eq!(
            err.to_string(),
            "Trying to register NLPQL with NLPaaS failed with code 500"
        );
        assert_eq!(err.issue_code(), fhir::IssueCode::Transient);
    }
}
