//! Top-level control flow.
//!
//! One pipeline, three entry points:
//! - [`Orchestrator::run_sync`] runs inline and returns the evidence bundle.
//! - [`Orchestrator::submit_async`] records an in-progress [`Job`], runs the pipeline on a
//!   background task and completes the job with its bundle or error outcome.
//! - [`Orchestrator::submit_batch`] fans a job package out into one async job per declared
//!   library and records a [`BatchJob`] listing them.
//!
//! The pipeline itself: resolve the patient, the job package and its libraries, dispatch to
//! both backends, collect, normalize, link.

use crate::clients::{
    CqfRulerClient, ExternalFhirClient, FormProvider, LibraryRegistry, NlpaasClient,
    PatientDirectory, StructuredQueryBackend, TextAnalyticsBackend,
};
use crate::collector::collect;
use crate::config::{CoreConfig, FhirAuth};
use crate::dispatch::{DispatchContext, Dispatcher, ResolvedLibrary, TaskHandle};
use crate::job::{BatchJob, BatchJobView, Job, JobResult};
use crate::linker::{link, LinkContext, LinkedEvidence};
use crate::normalizer::{normalize, NormalizedValue};
use crate::store::JobStore;
use crate::{CoreError, CoreResult};
use chrono::Utc;
use fhir::{
    BackendKind, BatchJobRequest, Bundle, IssueCode, IssueSeverity, JobPackage, LibraryRef,
    OperationOutcome, OperationOutcomeIssue, PatientSelector, StartJobsRequest,
};
use rc_types::NonEmptyText;
use rc_uuid::JobUuid;
use std::sync::Arc;

/// The collaborators an [`Orchestrator`] talks to.
#[derive(Clone)]
pub struct Backends {
    pub forms: Arc<dyn FormProvider>,
    pub libraries: Arc<dyn LibraryRegistry>,
    pub patients: Arc<dyn PatientDirectory>,
    pub structured: Arc<dyn StructuredQueryBackend>,
    /// `None` when the text-analytics backend is disabled.
    pub text_analytics: Option<Arc<dyn TextAnalyticsBackend>>,
}

impl Backends {
    /// HTTP clients for every collaborator named in `config`, sharing one connection pool.
    pub fn from_config(config: &CoreConfig) -> Self {
        let client = reqwest::Client::new();
        let cqf = Arc::new(CqfRulerClient::with_client(
            client.clone(),
            config.structured_query_url(),
        ));
        let patients = Arc::new(ExternalFhirClient::with_client(
            client.clone(),
            config.fhir_server_url(),
            config.fhir_server_auth().cloned(),
        ));
        let text_analytics = config.text_analytics_url().map(|url| {
            Arc::new(NlpaasClient::with_client(client.clone(), url)) as Arc<dyn TextAnalyticsBackend>
        });
        Self {
            forms: cqf.clone(),
            libraries: cqf.clone(),
            patients,
            structured: cqf,
            text_analytics,
        }
    }
}

pub struct Orchestrator {
    backends: Backends,
    dispatcher: Dispatcher,
    store: Arc<dyn JobStore>,
    fhir_server_url: String,
    fhir_server_auth: Option<FhirAuth>,
    deploy_url: String,
}

impl Orchestrator {
    pub fn new(config: &CoreConfig, backends: Backends, store: Arc<dyn JobStore>) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::clone(&backends.structured),
            backends.text_analytics.clone(),
            config.max_concurrent_requests(),
        );
        Self {
            backends,
            dispatcher,
            store,
            fhir_server_url: config.fhir_server_url().to_owned(),
            fhir_server_auth: config.fhir_server_auth().cloned(),
            deploy_url: config.deploy_url().to_owned(),
        }
    }

    /// Runs a submission inline.
    ///
    /// # Errors
    ///
    /// Any [`CoreError`] from parameter resolution, dispatch, collection (timeouts) or linking.
    pub async fn run_sync(&self, request: &StartJobsRequest) -> CoreResult<Bundle> {
        Ok(self.run_pipeline(request).await?.bundle)
    }

    /// Records an in-progress job and runs it in the background.
    ///
    /// The returned job is the `inProgress` record; poll [`Orchestrator::status`] for the
    /// result.
    pub async fn submit_async(self: &Arc<Self>, request: StartJobsRequest) -> CoreResult<Job> {
        let job = self
            .persist_new(Job::start(
                request.patient.value(),
                request.patient.kind(),
                request.job_package.as_str(),
            ))
            .await?;
        tracing::info!("Created new job with jobId {}", job.id);
        self.spawn_run(job.id.clone(), request);
        Ok(job)
    }

    /// Starts one async job per library the job package declares.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] if the job package does not exist.
    /// - [`CoreError::Invalid`] if it declares no libraries.
    pub async fn submit_batch(self: &Arc<Self>, request: BatchJobRequest) -> CoreResult<BatchJob> {
        let package = self
            .backends
            .forms
            .job_package(request.job_package.as_str(), None)
            .await?;
        if package.declared_libraries.is_empty() {
            return Err(no_libraries(&package));
        }

        let mut batch = BatchJob::new(request.patient_id.as_str(), request.job_package.as_str(), Vec::new());
        let mut runs: Vec<(JobUuid, StartJobsRequest)> = Vec::with_capacity(package.declared_libraries.len());
        for library in &package.declared_libraries {
            let mut child = Job::start(request.patient_id.as_str(), "id", request.job_package.as_str());
            child.parent_batch_id = Some(batch.id.clone());
            let child = self.persist_new(child).await?;

            let job = NonEmptyText::new(library.file_name())
                .map_err(|e| CoreError::Invalid(e.to_string()))?;
            runs.push((
                child.id.clone(),
                StartJobsRequest {
                    patient: PatientSelector::Id(request.patient_id.clone()),
                    job_package: request.job_package.clone(),
                    job: Some(job),
                    job_package_version: None,
                },
            ));
            batch.child_job_ids.push(child.id);
        }

        if !self.store.create_batch(&batch).await? {
            return Err(CoreError::Transient(format!(
                "Batch Job ID {} already exists",
                batch.id
            )));
        }
        tracing::info!(
            "Created batch job {} with {} child jobs",
            batch.id,
            batch.child_job_ids.len()
        );

        for (job_id, run) in runs {
            self.spawn_run(job_id, run);
        }
        Ok(batch)
    }

    /// Reads a job by id.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for an unknown or malformed id.
    pub async fn status(&self, id: &str) -> CoreResult<Job> {
        let not_found = || {
            CoreError::NotFound(format!(
                "The {id} job id was not found as an async job. Please try running the jobPackage again with a new job id."
            ))
        };
        let job_id = JobUuid::parse(id).map_err(|_| not_found())?;
        self.store.get(&job_id).await?.ok_or_else(not_found)
    }

    pub async fn list_jobs(&self) -> CoreResult<Vec<Job>> {
        Ok(self.store.list().await?)
    }

    /// Reads a batch with its children's current statuses.
    pub async fn batch_status(&self, id: &str) -> CoreResult<BatchJobView> {
        let not_found = || CoreError::NotFound(format!("Batch Job ID {id} was not found in the database"));
        let batch_id = JobUuid::parse(id).map_err(|_| not_found())?;
        self.store.batch_view(&batch_id).await?.ok_or_else(not_found)
    }

    /// Deletes a batch record; its child jobs are kept.
    pub async fn delete_batch(&self, id: &str) -> CoreResult<OperationOutcome> {
        let not_found = || CoreError::NotFound(format!("Batch Job ID {id} was not found in the database"));
        let batch_id = JobUuid::parse(id).map_err(|_| not_found())?;
        if !self.store.delete_batch(&batch_id).await? {
            return Err(not_found());
        }
        Ok(OperationOutcome::with_severity(
            IssueSeverity::Information,
            IssueCode::Deleted,
            format!("Batch Job ID {id} has been successfully deleted from the database"),
        ))
    }

    /// Probes both backends and reports one issue per backend plus an overall verdict.
    pub async fn health(&self) -> OperationOutcome {
        let mut issues = Vec::new();

        let structured_reason = match self.backends.structured.probe().await {
            Ok(200) => None,
            Ok(404) => Some(
                "CQF Ruler returned a 404, URL not found, ensure you used the correct URL in the environment variable CQF_RULER_R4".to_owned(),
            ),
            Ok(status) => Some(format!("CQF Ruler returned status code {status}")),
            Err(e) => {
                tracing::error!("Could not connect to CQF Ruler, requests will be unable to be completed: {e}");
                Some("Could not connect to CQF Ruler, ensure the service is running and the correct URL is provided in the environment variable CQF_RULER_R4".to_owned())
            }
        };
        match &structured_reason {
            None => issues.push(issue(
                IssueSeverity::Information,
                IssueCode::Informational,
                "CQF Ruler is up and running",
            )),
            Some(reason) => issues.push(issue(IssueSeverity::Error, IssueCode::Transient, reason)),
        }

        match &self.backends.text_analytics {
            Some(backend) => {
                let (severity, code, reason) = match backend.probe().await {
                    Ok(200) => (
                        IssueSeverity::Information,
                        IssueCode::Informational,
                        "NLPaaS is up and running".to_owned(),
                    ),
                    Ok(404) => (
                        IssueSeverity::Warning,
                        IssueCode::Transient,
                        "NLPaaS returned a 404, URL not found, ensure you used the correct URL in the environment variable NLPAAS_URL".to_owned(),
                    ),
                    Ok(status) => (
                        IssueSeverity::Warning,
                        IssueCode::Transient,
                        format!("NLPaaS returned status code {status}"),
                    ),
                    Err(e) => {
                        tracing::warn!("Could not connect to NLPaaS, NLP requests will be unable to be completed: {e}");
                        (
                            IssueSeverity::Warning,
                            IssueCode::Transient,
                            "Could not connect to NLPaaS, ensure the service is running and the correct URL is provided in the environment variable NLPAAS_URL".to_owned(),
                        )
                    }
                };
                issues.push(issue(severity, code, &reason));
            }
            None => issues.push(issue(
                IssueSeverity::Warning,
                IssueCode::Transient,
                "NLPAAS_URL not defined in environmental variables, no NLP jobs will be completed. Please set this variable if you want to run NLP jobs",
            )),
        }

        match structured_reason {
            None => issues.push(issue(
                IssueSeverity::Information,
                IssueCode::Informational,
                "RC-API is up and running",
            )),
            Some(reason) => issues.push(issue(
                IssueSeverity::Error,
                IssueCode::Transient,
                &format!("RC-API is not up and running because: {reason}"),
            )),
        }

        OperationOutcome::from_issues(issues)
    }

    // ------------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------------

    async fn run_pipeline(&self, request: &StartJobsRequest) -> CoreResult<LinkedEvidence> {
        let patient_id = self.resolve_patient(&request.patient).await?;
        let package = self
            .backends
            .forms
            .job_package(
                request.job_package.as_str(),
                request.job_package_version.as_ref().map(NonEmptyText::as_str),
            )
            .await?;
        let resolved = self.resolve_libraries(&package, request.job.as_ref()).await?;

        let (structured, text_analytics): (Vec<_>, Vec<_>) = resolved
            .into_iter()
            .partition(|r| r.reference.kind == BackendKind::StructuredQuery);
        if !text_analytics.is_empty() && !self.dispatcher.text_analytics_enabled() {
            tracing::warn!(
                "text-analytics backend is disabled, skipping {} NLPQL libraries",
                text_analytics.len()
            );
        }

        let context = DispatchContext {
            patient_id: patient_id.clone(),
            data_endpoint: self.fhir_server_url.clone(),
            auth: self.fhir_server_auth.clone(),
        };
        let mut handles = self.dispatcher.dispatch_structured(&structured, &context);
        match self
            .dispatcher
            .dispatch_text_analytics(&text_analytics, &context)
            .await
        {
            Ok(more) => handles.extend(more),
            Err(e) => {
                handles.iter().for_each(TaskHandle::abort);
                return Err(e);
            }
        }

        let results = normalize(collect(handles, &patient_id).await?);
        tracing::info!("Normalized {} task results", results.len());

        let patient_resource = match results.get(BackendKind::StructuredQuery, "Patient") {
            Some(NormalizedValue::Scalar(_)) => None,
            _ => match self.backends.patients.patient(&patient_id).await {
                Ok(patient) => patient,
                Err(e) => {
                    tracing::warn!("could not read Patient/{patient_id} from the patient directory: {e}");
                    None
                }
            },
        };

        let link_context = LinkContext {
            package: &package,
            patient_id: &patient_id,
            deploy_url: &self.deploy_url,
            patient_resource,
            now: Utc::now(),
        };
        let linked = link(&link_context, &results)?;
        if !linked.issues.is_empty() {
            tracing::warn!(
                "{} field mappings could not be linked, see the bundle's OperationOutcome",
                linked.issues.len()
            );
        }
        tracing::info!(
            "Finished linking results, returning Bundle with {} entries",
            linked.bundle.total
        );
        Ok(linked)
    }

    async fn resolve_patient(&self, selector: &PatientSelector) -> CoreResult<String> {
        match selector {
            PatientSelector::Id(id) => Ok(id.as_str().to_owned()),
            PatientSelector::Identifier(token) => {
                let id = self.backends.patients.resolve_identifier(token).await?;
                tracing::info!("resolved patient identifier {token} to Patient/{id}");
                Ok(id)
            }
        }
    }

    /// The libraries to run: the one named by `job`, or every declared library.
    ///
    /// A library's content type decides which backend runs it.
    async fn resolve_libraries(
        &self,
        package: &JobPackage,
        job: Option<&NonEmptyText>,
    ) -> CoreResult<Vec<ResolvedLibrary>> {
        let references = match job {
            Some(job) => vec![LibraryRef::parse(job.as_str())?],
            None => {
                tracing::info!(
                    "no job given, running all jobs for the jobPackage {}",
                    package.name.as_str()
                );
                package.declared_libraries.clone()
            }
        };
        if references.is_empty() {
            return Err(no_libraries(package));
        }

        let mut resolved = Vec::with_capacity(references.len());
        for reference in references {
            let library = self.backends.libraries.library(&reference).await?;
            let kind = library.kind()?;
            if kind != reference.kind {
                tracing::warn!(
                    "{} is declared as {} but its content type is {}",
                    reference.file_name(),
                    reference.kind,
                    kind.content_type()
                );
            }
            resolved.push(ResolvedLibrary {
                reference: LibraryRef {
                    name: reference.name,
                    kind,
                },
                library,
            });
        }
        Ok(resolved)
    }

    // ------------------------------------------------------------------------
    // Job bookkeeping
    // ------------------------------------------------------------------------

    /// Persists a new job, drawing a fresh id on collision.
    async fn persist_new(&self, mut job: Job) -> CoreResult<Job> {
        while !self.store.create(&job).await? {
            tracing::warn!("job id {} is taken, drawing another", job.id);
            job.id = JobUuid::new();
        }
        Ok(job)
    }

    fn spawn_run(self: &Arc<Self>, job_id: JobUuid, request: StartJobsRequest) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = match this.run_pipeline(&request).await {
                Ok(linked) => JobResult::Bundle(linked.bundle),
                Err(e) => {
                    tracing::error!("job {job_id} failed: {e}");
                    JobResult::Outcome(e.to_outcome())
                }
            };
            match this.store.complete_with(&job_id, result).await {
                Ok(_) => tracing::info!("Job {job_id} complete"),
                Err(e) => tracing::error!("could not complete job {job_id}: {e}"),
            }
        });
    }
}

fn no_libraries(package: &JobPackage) -> CoreError {
    CoreError::Invalid(format!(
        "Job package {} does not declare any libraries to run",
        package.name.as_str()
    ))
}

fn issue(severity: IssueSeverity, code: IssueCode, diagnostics: &str) -> OperationOutcomeIssue {
    OperationOutcomeIssue {
        severity,
        code,
        diagnostics: diagnostics.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{
        library, FakePatientDirectory, FakeRegistry, FakeStructuredBackend,
        FakeTextAnalyticsBackend,
    };
    use crate::job::JobStatus;
    use crate::store::InMemoryJobStore;
    use fhir::questionnaire::{CQL_JOB_LIST_URL, CQL_TASK_URL, NLPQL_JOB_LIST_URL, NLPQL_TASK_URL};
    use fhir::Parameters;
    use serde_json::json;
    use std::time::Duration;

    const NOTES_SOURCE: &str = "phenotype \"notes\";";

    fn package(cql: &[&str], nlpql: &[&str]) -> JobPackage {
        let jobs = |names: &[&str]| -> Vec<serde_json::Value> {
            names
                .iter()
                .map(|n| json!({"url": "job", "valueString": n}))
                .collect()
        };
        JobPackage::from_questionnaire(json!({
            "resourceType": "Questionnaire",
            "name": "Registry",
            "extension": [
                {"url": CQL_JOB_LIST_URL, "extension": jobs(cql)},
                {"url": NLPQL_JOB_LIST_URL, "extension": jobs(nlpql)}
            ],
            "item": [{
                "linkId": "g1",
                "item": [
                    {"linkId": "age", "text": "Age", "extension": [
                        {"url": CQL_TASK_URL, "valueString": "demographics.Age"}
                    ]},
                    {"linkId": "pregnant", "text": "Pregnant", "extension": [
                        {"url": NLPQL_TASK_URL, "valueString": "notes.Pregnancy"}
                    ]}
                ]
            }]
        }))
        .expect("package")
    }

    fn demographics_payload() -> serde_json::Value {
        json!({"resourceType": "Parameters", "entry": [
            {"fullUrl": "Patient", "resource": {"parameter": [
                {"name": "name", "valueString": "Patient"},
                {"name": "value", "resource": {"resourceType": "Patient", "id": "p1"}}
            ]}},
            {"fullUrl": "Age", "resource": {"parameter": [
                {"name": "name", "valueString": "Age"},
                {"name": "value", "valueString": "42"}
            ]}}
        ]})
    }

    fn notes_payload() -> serde_json::Value {
        json!([{
            "nlpql_feature": "Pregnancy",
            "report_id": "r1",
            "report_date": "2023-02-01",
            "report_text": "patient is pregnant",
            "tuple": "\"answerValue\": \"pregnant\", \"sourceNote\": \"patient is pregnant\"",
            "_id": "a"
        }])
    }

    fn config() -> CoreConfig {
        CoreConfig::new("http://cqf/fhir/", "http://ehr/fhir/").expect("config")
    }

    struct Harness {
        registry: FakeRegistry,
        structured: FakeStructuredBackend,
        text_analytics: Option<FakeTextAnalyticsBackend>,
        patients: FakePatientDirectory,
    }

    impl Harness {
        fn new(package: JobPackage) -> Self {
            Self {
                registry: FakeRegistry::new()
                    .with_package(package)
                    .with_library(library("demographics", BackendKind::StructuredQuery, "library demographics"))
                    .with_library(library("notes", BackendKind::TextAnalytics, NOTES_SOURCE)),
                structured: FakeStructuredBackend::new()
                    .with_response("demographics", 200, demographics_payload())
                    .with_probe_status(200),
                text_analytics: Some(
                    FakeTextAnalyticsBackend::new()
                        .with_run(NOTES_SOURCE, 200, notes_payload())
                        .with_probe_status(200),
                ),
                patients: FakePatientDirectory::new().with_patient("p1", Some("urn:mrn|123")),
            }
        }

        fn build(self) -> (Arc<Orchestrator>, Arc<InMemoryJobStore>) {
            let registry = Arc::new(self.registry);
            let backends = Backends {
                forms: registry.clone(),
                libraries: registry,
                patients: Arc::new(self.patients),
                structured: Arc::new(self.structured),
                text_analytics: self
                    .text_analytics
                    .map(|b| Arc::new(b) as Arc<dyn TextAnalyticsBackend>),
            };
            let store = Arc::new(InMemoryJobStore::new());
            let orchestrator = Orchestrator::new(&config(), backends, store.clone());
            (Arc::new(orchestrator), store)
        }
    }

    fn request(patient: &str, job: Option<&str>) -> StartJobsRequest {
        let mut params = vec![
            fhir::Parameter::string("patientId", patient),
            fhir::Parameter::string("jobPackage", "Registry"),
        ];
        if let Some(job) = job {
            params.push(fhir::Parameter::string("job", job));
        }
        StartJobsRequest::from_parameters(&Parameters::new(params)).expect("request")
    }

    async fn wait_for_completion(orchestrator: &Orchestrator, id: &str) -> Job {
        for _ in 0..200 {
            let job = orchestrator.status(id).await.expect("status");
            if job.is_complete() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} did not complete");
    }

    fn resource_types(bundle: &Bundle) -> Vec<String> {
        bundle
            .entry
            .iter()
            .map(|e| e.resource["resourceType"].as_str().unwrap_or_default().to_owned())
            .collect()
    }

    #[tokio::test]
    async fn sync_run_links_both_backends() {
        let (orchestrator, _) = Harness::new(package(&["demographics.cql"], &["notes.nlpql"])).build();
        let bundle = orchestrator.run_sync(&request("p1", None)).await.expect("run");

        assert_eq!(bundle.entry[0].full_url, "Patient/p1");
        let types = resource_types(&bundle);
        assert_eq!(types.iter().filter(|t| *t == "Observation").count(), 2);
        assert!(types.contains(&"DocumentReference".to_owned()));
        assert_eq!(bundle.total, bundle.entry.len());
    }

    #[tokio::test]
    async fn identifier_is_resolved_through_directory() {
        let (orchestrator, _) = Harness::new(package(&["demographics.cql"], &[])).build();
        let params = Parameters::new(vec![
            fhir::Parameter::string("patientIdentifier", "urn:mrn|123"),
            fhir::Parameter::string("jobPackage", "Registry"),
        ]);
        let request = StartJobsRequest::from_parameters(&params).expect("request");
        let bundle = orchestrator.run_sync(&request).await.expect("run");
        assert_eq!(bundle.entry[0].full_url, "Patient/p1");
    }

    #[tokio::test]
    async fn single_named_job_runs_only_that_library() {
        let mut harness = Harness::new(package(&["demographics.cql"], &["notes.nlpql"]));
        harness.text_analytics = Some(FakeTextAnalyticsBackend::new().rejecting_registration(500));
        let (orchestrator, _) = harness.build();
        let bundle = orchestrator
            .run_sync(&request("p1", Some("demographics.cql")))
            .await
            .expect("run");
        assert!(!resource_types(&bundle).contains(&"DocumentReference".to_owned()));
    }

    #[tokio::test]
    async fn unknown_library_is_not_found() {
        let (orchestrator, _) = Harness::new(package(&["missing.cql"], &[])).build();
        let err = orchestrator.run_sync(&request("p1", None)).await.expect_err("missing");
        match err {
            CoreError::NotFound(msg) => assert_eq!(msg, "Library with name missing not found"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn library_without_content_type_is_invalid() {
        let mut harness = Harness::new(package(&["bare.cql"], &[]));
        let mut bare = library("bare", BackendKind::StructuredQuery, "x");
        bare.content[0].content_type = None;
        harness.registry = harness.registry.with_library(bare);
        let (orchestrator, _) = harness.build();
        let err = orchestrator.run_sync(&request("p1", None)).await.expect_err("invalid");
        assert_eq!(err.issue_code(), IssueCode::Invalid);
    }

    #[tokio::test]
    async fn disabled_text_analytics_skips_nlp_libraries() {
        let mut harness = Harness::new(package(&[], &["notes.nlpql"]));
        harness.text_analytics = None;
        let (orchestrator, _) = harness.build();
        let err = orchestrator.run_sync(&request("p1", None)).await.expect_err("nothing ran");
        assert!(matches!(err, CoreError::Transient(_)));
    }

    #[tokio::test]
    async fn registration_failure_is_transient() {
        let mut harness = Harness::new(package(&["demographics.cql"], &["notes.nlpql"]));
        harness.text_analytics = Some(FakeTextAnalyticsBackend::new().rejecting_registration(500));
        let (orchestrator, _) = harness.build();
        let err = orchestrator.run_sync(&request("p1", None)).await.expect_err("registration");
        match err {
            CoreError::Transient(msg) => {
                assert_eq!(msg, "Trying to register NLPQL with NLPaaS failed with code 500")
            }
            other => panic!("expected Transient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn backend_timeout_fails_the_run() {
        let mut harness = Harness::new(package(&["demographics.cql"], &[]));
        harness.structured = FakeStructuredBackend::new().with_response("demographics", 504, json!(null));
        let (orchestrator, _) = harness.build();
        let err = orchestrator.run_sync(&request("p1", None)).await.expect_err("timeout");
        assert_eq!(err.issue_code(), IssueCode::Timeout);
    }

    #[tokio::test]
    async fn async_job_completes_with_bundle() {
        let (orchestrator, _) = Harness::new(package(&["demographics.cql"], &[])).build();
        let job = orchestrator.submit_async(request("p1", None)).await.expect("submit");
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.patient_id_type, "id");

        let done = wait_for_completion(&orchestrator, &job.id.to_string()).await;
        match done.result {
            Some(JobResult::Bundle(bundle)) => assert_eq!(bundle.entry[0].full_url, "Patient/p1"),
            other => panic!("expected bundle, got {other:?}"),
        }
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn async_job_failure_is_stored_as_outcome() {
        let (orchestrator, _) = Harness::new(package(&["missing.cql"], &[])).build();
        let job = orchestrator.submit_async(request("p1", None)).await.expect("submit");
        let done = wait_for_completion(&orchestrator, &job.id.to_string()).await;
        match done.result {
            Some(JobResult::Outcome(outcome)) => {
                assert_eq!(outcome.primary().map(|i| i.code), Some(IssueCode::NotFound))
            }
            other => panic!("expected outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_fans_out_one_job_per_library() {
        let libraries = ["demographics.cql", "a.cql", "b.cql", "c.cql", "d.cql"];
        let mut harness = Harness::new(package(&libraries, &[]));
        for name in ["a", "b", "c", "d"] {
            harness.registry = harness
                .registry
                .with_library(library(name, BackendKind::StructuredQuery, name));
        }
        let (orchestrator, store) = harness.build();

        let request = BatchJobRequest::from_parameters(&Parameters::new(vec![
            fhir::Parameter::string("patientId", "p1"),
            fhir::Parameter::string("jobPackage", "Registry"),
        ]))
        .expect("batch request");
        let batch = orchestrator.submit_batch(request).await.expect("batch");
        assert_eq!(batch.child_job_ids.len(), 5);

        for child in &batch.child_job_ids {
            let job = wait_for_completion(&orchestrator, &child.to_string()).await;
            assert_eq!(job.parent_batch_id.as_ref(), Some(&batch.id));
        }
        let view = orchestrator
            .batch_status(&batch.id.to_string())
            .await
            .expect("batch status");
        assert_eq!(view.status(), JobStatus::Complete);
        assert_eq!(store.list().await.expect("list").len(), 5);

        let outcome = orchestrator
            .delete_batch(&batch.id.to_string())
            .await
            .expect("delete");
        assert_eq!(outcome.primary().map(|i| i.code), Some(IssueCode::Deleted));
        let err = orchestrator
            .batch_status(&batch.id.to_string())
            .await
            .expect_err("deleted");
        assert_eq!(err.issue_code(), IssueCode::NotFound);
    }

    #[tokio::test]
    async fn unknown_job_id_is_not_found() {
        let (orchestrator, _) = Harness::new(package(&[], &[])).build();
        let err = orchestrator.status("not-a-job").await.expect_err("unknown");
        assert_eq!(
            err.to_string(),
            "The not-a-job job id was not found as an async job. Please try running the jobPackage again with a new job id."
        );
    }

    #[tokio::test]
    async fn health_reports_each_backend() {
        let (orchestrator, _) = Harness::new(package(&[], &[])).build();
        let outcome = orchestrator.health().await;
        let diagnostics: Vec<&str> = outcome.issue.iter().map(|i| i.diagnostics.as_str()).collect();
        assert_eq!(
            diagnostics,
            vec![
                "CQF Ruler is up and running",
                "NLPaaS is up and running",
                "RC-API is up and running"
            ]
        );

        let mut harness = Harness::new(package(&[], &[]));
        harness.structured = FakeStructuredBackend::new();
        harness.text_analytics = None;
        let (orchestrator, _) = harness.build();
        let outcome = orchestrator.health().await;
        assert_eq!(outcome.issue[0].severity, IssueSeverity::Error);
        assert_eq!(outcome.issue[1].severity, IssueSeverity::Warning);
        assert!(outcome.issue[2]
            .diagnostics
            .starts_with("RC-API is not up and running because: Could not connect to CQF Ruler"));
    }
}
