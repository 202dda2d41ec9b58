//! # API REST
//!
//! REST API implementation for RC-API.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (status codes, `Location` headers, CORS)
//!
//! Every domain failure is returned as a FHIR `OperationOutcome`. Orchestration itself lives in
//! `rcapi-core`.

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use fhir::{
    BatchJobRequest, Bundle, IssueCode, IssueSeverity, OperationOutcome, Parameters,
    StartJobsRequest,
};
use rcapi_core::{CoreError, JobResult, Orchestrator};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Application state shared across REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        start_jobs,
        job_status,
        create_batch_job,
        batch_job_status,
        delete_batch_job,
    ),
    components(schemas(
        Bundle,
        fhir::BundleEntry,
        fhir::bundle::BundleType,
        OperationOutcome,
        fhir::OperationOutcomeIssue,
        fhir::IssueCode,
        IssueSeverity,
        Parameters,
        fhir::Parameter,
    ))
)]
pub struct ApiDoc;

type ApiError = (StatusCode, Json<OperationOutcome>);

/// Builds the router with every endpoint, the Swagger UI and a permissive CORS layer.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/forms/start", post(start_jobs))
        .route("/forms/status/:id", get(job_status))
        .route("/smartchartui/batchjob", post(create_batch_job))
        .route(
            "/smartchartui/batchjob/:id",
            get(batch_job_status).delete(delete_batch_job),
        )
        .merge(
            SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct StartQuery {
    #[serde(rename = "async", default)]
    run_async: bool,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Every required backend is reachable", body = OperationOutcome),
        (status = 500, description = "The structured-query backend is unreachable", body = OperationOutcome)
    )
)]
/// Health check endpoint
///
/// Probes both backends and reports one issue per backend plus an overall verdict.
#[axum::debug_handler]
async fn health(State(state): State<AppState>) -> (StatusCode, Json<OperationOutcome>) {
    let outcome = state.orchestrator.health().await;
    let status = if has_error(&outcome) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(outcome))
}

#[utoipa::path(
    post,
    path = "/forms/start",
    params(("async" = Option<bool>, Query, description = "Run in the background and return a job to poll")),
    request_body = Parameters,
    responses(
        (status = 200, description = "Evidence bundle", body = Bundle),
        (status = 202, description = "Job accepted; poll the Location header", body = Parameters),
        (status = 400, description = "Missing or malformed parameters", body = OperationOutcome),
        (status = 404, description = "Job package, library or patient not found", body = OperationOutcome),
        (status = 504, description = "A backend timed out", body = OperationOutcome)
    )
)]
/// Start the jobs of a job package for one patient
///
/// Runs inline and returns the evidence bundle, or with `?async=true` records a job, starts it
/// in the background and returns its status document.
///
/// # Errors
/// Returns an `OperationOutcome` with:
/// - `400` if the body is not a valid submission,
/// - `404` if the job package, a library or the patient cannot be found,
/// - `504` if a backend timed out,
/// - `500` for any other failure.
#[axum::debug_handler]
async fn start_jobs(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let params = parse_parameters(body)?;
    let request = StartJobsRequest::from_parameters(&params)
        .map_err(|e| error_response(CoreError::from(e)))?;

    if query.run_async {
        let job = state
            .orchestrator
            .submit_async(request)
            .await
            .map_err(error_response)?;
        let location = format!("/forms/status/{}", job.id);
        return Ok((
            StatusCode::ACCEPTED,
            [(header::LOCATION, location)],
            Json(job.to_parameters()),
        )
            .into_response());
    }

    let bundle: Bundle = state
        .orchestrator
        .run_sync(&request)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::OK, Json(bundle)).into_response())
}

#[utoipa::path(
    get,
    path = "/forms/status/{id}",
    params(("id" = String, Path, description = "Job id, or `all` to list every job")),
    responses(
        (status = 200, description = "Job status document", body = Parameters),
        (status = 404, description = "Unknown job id, or the job completed with a not-found outcome", body = OperationOutcome),
        (status = 500, description = "The job completed with an error outcome", body = OperationOutcome)
    )
)]
/// Read an async job's status
///
/// `all` lists every job instead. A job that failed returns its `OperationOutcome` as the body:
/// `404` when the first issue is `not-found`, otherwise `500` for error severity.
#[axum::debug_handler]
async fn job_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    if id == "all" {
        let jobs = state.orchestrator.list_jobs().await.map_err(error_response)?;
        let documents: Vec<Parameters> = jobs.iter().map(|job| job.to_parameters()).collect();
        return Ok(Json(documents).into_response());
    }

    let job = state.orchestrator.status(&id).await.map_err(error_response)?;
    if let Some(JobResult::Outcome(outcome)) = &job.result {
        let not_found = outcome
            .primary()
            .is_some_and(|issue| issue.code == IssueCode::NotFound);
        if not_found {
            return Ok((StatusCode::NOT_FOUND, Json(outcome.clone())).into_response());
        }
        if has_error(outcome) {
            return Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(outcome.clone())).into_response());
        }
    }
    Ok(Json(job.to_parameters()).into_response())
}

#[utoipa::path(
    post,
    path = "/smartchartui/batchjob",
    request_body = Parameters,
    responses(
        (status = 202, description = "Batch accepted; poll the Location header", body = Parameters),
        (status = 400, description = "Missing or malformed parameters", body = OperationOutcome),
        (status = 404, description = "Job package not found", body = OperationOutcome)
    )
)]
/// Start one job per library of a job package
#[axum::debug_handler]
async fn create_batch_job(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let params = parse_parameters(body)?;
    let request = BatchJobRequest::from_parameters(&params)
        .map_err(|e| error_response(CoreError::from(e)))?;

    let batch = state
        .orchestrator
        .submit_batch(request)
        .await
        .map_err(error_response)?;
    let location = format!("/smartchartui/batchjob/{}", batch.id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(batch.to_parameters()),
    )
        .into_response())
}

#[utoipa::path(
    get,
    path = "/smartchartui/batchjob/{id}",
    params(("id" = String, Path, description = "Batch job id")),
    responses(
        (status = 200, description = "Batch status document", body = Parameters),
        (status = 404, description = "Unknown batch id", body = OperationOutcome)
    )
)]
/// Read a batch job and its aggregate status
#[axum::debug_handler]
async fn batch_job_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Parameters>, ApiError> {
    let view = state
        .orchestrator
        .batch_status(&id)
        .await
        .map_err(error_response)?;
    Ok(Json(view.to_parameters()))
}

#[utoipa::path(
    delete,
    path = "/smartchartui/batchjob/{id}",
    params(("id" = String, Path, description = "Batch job id")),
    responses(
        (status = 200, description = "Batch deleted", body = OperationOutcome),
        (status = 404, description = "Unknown batch id", body = OperationOutcome)
    )
)]
/// Delete a batch job record
///
/// Child jobs are kept.
#[axum::debug_handler]
async fn delete_batch_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<OperationOutcome>, ApiError> {
    let outcome = state
        .orchestrator
        .delete_batch(&id)
        .await
        .map_err(error_response)?;
    Ok(Json(outcome))
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn parse_parameters(body: serde_json::Value) -> Result<Parameters, ApiError> {
    serde_json::from_value(body).map_err(|e| {
        error_response(CoreError::Structure(format!(
            "request body is not a Parameters resource: {e}"
        )))
    })
}

fn error_response(err: CoreError) -> ApiError {
    let status = match &err {
        CoreError::Required(_) | CoreError::Invalid(_) | CoreError::Structure(_) => {
            StatusCode::BAD_REQUEST
        }
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CoreError::Transient(_) | CoreError::Store(_) | CoreError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!("request failed: {err}");
    } else {
        tracing::warn!("request rejected: {err}");
    }
    (status, Json(err.to_outcome()))
}

fn has_error(outcome: &OperationOutcome) -> bool {
    outcome
        .issue
        .iter()
        .any(|issue| matches!(issue.severity, IssueSeverity::Error | IssueSeverity::Fatal))
}
