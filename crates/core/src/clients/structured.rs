//! HTTP client for the structured-query backend.
//!
//! The same server evaluates libraries (`Library/{id}/$evaluate`) and serves the job packages
//! and libraries the orchestrator resolves before dispatch.

use super::{
    transient_status, BackendResponse, ClientError, FormProvider, LibraryRegistry,
    StructuredQueryBackend,
};
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use fhir::library::first_entry_resource;
use fhir::{JobPackage, Library, LibraryRef, Parameters};

const SERVICE: &str = "structured-query backend";

/// Client for one structured-query server.
#[derive(Clone, Debug)]
pub struct CqfRulerClient {
    client: reqwest::Client,
    base_url: String,
}

impl CqfRulerClient {
    /// `base_url` must end in `/`; [`crate::CoreConfig`] normalizes it.
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a client reusing an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_owned(),
        }
    }

    async fn search(&self, path: &str, query: &[(&str, &str)]) -> CoreResult<(u16, serde_json::Value)> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("{SERVICE} search {path} failed: {e}");
                CoreError::Transient(format!("Could not connect to the {SERVICE}: {e}"))
            })?;
        let status = response.status().as_u16();
        let body = read_json(response).await;
        Ok((status, body))
    }
}

/// Reads a response body as JSON, keeping non-JSON bodies as a string.
pub(crate) async fn read_json(response: reqwest::Response) -> serde_json::Value {
    match response.text().await {
        Ok(text) => serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)),
        Err(e) => {
            tracing::warn!("failed to read response body: {e}");
            serde_json::Value::Null
        }
    }
}

#[async_trait]
impl StructuredQueryBackend for CqfRulerClient {
    async fn evaluate(
        &self,
        library_id: &str,
        context: &Parameters,
    ) -> Result<BackendResponse, ClientError> {
        let response = self
            .client
            .post(format!("{}Library/{}/$evaluate", self.base_url, library_id))
            .json(context)
            .send()
            .await?;
        let status = response.status().as_u16();
        Ok(BackendResponse::new(status, read_json(response).await))
    }

    async fn probe(&self) -> Result<u16, ClientError> {
        let response = self
            .client
            .get(format!("{}metadata", self.base_url))
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl FormProvider for CqfRulerClient {
    async fn job_package(&self, name: &str, version: Option<&str>) -> CoreResult<JobPackage> {
        let mut query = vec![("name:exact", name), ("_sort", "-_lastUpdated")];
        if let Some(version) = version {
            query.push(("version", version));
        }
        let (status, body) = self.search("Questionnaire", &query).await?;
        if status != 200 {
            tracing::error!("job package search for {name} returned {status}: {body}");
            return Err(transient_status("retrieve the job package", status));
        }
        let resource = first_entry_resource(&body).ok_or_else(|| {
            CoreError::NotFound(format!("Questionnaire with name {name} not found"))
        })?;
        Ok(JobPackage::from_questionnaire(resource.clone())?)
    }
}

#[async_trait]
impl LibraryRegistry for CqfRulerClient {
    async fn library(&self, library: &LibraryRef) -> CoreResult<Library> {
        let content_type = library.kind.content_type();
        let (status, body) = self
            .search(
                "Library",
                &[("name", library.name.as_str()), ("content-type", content_type)],
            )
            .await?;
        if status != 200 {
            tracing::error!(
                "library search for {} returned {status}: {body}",
                library.file_name()
            );
            return Err(transient_status(
                &format!("get Library {}", library.name),
                status,
            ));
        }
        Library::first_in_search_set(&body)?.ok_or_else(|| {
            CoreError::NotFound(format!("Library with name {} not found", library.name))
        })
    }
}
