//! HTTP client for the external FHIR server (patient directory).

use super::{transient_status, PatientDirectory};
use crate::config::FhirAuth;
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use fhir::library::first_entry_resource;
use rc_types::IdentifierToken;

#[derive(Clone, Debug)]
pub struct ExternalFhirClient {
    client: reqwest::Client,
    base_url: String,
    auth: Option<FhirAuth>,
}

impl ExternalFhirClient {
    pub fn new(base_url: &str, auth: Option<FhirAuth>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, auth)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, auth: Option<FhirAuth>) -> Self {
        Self {
            client,
            base_url: base_url.to_owned(),
            auth,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.auth {
            Some(auth) => request.header(reqwest::header::AUTHORIZATION, auth.header_value()),
            None => request,
        }
    }
}

fn connection_error(e: reqwest::Error) -> CoreError {
    tracing::error!("external FHIR server request failed: {e}");
    CoreError::Transient(format!("Could not connect to the external FHIR server: {e}"))
}

#[async_trait]
impl PatientDirectory for ExternalFhirClient {
    async fn resolve_identifier(&self, identifier: &IdentifierToken) -> CoreResult<String> {
        let response = self
            .get("Patient")
            .query(&[("identifier", identifier.as_search_value())])
            .send()
            .await
            .map_err(connection_error)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(transient_status("search for the patient identifier", status));
        }
        let body: serde_json::Value = response.json().await.map_err(connection_error)?;
        first_entry_resource(&body)
            .and_then(|patient| patient.get("id"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "Patient with identifier {identifier} not found"
                ))
            })
    }

    async fn patient(&self, patient_id: &str) -> CoreResult<Option<serde_json::Value>> {
        let response = self
            .get(&format!("Patient/{patient_id}"))
            .send()
            .await
            .map_err(connection_error)?;
        match response.status().as_u16() {
            200 => Ok(Some(response.json().await.map_err(connection_error)?)),
            404 | 410 => Ok(None),
            status => Err(transient_status("read the Patient resource", status)),
        }
    }
}
