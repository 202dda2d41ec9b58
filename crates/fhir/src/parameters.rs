//! `Parameters` envelopes.
//!
//! `Parameters` is used in three places:
//! - inbound job submission requests (`patientId`/`patientIdentifier`, `jobPackage`, ...)
//! - the evaluation context posted to the structured-query backend
//! - the job and batch-job status documents returned to callers

use crate::{FhirError, FhirResult};
use rc_types::{IdentifierToken, NonEmptyText};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const ENDPOINT_CONNECTION_TYPE_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/endpoint-connection-type";
const ENDPOINT_PAYLOAD_TYPE_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/endpoint-payload-type";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    #[schema(example = "patientId")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_boolean: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub resource: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<Vec<Parameter>>,
}

impl Parameter {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_string: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn date_time(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_date_time: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn resource(name: impl Into<String>, resource: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            resource: Some(resource),
            ..Self::default()
        }
    }

    fn has_value(&self) -> bool {
        self.value_string.is_some()
            || self.value_date_time.is_some()
            || self.value_boolean.is_some()
            || self.resource.is_some()
            || self.part.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    #[schema(example = "Parameters")]
    pub resource_type: String,
    #[serde(default)]
    pub parameter: Vec<Parameter>,
}

impl Parameters {
    pub fn new(parameter: Vec<Parameter>) -> Self {
        Self {
            resource_type: "Parameters".into(),
            parameter,
        }
    }

    /// First parameter with this name.
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameter.iter().find(|p| p.name == name)
    }

    /// `valueString` of the first parameter with this name.
    pub fn string_value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|p| p.value_string.as_deref())
    }

    /// Rejects envelopes that are not `Parameters` or contain a parameter without a value.
    fn validate_structure(&self) -> FhirResult<()> {
        if self.resource_type != "Parameters" {
            return Err(FhirError::Structure(format!(
                "expected a Parameters resource, got {}",
                self.resource_type
            )));
        }
        if self.parameter.iter().any(|p| !p.has_value()) {
            return Err(FhirError::Structure(
                "Parameters.parameter is not correct, ensure it has a name and value".into(),
            ));
        }
        Ok(())
    }

    /// Builds the evaluation context posted to the structured-query backend.
    ///
    /// The data endpoint tells the backend where to read patient data from; when an
    /// authorization header value is configured it is forwarded in `Endpoint.header`.
    pub fn evaluation_context(
        patient_id: &str,
        data_endpoint_url: &str,
        authorization: Option<&str>,
    ) -> Self {
        let mut endpoint = serde_json::json!({
            "resourceType": "Endpoint",
            "status": "active",
            "connectionType": {
                "system": ENDPOINT_CONNECTION_TYPE_SYSTEM,
                "code": "hl7-fhir-rest"
            },
            "name": "External FHIR Server",
            "payloadType": [{"coding": [{"system": ENDPOINT_PAYLOAD_TYPE_SYSTEM, "code": "any"}]}],
            "address": data_endpoint_url,
        });
        if let Some(auth) = authorization {
            endpoint["header"] = serde_json::json!([format!("Authorization: {auth}")]);
        }

        Self::new(vec![
            Parameter::string("patientId", patient_id),
            Parameter::string("context", "Patient"),
            Parameter::resource("dataEndpoint", endpoint),
        ])
    }
}

// ============================================================================
// Submission requests
// ============================================================================

/// How the caller identified the patient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatientSelector {
    /// A server id, used as-is.
    Id(NonEmptyText),
    /// An identifier that must be resolved through the patient directory.
    Identifier(IdentifierToken),
}

impl PatientSelector {
    /// `id` or `identifier`, as recorded on the job.
    pub fn kind(&self) -> &'static str {
        match self {
            PatientSelector::Id(_) => "id",
            PatientSelector::Identifier(_) => "identifier",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            PatientSelector::Id(id) => id.as_str(),
            PatientSelector::Identifier(token) => token.as_search_value(),
        }
    }
}

/// A validated job submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartJobsRequest {
    pub patient: PatientSelector,
    pub job_package: NonEmptyText,
    /// A single library to run (`Name.ext`); all declared libraries when absent.
    pub job: Option<NonEmptyText>,
    pub job_package_version: Option<NonEmptyText>,
}

impl StartJobsRequest {
    /// Validates a submission envelope.
    ///
    /// # Errors
    ///
    /// - [`FhirError::Structure`] if the envelope is malformed.
    /// - [`FhirError::MissingParameter`] if neither `patientId` nor `patientIdentifier` is
    ///   given, or `jobPackage` is absent.
    pub fn from_parameters(params: &Parameters) -> FhirResult<Self> {
        params.validate_structure()?;

        let patient = if let Some(id) = non_empty(params, "patientId")? {
            PatientSelector::Id(id)
        } else if let Some(raw) = params.string_value("patientIdentifier") {
            let token = IdentifierToken::parse(raw)
                .map_err(|e| FhirError::Structure(format!("patientIdentifier: {e}")))?;
            PatientSelector::Identifier(token)
        } else {
            return Err(FhirError::MissingParameter(
                "patientID or patientIdentifier".into(),
            ));
        };

        let job_package = non_empty(params, "jobPackage")?
            .ok_or_else(|| FhirError::MissingParameter("jobPackage".into()))?;

        Ok(Self {
            patient,
            job_package,
            job: non_empty(params, "job")?,
            job_package_version: non_empty(params, "jobPackageVersion")?,
        })
    }
}

/// A validated batch submission (`jobPackage` + `patientId`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchJobRequest {
    pub patient_id: NonEmptyText,
    pub job_package: NonEmptyText,
}

impl BatchJobRequest {
    pub fn from_parameters(params: &Parameters) -> FhirResult<Self> {
        params.validate_structure()?;
        let job_package = non_empty(params, "jobPackage")?
            .ok_or_else(|| FhirError::MissingParameter("jobPackage".into()))?;
        let patient_id = non_empty(params, "patientId")?
            .ok_or_else(|| FhirError::MissingParameter("patientId".into()))?;
        Ok(Self {
            patient_id,
            job_package,
        })
    }
}

fn non_empty(params: &Parameters, name: &str) -> FhirResult<Option<NonEmptyText>> {
    params
        .string_value(name)
        .map(|v| {
            NonEmptyText::new(v).map_err(|_| FhirError::Structure(format!("{name} is empty")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: serde_json::Value) -> FhirResult<StartJobsRequest> {
        let params: Parameters = serde_json::from_value(body).expect("parameters body");
        StartJobsRequest::from_parameters(&params)
    }

    #[test]
    fn parses_full_request() {
        let request = parse(json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "patientId", "valueString": "12345"},
                {"name": "jobPackage", "valueString": "SyphilisRegistry"},
                {"name": "job", "valueString": "demographics.cql"},
                {"name": "jobPackageVersion", "valueString": "2.0.0"}
            ]
        }))
        .expect("valid request");

        assert_eq!(request.patient.kind(), "id");
        assert_eq!(request.patient.value(), "12345");
        assert_eq!(request.job_package.as_str(), "SyphilisRegistry");
        assert_eq!(request.job.as_ref().map(|j| j.as_str()), Some("demographics.cql"));
        assert_eq!(
            request.job_package_version.as_ref().map(|v| v.as_str()),
            Some("2.0.0")
        );
    }

    #[test]
    fn accepts_patient_identifier() {
        let request = parse(json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "patientIdentifier", "valueString": "urn:mrn|0042"},
                {"name": "jobPackage", "valueString": "SyphilisRegistry"}
            ]
        }))
        .expect("valid request");
        assert_eq!(request.patient.kind(), "identifier");
        assert_eq!(request.patient.value(), "urn:mrn|0042");
        assert_eq!(request.job, None);
    }

    #[test]
    fn missing_patient_is_required() {
        let err = parse(json!({
            "resourceType": "Parameters",
            "parameter": [{"name": "jobPackage", "valueString": "SyphilisRegistry"}]
        }))
        .expect_err("patient required");
        match err {
            FhirError::MissingParameter(name) => assert!(name.contains("patientIdentifier")),
            other => panic!("expected MissingParameter, got {other:?}"),
        }
    }

    #[test]
    fn missing_job_package_is_required() {
        let err = parse(json!({
            "resourceType": "Parameters",
            "parameter": [{"name": "patientId", "valueString": "1"}]
        }))
        .expect_err("jobPackage required");
        assert!(matches!(err, FhirError::MissingParameter(name) if name == "jobPackage"));
    }

    #[test]
    fn parameter_without_value_is_structure_error() {
        let err = parse(json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "patientId"},
                {"name": "jobPackage", "valueString": "SyphilisRegistry"}
            ]
        }))
        .expect_err("structure");
        assert!(matches!(err, FhirError::Structure(_)));
    }

    #[test]
    fn evaluation_context_forwards_authorization() {
        let params = Parameters::evaluation_context("p1", "http://ehr/fhir/", Some("Bearer abc"));
        let value = serde_json::to_value(&params).expect("serialize");
        assert_eq!(value["parameter"][0], json!({"name": "patientId", "valueString": "p1"}));
        assert_eq!(value["parameter"][1]["valueString"], "Patient");
        let endpoint = &value["parameter"][2]["resource"];
        assert_eq!(endpoint["address"], "http://ehr/fhir/");
        assert_eq!(endpoint["connectionType"]["code"], "hl7-fhir-rest");
        assert_eq!(endpoint["header"], json!(["Authorization: Bearer abc"]));

        let params = Parameters::evaluation_context("p1", "http://ehr/fhir/", None);
        assert!(params.parameter[2]
            .resource
            .as_ref()
            .is_some_and(|r| r.get("header").is_none()));
    }

    #[test]
    fn batch_request_needs_patient_id() {
        let params: Parameters = serde_json::from_value(json!({
            "resourceType": "Parameters",
            "parameter": [{"name": "jobPackage", "valueString": "SyphilisRegistry"}]
        }))
        .expect("parameters body");
        let err = BatchJobRequest::from_parameters(&params).expect_err("patientId required");
        assert!(matches!(err, FhirError::MissingParameter(name) if name == "patientId"));
    }
}
