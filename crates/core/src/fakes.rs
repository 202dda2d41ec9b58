//! In-memory stand-ins for the backend and registry ports.
//!
//! Compiled for this crate's tests and, behind the `test-support` feature, for downstream
//! crates' tests. Nothing here performs I/O.

use crate::clients::{
    BackendResponse, ClientError, FormProvider, LibraryRegistry, PatientDirectory,
    StructuredQueryBackend, TextAnalyticsBackend,
};
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fhir::library::LibraryAttachment;
use fhir::{BackendKind, JobPackage, Library, LibraryRef, Parameters};
use rc_types::IdentifierToken;
use std::collections::HashMap;
use std::sync::Mutex;

/// A `Library` whose first attachment declares `kind` and carries `source`.
pub fn library(name: &str, kind: BackendKind, source: &str) -> Library {
    Library {
        id: Some(name.to_owned()),
        name: Some(name.to_owned()),
        version: None,
        content: vec![LibraryAttachment {
            content_type: Some(kind.content_type().to_owned()),
            data: Some(STANDARD.encode(source)),
        }],
    }
}

/// Canned `$evaluate` responses keyed by library id.
#[derive(Debug, Default)]
pub struct FakeStructuredBackend {
    responses: HashMap<String, BackendResponse>,
    probe_status: Option<u16>,
    evaluated: Mutex<Vec<String>>,
}

impl FakeStructuredBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, library_id: &str, status: u16, body: serde_json::Value) -> Self {
        self.responses
            .insert(library_id.to_owned(), BackendResponse::new(status, body));
        self
    }

    pub fn with_probe_status(mut self, status: u16) -> Self {
        self.probe_status = Some(status);
        self
    }

    /// Library ids evaluated so far, in call order.
    pub fn evaluated(&self) -> Vec<String> {
        self.evaluated
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StructuredQueryBackend for FakeStructuredBackend {
    async fn evaluate(
        &self,
        library_id: &str,
        _context: &Parameters,
    ) -> Result<BackendResponse, ClientError> {
        if let Ok(mut calls) = self.evaluated.lock() {
            calls.push(library_id.to_owned());
        }
        Ok(self
            .responses
            .get(library_id)
            .cloned()
            .unwrap_or_else(|| BackendResponse::new(404, serde_json::Value::Null)))
    }

    async fn probe(&self) -> Result<u16, ClientError> {
        self.probe_status.ok_or_else(|| ClientError::Connection {
            service: "structured-query backend",
            reason: "connection refused".into(),
        })
    }
}

/// Canned text-analytics runs keyed by library source text.
#[derive(Debug, Default)]
pub struct FakeTextAnalyticsBackend {
    runs: HashMap<String, BackendResponse>,
    registration_status: Option<u16>,
    probe_status: Option<u16>,
}

impl FakeTextAnalyticsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run(mut self, source: &str, status: u16, body: serde_json::Value) -> Self {
        self.runs
            .insert(source.to_owned(), BackendResponse::new(status, body));
        self
    }

    /// Makes every registration fail with `status`.
    pub fn rejecting_registration(mut self, status: u16) -> Self {
        self.registration_status = Some(status);
        self
    }

    pub fn with_probe_status(mut self, status: u16) -> Self {
        self.probe_status = Some(status);
        self
    }
}

#[async_trait]
impl TextAnalyticsBackend for FakeTextAnalyticsBackend {
    async fn register(&self, source: &str) -> Result<String, ClientError> {
        if let Some(status) = self.registration_status {
            return Err(ClientError::Status {
                service: "text-analytics backend",
                status,
                body: String::new(),
            });
        }
        Ok(format!("run/{source}"))
    }

    async fn run(
        &self,
        run_path: &str,
        _context: &serde_json::Value,
    ) -> Result<BackendResponse, ClientError> {
        let source = run_path.trim_start_matches("run/");
        Ok(self
            .runs
            .get(source)
            .cloned()
            .unwrap_or_else(|| BackendResponse::new(200, serde_json::json!([]))))
    }

    async fn probe(&self) -> Result<u16, ClientError> {
        self.probe_status.ok_or_else(|| ClientError::Connection {
            service: "text-analytics backend",
            reason: "connection refused".into(),
        })
    }
}

/// Job packages and libraries held in memory.
#[derive(Debug, Default)]
pub struct FakeRegistry {
    packages: HashMap<String, JobPackage>,
    libraries: HashMap<String, Library>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package(mut self, package: JobPackage) -> Self {
        self.packages
            .insert(package.name.as_str().to_owned(), package);
        self
    }

    pub fn with_library(mut self, library: Library) -> Self {
        let name = library.name.clone().unwrap_or_default();
        self.libraries.insert(name, library);
        self
    }
}

#[async_trait]
impl FormProvider for FakeRegistry {
    async fn job_package(&self, name: &str, _version: Option<&str>) -> CoreResult<JobPackage> {
        self.packages
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("Questionnaire with name {name} not found")))
    }
}

#[async_trait]
impl LibraryRegistry for FakeRegistry {
    async fn library(&self, library: &LibraryRef) -> CoreResult<Library> {
        self.libraries.get(&library.name).cloned().ok_or_else(|| {
            CoreError::NotFound(format!("Library with name {} not found", library.name))
        })
    }
}

/// Patients and identifier mappings held in memory.
#[derive(Debug, Default)]
pub struct FakePatientDirectory {
    identifiers: HashMap<String, String>,
    patients: HashMap<String, serde_json::Value>,
}

impl FakePatientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `Patient/<id>` resource, optionally findable by an identifier search value.
    pub fn with_patient(mut self, id: &str, identifier: Option<&str>) -> Self {
        self.patients.insert(
            id.to_owned(),
            serde_json::json!({"resourceType": "Patient", "id": id}),
        );
        if let Some(identifier) = identifier {
            self.identifiers
                .insert(identifier.to_owned(), id.to_owned());
        }
        self
    }
}

#[async_trait]
impl PatientDirectory for FakePatientDirectory {
    async fn resolve_identifier(&self, identifier: &IdentifierToken) -> CoreResult<String> {
        self.identifiers
            .get(identifier.as_search_value())
            .cloned()
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "Patient with identifier {identifier} not found"
                ))
            })
    }

    async fn patient(&self, patient_id: &str) -> CoreResult<Option<serde_json::Value>> {
        Ok(self.patients.get(patient_id).cloned())
    }
}
