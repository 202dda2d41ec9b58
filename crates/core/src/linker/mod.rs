//! Result linking.
//!
//! The linker walks the job package's questions in form order, looks up each question's task
//! in the [`NormalizedResultMap`], and writes answer `Observation`s plus any supporting
//! resources into an evidence [`Bundle`].
//!
//! Per structured-query question:
//! 1. skip questions without a structured-query task (or outside the single library that ran)
//! 2. skip tasks with no result
//! 3. a resource list becomes focus references; a scalar is a candidate value; a `[Tuple`
//!    scalar is decoded into one answer per tuple record
//! 4. `series` without tuples keeps focus only; otherwise the value is attached
//! 5. answers with neither value nor focus are dropped
//! 6. entries are appended, deduplicated by `fullUrl`
//!
//! Text-analytics questions are handled in [`text`].

mod supporting;
mod text;

use crate::constants::{FORM_CODE_SYSTEM_PREFIX, OBSERVATION_CATEGORY_SYSTEM};
use crate::normalizer::{NormalizedResultMap, NormalizedValue};
use crate::tuple;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use fhir::datatypes::{CodeableConcept, Coding, Identifier, Reference};
use fhir::resources::{Observation, ObservationValue};
use fhir::{
    BackendKind, Bundle, BundleEntry, Cardinality, IssueCode, IssueSeverity, JobPackage,
    OperationOutcome, OperationOutcomeIssue, Question, Resource, FHIR_DATETIME_FORMAT,
};

pub use supporting::{resource_id_from_path, SupportingKind};

/// Everything the linker needs besides the results.
#[derive(Clone, Debug)]
pub struct LinkContext<'a> {
    pub package: &'a JobPackage,
    pub patient_id: &'a str,
    /// Identifier system for synthesized resources.
    pub deploy_url: &'a str,
    /// `Patient` read from the patient directory, used when no backend returned one.
    pub patient_resource: Option<serde_json::Value>,
    pub now: DateTime<Utc>,
}

impl LinkContext<'_> {
    pub(crate) fn timestamp(&self) -> String {
        self.now.format(FHIR_DATETIME_FORMAT).to_string()
    }

    pub(crate) fn form_system(&self) -> String {
        format!("{FORM_CODE_SYSTEM_PREFIX}{}", self.package.name)
    }

    pub(crate) fn identifier(&self, full_url: String) -> Vec<Identifier> {
        vec![Identifier {
            system: self.deploy_url.to_owned(),
            value: full_url,
        }]
    }

    pub(crate) fn patient_entry(&self, resource: serde_json::Value) -> BundleEntry {
        BundleEntry::new(format!("Patient/{}", self.patient_id), resource)
    }

    /// A fresh answer observation for `question` with no value or focus yet.
    pub(crate) fn answer_observation(&self, question: &Question, display: bool) -> Observation {
        let id = rc_uuid::new_resource_id();
        let coding = if display {
            Coding::new(self.form_system(), &question.link_id, &question.text)
        } else {
            Coding::code_only(self.form_system(), &question.link_id)
        };
        Observation {
            identifier: self.identifier(format!("Observation/{id}")),
            id,
            status: "final".into(),
            category: vec![Coding::new(OBSERVATION_CATEGORY_SYSTEM, "survey", "Survey").into()],
            code: CodeableConcept::from(coding),
            effective_date_time: self.timestamp(),
            subject: Reference::patient(self.patient_id),
            focus: Vec::new(),
            note: Vec::new(),
            component: Vec::new(),
            value: None,
        }
    }
}

/// The linked bundle plus per-record issues that did not abort linking.
///
/// When there are issues the bundle also carries them as one `OperationOutcome` entry.
#[derive(Clone, Debug)]
pub struct LinkedEvidence {
    pub bundle: Bundle,
    pub issues: Vec<OperationOutcomeIssue>,
}

/// Links normalized results to the job package's questions.
///
/// # Errors
///
/// Returns [`CoreError::Transient`] if neither backend produced any results to link.
pub fn link(context: &LinkContext<'_>, results: &NormalizedResultMap) -> CoreResult<LinkedEvidence> {
    let mut issues = Vec::new();

    let structured = results
        .ran(BackendKind::StructuredQuery)
        .then(|| link_structured(context, results, &mut issues));
    let text_analytics = results
        .ran(BackendKind::TextAnalytics)
        .then(|| text::link_text_analytics(context, results, structured.is_none()));

    let mut bundle = match (structured, text_analytics) {
        (Some(mut structured), Some(text_analytics)) => {
            structured.extend_unique(text_analytics.entry);
            structured
        }
        (Some(bundle), None) | (None, Some(bundle)) => bundle,
        (None, None) => {
            tracing::error!("no backend produced results, the return bundle is empty");
            return Err(CoreError::Transient(
                "Something went wrong and there is an empty return bundle".into(),
            ));
        }
    };
    if !issues.is_empty() {
        match serde_json::to_value(OperationOutcome::from_issues(issues.clone())) {
            Ok(resource) => {
                let full_url = format!("OperationOutcome/{}", rc_uuid::new_resource_id());
                bundle.push_unique(BundleEntry::new(full_url, resource));
            }
            Err(e) => tracing::error!("could not serialize linking issues: {e}"),
        }
    }
    bundle.total = bundle.entry.len();

    Ok(LinkedEvidence { bundle, issues })
}

/// Logs the per-question progress line.
pub(crate) fn log_progress(question: &Question, current: usize, total: usize) {
    let pct = if total == 0 {
        100.0
    } else {
        current as f64 / total as f64 * 100.0
    };
    tracing::info!(
        "Working on question {} - {current}/{total} ({pct:.2}%)",
        question.link_id
    );
}

fn link_structured(
    context: &LinkContext<'_>,
    results: &NormalizedResultMap,
    issues: &mut Vec<OperationOutcomeIssue>,
) -> Bundle {
    let mut bundle = Bundle::collection();

    match results.get(BackendKind::StructuredQuery, "Patient") {
        Some(NormalizedValue::Scalar(patient)) => {
            bundle.push_unique(context.patient_entry(patient.clone()));
        }
        _ => match &context.patient_resource {
            Some(patient) => {
                tracing::warn!("Patient not in structured-query results, using the patient directory");
                bundle.push_unique(context.patient_entry(patient.clone()));
            }
            None => tracing::error!(
                "Patient resource not found in structured-query results or the patient directory"
            ),
        },
    }

    let libraries = results.libraries(BackendKind::StructuredQuery);
    let target_library = (libraries.len() == 1).then(|| libraries[0].as_str());

    let total = context.package.question_count();
    for (index, question) in context.package.questions().enumerate() {
        log_progress(question, index + 1, total);

        let Some(task) = question
            .task
            .as_ref()
            .filter(|t| t.backend == BackendKind::StructuredQuery)
        else {
            tracing::debug!("No structured-query task for question {}", question.link_id);
            continue;
        };
        if target_library.is_some_and(|target| target != task.library) {
            continue;
        }

        let Some(value) = results.get(BackendKind::StructuredQuery, &task.task) else {
            tracing::error!(
                "The task {} was not found in the library {}, moving onto the next question",
                task.task,
                task.library
            );
            continue;
        };

        let (mut scalar, mut supporting) = match value {
            NormalizedValue::Resources(entries) => (None, entries.clone()),
            NormalizedValue::Scalar(value) => (Some(value.clone()), Vec::new()),
            NormalizedValue::Records(_) => {
                tracing::warn!("task {} returned text-analytics records", task.task);
                continue;
            }
        };

        // A lone resource is evidence, not an answer value.
        if let Some(entry) = scalar.as_ref().and_then(single_resource_entry) {
            supporting.push(entry);
            scalar = None;
        }

        if let Some(evidence) = results.get(BackendKind::StructuredQuery, &format!("{}_evidence", task.task)) {
            supporting = match evidence {
                NormalizedValue::Resources(entries) => entries.clone(),
                _ => Vec::new(),
            };
        }

        let tuple_text = scalar
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .filter(|s| tuple::looks_like_tuple_list(s))
            .map(str::to_owned);

        if let Some(tuple_text) = tuple_text {
            let records = match tuple::decode(&tuple_text) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!("could not decode tuple result for question {}: {e}", question.link_id);
                    continue;
                }
            };
            for record in &records {
                match supporting::link_tuple_record(context, question, record) {
                    Ok(Some(linked)) => {
                        bundle.push_unique(linked.answer);
                        if let Some(resource) = linked.supporting {
                            bundle.push_unique(resource);
                        }
                    }
                    Ok(None) => {}
                    Err(diagnostics) => {
                        tracing::warn!("{diagnostics}");
                        issues.push(OperationOutcomeIssue {
                            severity: IssueSeverity::Warning,
                            code: IssueCode::NotFound,
                            diagnostics,
                        });
                    }
                }
            }
            bundle.extend_unique(supporting);
            continue;
        }

        let scalar_text = scalar.as_ref().and_then(scalar_text);
        if scalar_text.is_none() && supporting.is_empty() {
            tracing::debug!("Empty result for question {}", question.link_id);
            continue;
        }

        let mut answer = context.answer_observation(question, true);
        answer.focus = supporting
            .iter()
            .map(|entry| Reference::new(entry.full_url.clone()))
            .collect();
        if question.cardinality == Cardinality::Single {
            answer.value = scalar_text.map(ObservationValue::String);
        }
        if !answer.has_evidence() {
            continue;
        }

        match BundleEntry::from_resource(&Resource::Observation(answer)) {
            Ok(entry) => {
                bundle.push_unique(entry);
            }
            Err(e) => tracing::error!("could not serialize answer for {}: {e}", question.link_id),
        }
        bundle.extend_unique(supporting);
    }

    bundle
}

/// Text of a scalar answer, or `None` when the value counts as empty.
fn scalar_text(value: &serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::Null => return None,
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) if items.is_empty() => return None,
        serde_json::Value::Object(map) if map.is_empty() => return None,
        other => other.to_string(),
    };
    match text.trim() {
        "" | "[]" | "null" => None,
        _ => Some(text),
    }
}

/// A scalar that is itself a resource with an id, as a bundle entry.
fn single_resource_entry(value: &serde_json::Value) -> Option<BundleEntry> {
    let resource_type = value.get("resourceType")?.as_str()?;
    let id = value.get("id")?.as_str()?;
    Some(BundleEntry::new(format!("{resource_type}/{id}"), value.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{RawBackendResult, RawPayload};
    use crate::dispatch::CorrelationId;
    use crate::normalizer::normalize;
    use fhir::LibraryRef;
    use serde_json::json;

    pub(super) fn package() -> JobPackage {
        JobPackage::from_questionnaire(json!({
            "resourceType": "Questionnaire",
            "name": "SyphilisRegistry",
            "item": [{
                "linkId": "g1",
                "text": "Group",
                "item": [
                    {"linkId": "age", "text": "Age", "extension": [
                        {"url": fhir::questionnaire::CQL_TASK_URL, "valueString": "demographics.Age"}
                    ]},
                    {"linkId": "meds", "text": "Medications", "extension": [
                        {"url": fhir::questionnaire::CQL_TASK_URL, "valueString": "demographics.Meds"},
                        {"url": fhir::questionnaire::CARDINALITY_URL, "valueString": "series"}
                    ]},
                    {"linkId": "empty", "text": "Empty", "extension": [
                        {"url": fhir::questionnaire::CQL_TASK_URL, "valueString": "demographics.Empty"}
                    ]},
                    {"linkId": "dose", "text": "Dose", "extension": [
                        {"url": fhir::questionnaire::CQL_TASK_URL, "valueString": "demographics.Dose"}
                    ]},
                    {"linkId": "missing", "text": "Missing", "extension": [
                        {"url": fhir::questionnaire::CQL_TASK_URL, "valueString": "demographics.Missing"}
                    ]},
                    {"linkId": "pregnant", "text": "Pregnant", "extension": [
                        {"url": fhir::questionnaire::NLPQL_TASK_URL, "valueString": "notes.Pregnancy"}
                    ]}
                ]
            }]
        }))
        .expect("package")
    }

    pub(super) fn context(package: &JobPackage) -> LinkContext<'_> {
        LinkContext {
            package,
            patient_id: "p1",
            deploy_url: "http://example.org/",
            patient_resource: None,
            now: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .expect("timestamp")
                .with_timezone(&Utc),
        }
    }

    fn entry(task: &str, value: serde_json::Value) -> serde_json::Value {
        json!({"fullUrl": task, "resource": {"parameter": [{"name": "name", "valueString": task}, value]}})
    }

    fn structured(entries: Vec<serde_json::Value>) -> NormalizedResultMap {
        normalize(vec![RawBackendResult {
            correlation: CorrelationId::for_tests(1),
            library: LibraryRef {
                name: "demographics".into(),
                kind: BackendKind::StructuredQuery,
            },
            patient_id: "p1".into(),
            payload: RawPayload::StructuredQuery(json!({"entry": entries})),
        }])
    }

    fn answers_for<'b>(bundle: &'b Bundle, link_id: &str) -> Vec<&'b serde_json::Value> {
        bundle
            .entry
            .iter()
            .map(|e| &e.resource)
            .filter(|r| r["resourceType"] == "Observation" && r["code"]["coding"][0]["code"] == link_id)
            .collect()
    }

    #[test]
    fn single_scalar_becomes_value_without_focus() {
        let package = package();
        let results = structured(vec![
            entry("Patient", json!({"name": "value", "resource": {"resourceType": "Patient", "id": "p1"}})),
            entry("Age", json!({"name": "value", "valueString": "42"})),
        ]);
        let linked = link(&context(&package), &results).expect("link");

        assert_eq!(linked.bundle.entry[0].full_url, "Patient/p1");
        let answers = answers_for(&linked.bundle, "age");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0]["valueString"], "42");
        assert!(answers[0].get("focus").is_none());
        assert_eq!(answers[0]["code"]["coding"][0]["system"], "urn:gtri:heat:form:SyphilisRegistry");
        assert_eq!(answers[0]["code"]["coding"][0]["display"], "Age");
        assert_eq!(answers[0]["effectiveDateTime"], "2024-05-01T12:00:00Z");
        assert_eq!(linked.bundle.total, linked.bundle.entry.len());
    }

    #[test]
    fn series_resource_list_becomes_focus_without_value() {
        let package = package();
        let results = structured(vec![entry(
            "Meds",
            json!({"name": "value", "resource": {"resourceType": "Bundle", "entry": [
                {"fullUrl": "MedicationStatement/1", "resource": {"resourceType": "MedicationStatement", "id": "1"}},
                {"fullUrl": "MedicationStatement/2", "resource": {"resourceType": "MedicationStatement", "id": "2"}}
            ]}}),
        )]);
        let linked = link(&context(&package), &results).expect("link");

        let answers = answers_for(&linked.bundle, "meds");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0]["focus"].as_array().map(Vec::len), Some(2));
        assert!(answers[0].get("valueString").is_none());
        assert!(linked.bundle.contains("MedicationStatement/1"));
        assert!(linked.bundle.contains("MedicationStatement/2"));
    }

    #[test]
    fn empty_values_produce_no_answer() {
        let package = package();
        let results = structured(vec![
            entry("Empty", json!({"name": "value", "valueString": "[]"})),
            entry("Age", json!({"name": "value"})),
        ]);
        let linked = link(&context(&package), &results).expect("link");
        assert!(answers_for(&linked.bundle, "empty").is_empty());
        assert!(answers_for(&linked.bundle, "age").is_empty());
        for entry in &linked.bundle.entry {
            let r = &entry.resource;
            if r["resourceType"] == "Observation" && r.get("category").is_some() {
                assert!(r.get("valueString").is_some() || r.get("focus").is_some());
            }
        }
    }

    #[test]
    fn evidence_companion_adds_focus() {
        let package = package();
        let results = structured(vec![
            entry("Age", json!({"name": "value", "valueString": "42"})),
            entry("Age_evidence", json!({"name": "value", "resource": {"resourceType": "Bundle", "entry": [
                {"fullUrl": "Observation/age-1", "resource": {"resourceType": "Observation", "id": "age-1"}}
            ]}})),
        ]);
        let linked = link(&context(&package), &results).expect("link");
        let answers = answers_for(&linked.bundle, "age");
        assert_eq!(answers[0]["valueString"], "42");
        assert_eq!(answers[0]["focus"][0]["reference"], "Observation/age-1");
        assert!(linked.bundle.contains("Observation/age-1"));
    }

    #[test]
    fn tuple_answer_yields_medication_statement() {
        let package = package();
        let results = structured(vec![entry(
            "Dose",
            json!({"name": "value", "valueString": "[Tuple {answerValue: \"2020-01-01^sys^code^disp^5^mg\"\tfhirField: \"dosage\"\tsourceNote: \"note\"\tvalueType: \"String\"\tfhirResourceId: \"MedicationStatement/ms-1/_history/2\"}]"}),
        )]);
        let linked = link(&context(&package), &results).expect("link");

        let answers = answers_for(&linked.bundle, "dose");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0]["focus"][0]["reference"], "MedicationStatement/ms-1");
        assert_eq!(answers[0]["note"][0]["text"], "note");
        assert_eq!(answers[0]["effectiveDateTime"], "2020-01-01");

        let statement = linked
            .bundle
            .entry
            .iter()
            .find(|e| e.full_url == "MedicationStatement/ms-1")
            .expect("supporting resource");
        assert_eq!(statement.resource["effectiveDateTime"], "2020-01-01");
        assert_eq!(statement.resource["dosage"][0]["doseAndRate"][0]["doseQuantity"]["unit"], "mg");
    }

    #[test]
    fn unsupported_field_hint_is_reported_as_issue() {
        let package = package();
        let results = structured(vec![entry(
            "Dose",
            json!({"name": "value", "valueString": "[Tuple {answerValue: \"2020-01-01^s^c^d\"\tfhirField: \"reaction\"}]"}),
        )]);
        let linked = link(&context(&package), &results).expect("link");
        assert_eq!(linked.issues.len(), 1);
        assert_eq!(linked.issues[0].code, IssueCode::NotFound);
        assert!(answers_for(&linked.bundle, "dose").is_empty());

        let outcome = linked
            .bundle
            .entry
            .iter()
            .find(|e| e.full_url.starts_with("OperationOutcome/"))
            .expect("outcome entry");
        assert_eq!(outcome.resource["issue"][0]["code"], "not-found");
        assert_eq!(outcome.resource["issue"][0]["severity"], "warning");
        assert!(outcome.resource["issue"][0]["diagnostics"]
            .as_str()
            .is_some_and(|d| d.contains("reaction")));
        assert_eq!(linked.bundle.total, linked.bundle.entry.len());
    }

    #[test]
    fn no_results_is_transient() {
        let package = package();
        let err = link(&context(&package), &NormalizedResultMap::default()).expect_err("empty");
        assert!(matches!(err, CoreError::Transient(_)));
    }

    #[test]
    fn directory_patient_used_when_results_lack_one() {
        let package = package();
        let mut ctx = context(&package);
        ctx.patient_resource = Some(json!({"resourceType": "Patient", "id": "p1"}));
        let results = structured(vec![entry("Age", json!({"name": "value", "valueString": "42"}))]);
        let linked = link(&ctx, &results).expect("link");
        assert_eq!(linked.bundle.entry[0].full_url, "Patient/p1");
    }
}
