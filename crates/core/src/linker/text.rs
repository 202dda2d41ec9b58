//! Text-analytics records to answers and source documents.
//!
//! Each record that survives filtering yields one answer `Observation` focused on the report
//! it came from. Every report referenced by an answer is written once as a
//! `DocumentReference`, however many answers point at it.

use super::{log_progress, LinkContext};
use crate::constants::{LOINC_SYSTEM, MISSING_REPORT_TEXT, NLP_ANSWER_TYPE_SYSTEM};
use crate::normalizer::{NormalizedResultMap, NormalizedValue, TextAnalyticsRecord};
use crate::tuple::{self, DecodedTupleRecord};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fhir::datatypes::{Annotation, Attachment, Coding, Reference};
use fhir::resources::{DocumentContent, DocumentReference, ObservationComponent, ObservationValue};
use fhir::{BackendKind, Bundle, BundleEntry, Question, Resource};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Links every text-analytics question. `include_patient` adds the directory `Patient` when no
/// structured-query pass supplied one.
pub(super) fn link_text_analytics(
    context: &LinkContext<'_>,
    results: &NormalizedResultMap,
    include_patient: bool,
) -> Bundle {
    let mut bundle = Bundle::collection();
    if include_patient {
        match &context.patient_resource {
            Some(patient) => {
                bundle.push_unique(context.patient_entry(patient.clone()));
            }
            None => tracing::error!("Patient resource not found in the patient directory"),
        }
    }

    let mut documents: Vec<BundleEntry> = Vec::new();
    let mut seen_reports: HashSet<String> = HashSet::new();

    let total = context.package.question_count();
    for (index, question) in context.package.questions().enumerate() {
        let Some(task) = question
            .task
            .as_ref()
            .filter(|t| t.backend == BackendKind::TextAnalytics)
        else {
            continue;
        };
        log_progress(question, index + 1, total);

        // Duplicate answers collapse per question only.
        let mut seen_answers: HashSet<(String, String)> = HashSet::new();
        let Some(NormalizedValue::Records(records)) =
            results.get(BackendKind::TextAnalytics, &task.task)
        else {
            tracing::debug!("No text-analytics records for task {}", task.task);
            continue;
        };

        for record in records {
            if !sentence_in_report(record) {
                tracing::debug!("skipping record {:?}: sentence not in report text", record.id);
                continue;
            }
            let Some(decoded) = decode_record_tuple(record) else {
                continue;
            };
            let Some(answer_value) = decoded.answer_value() else {
                tracing::warn!("text-analytics tuple for {} has no answerValue", question.link_id);
                continue;
            };

            let report_id = record.report_id.clone().unwrap_or_default();
            if !seen_answers.insert((report_id.clone(), answer_value.to_lowercase())) {
                tracing::debug!("dropping duplicate answer {answer_value:?} for report {report_id}");
                continue;
            }

            match answer_entry(context, question, record, &decoded, answer_value) {
                Ok(entry) => {
                    bundle.push_unique(entry);
                }
                Err(e) => {
                    tracing::error!("could not serialize answer for {}: {e}", question.link_id);
                    continue;
                }
            }

            if seen_reports.insert(report_id.clone()) {
                match BundleEntry::from_resource(&Resource::DocumentReference(document(
                    context, record, &report_id,
                ))) {
                    Ok(entry) => documents.push(entry),
                    Err(e) => tracing::error!("could not serialize report {report_id}: {e}"),
                }
            }
        }
    }

    bundle.extend_unique(documents);
    bundle
}

static NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n+").expect("valid regex"));

/// False when the record's sentence cannot be found in its (newline-collapsed) report text.
fn sentence_in_report(record: &TextAnalyticsRecord) -> bool {
    let (Some(sentence), Some(text)) = (&record.sentence, &record.report_text) else {
        return true;
    };
    let collapsed = NEWLINES.replace_all(&text.to_lowercase(), " ").into_owned();
    collapsed.contains(&sentence.to_lowercase())
}

fn decode_record_tuple(record: &TextAnalyticsRecord) -> Option<DecodedTupleRecord> {
    let raw = record.tuple.as_deref().filter(|t| !t.trim().is_empty())?;
    match tuple::decode_key_values(raw) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::warn!("could not decode tuple for record {:?}: {e}", record.id);
            None
        }
    }
}

fn answer_entry(
    context: &LinkContext<'_>,
    question: &Question,
    record: &TextAnalyticsRecord,
    decoded: &DecodedTupleRecord,
    answer_value: &str,
) -> fhir::FhirResult<BundleEntry> {
    let report_id = record.report_id.as_deref().unwrap_or_default();
    let mut answer = context.answer_observation(question, false);
    answer.focus = vec![Reference::new(format!("DocumentReference/{report_id}"))];
    answer.effective_date_time = record
        .report_date
        .as_deref()
        .map(normalize_report_date)
        .unwrap_or_else(|| context.timestamp());
    if let Some(note) = decoded.source_note() {
        answer.note = vec![Annotation {
            text: note.trim().to_owned(),
        }];
    }
    answer.component = components(decoded);
    answer.value = Some(ObservationValue::String(answer_value.to_owned()));
    BundleEntry::from_resource(&Resource::Observation(answer))
}

/// Components describing the answer, keyed by the tuple's `answerType`.
fn components(decoded: &DecodedTupleRecord) -> Vec<ObservationComponent> {
    let answer_type = decoded.answer_type().unwrap_or("generic");
    let answer = decoded.answer_value().unwrap_or_default();
    let note = decoded.source_note().map(str::trim).unwrap_or_default();

    let mut out = vec![component("nlp-answer-type", "NLP Answer Type", answer_type)];
    match answer_type.to_lowercase().as_str() {
        "providerassertion" => {
            out.push(component("term", "Term", answer));
            out.push(component("text-fragment", "Text Fragment", note));
        }
        "sectionfindertask" => {
            out.push(component("section-header", "Section Header", answer));
            out.push(component("section-text", "Section Text", note));
        }
        "openaitask" => {
            out.push(component("llm-prompt", "LLM Prompt", note));
            out.push(component("llm-answer", "LLM Answer", answer));
        }
        other => {
            if other != "generic" {
                tracing::debug!("unknown answerType {answer_type}, labelling as Generic");
                out[0] = component("nlp-answer-type", "NLP Answer Type", "Generic");
            }
            out.push(component("generic-answer", "Generic Answer", answer));
            out.push(component("generic-source", "Generic Source", note));
        }
    }
    out
}

fn component(code: &str, display: &str, value: &str) -> ObservationComponent {
    ObservationComponent {
        code: Coding::new(NLP_ANSWER_TYPE_SYSTEM, code, display).into(),
        value_string: value.to_owned(),
    }
}

/// `YYYY-MM-DD` becomes midnight UTC; a zone-less timestamp gets `Z`.
fn normalize_report_date(date: &str) -> String {
    match date.len() {
        10 => format!("{date}T00:00:00Z"),
        19 => format!("{date}Z"),
        _ => date.to_owned(),
    }
}

/// LOINC coding for a report type; unknown or absent types are a generic note.
fn report_type_coding(report_type: Option<&str>) -> Coding {
    let (code, display) = match report_type.unwrap_or_default() {
        "Radiology Note" => ("75490-3", "Radiology Note"),
        "Discharge summary" => ("18842-5", "Discharge summary"),
        "Hospital Note" => ("34112-3", "Hospital Note"),
        "Pathology consult note" => ("60570-9", "Pathology Consult note"),
        "Ancillary eye tests Narrative" => ("70946-9", "Ancillary eye tests Narrative"),
        "Nursing notes" => ("46208-5", "Nursing notes"),
        _ => ("34109-9", "Note"),
    };
    Coding::new(LOINC_SYSTEM, code, display)
}

fn document(context: &LinkContext<'_>, record: &TextAnalyticsRecord, report_id: &str) -> DocumentReference {
    let text = record
        .report_text
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or(MISSING_REPORT_TEXT);
    DocumentReference {
        id: report_id.to_owned(),
        identifier: context.identifier(format!("DocumentReference/{report_id}")),
        status: "current".into(),
        doc_type: report_type_coding(record.report_type.as_deref()).into(),
        subject: Reference::patient(context.patient_id),
        date: record
            .report_date
            .as_deref()
            .map(normalize_report_date)
            .unwrap_or_else(|| context.timestamp()),
        content: vec![DocumentContent {
            attachment: Attachment {
                content_type: "text/plain".into(),
                language: "en-US".into(),
                data: STANDARD.encode(text),
            },
        }],
    }
}
