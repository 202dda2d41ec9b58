//! Structured-query tuple records to answers and supporting resources.
//!
//! A tuple record's `answerValue` is a `^`-delimited positional payload:
//! `effective ^ system ^ code ^ display [^ value [^ unit]]`. The `fhirField` hint picks the
//! kind of supporting resource to synthesize from those positions.

use super::LinkContext;
use fhir::datatypes::{
    Annotation, CodeableConcept, Coding, Dosage, DoseAndRate, Quantity, Ratio, Reference,
};
use fhir::resources::{
    Condition, MedicationRequest, MedicationStatement, Observation, ObservationValue, Procedure,
};
use fhir::{BundleEntry, Question, Resource};

use crate::tuple::DecodedTupleRecord;

/// Supporting resource kinds that can be synthesized from a tuple record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupportingKind {
    MedicationStatement,
    MedicationRequest,
    Observation,
    Condition,
    Procedure,
}

impl SupportingKind {
    /// Maps a `fhirField` hint to a resource kind.
    ///
    /// A dotted hint (`Procedure.code`) names the resource type directly; bare hints use a
    /// fixed table.
    pub fn from_field(field: &str) -> Option<Self> {
        if let Some((resource_type, _)) = field.split_once('.') {
            return Self::from_resource_type(resource_type);
        }
        match field {
            "dosage" => Some(Self::MedicationStatement),
            "value" | "code" => Some(Self::Observation),
            "onset" => Some(Self::Condition),
            _ => None,
        }
    }

    fn from_resource_type(resource_type: &str) -> Option<Self> {
        match resource_type {
            "MedicationStatement" => Some(Self::MedicationStatement),
            "MedicationRequest" => Some(Self::MedicationRequest),
            "Observation" => Some(Self::Observation),
            "Condition" => Some(Self::Condition),
            "Procedure" => Some(Self::Procedure),
            _ => None,
        }
    }

    pub fn resource_type(self) -> &'static str {
        match self {
            Self::MedicationStatement => "MedicationStatement",
            Self::MedicationRequest => "MedicationRequest",
            Self::Observation => "Observation",
            Self::Condition => "Condition",
            Self::Procedure => "Procedure",
        }
    }
}

/// The id part of a resource path: the segment before `_history` for versioned paths,
/// otherwise the last segment.
pub fn resource_id_from_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let id = if path.contains("_history") && segments.len() >= 3 {
        segments[segments.len() - 3]
    } else {
        segments.last().copied().unwrap_or(path)
    };
    id.to_owned()
}

/// Entries produced from one tuple record.
pub(super) struct LinkedTuple {
    pub answer: BundleEntry,
    pub supporting: Option<BundleEntry>,
}

/// Builds the answer (and supporting resource) for one tuple record.
///
/// Returns `Ok(None)` for records that are skipped (`null` sentinel) and `Err(diagnostics)`
/// when the record's field hint cannot be mapped to a resource kind.
pub(super) fn link_tuple_record(
    context: &LinkContext<'_>,
    question: &Question,
    record: &DecodedTupleRecord,
) -> Result<Option<LinkedTuple>, String> {
    if record.is_null_answer() {
        tracing::warn!(
            "Found a null in tuple results for question {}, please investigate for possible data error",
            question.link_id
        );
        return Ok(None);
    }
    let Some(answer_value) = record.answer_value() else {
        return Err(format!(
            "Tuple result for question {} has no answerValue",
            question.link_id
        ));
    };
    let field = record.fhir_field().unwrap_or_default();
    let kind = SupportingKind::from_field(field).ok_or_else(|| {
        format!(
            "The fhirField {field:?} returned for question {} is not a supported supporting resource type",
            question.link_id
        )
    })?;

    let segments = record.answer_segments();
    let effective = if segments.len() >= 3 {
        normalize_effective(segments[0])
    } else {
        context.timestamp()
    };
    let resource_id = record
        .fhir_resource_id()
        .filter(|id| !id.trim().is_empty())
        .map(resource_id_from_path)
        .unwrap_or_else(rc_uuid::new_resource_id);

    let supporting = build_supporting(context, kind, &resource_id, &effective, record, &segments)
        .and_then(|resource| match BundleEntry::from_resource(&resource) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::error!("could not serialize supporting resource: {e}");
                None
            }
        });

    let mut answer = context.answer_observation(question, false);
    answer.effective_date_time = effective;
    answer.value = Some(ObservationValue::String(answer_value.to_owned()));
    if let Some(note) = record.source_note() {
        answer.note = vec![Annotation {
            text: note.to_owned(),
        }];
    }
    if let Some(entry) = &supporting {
        answer.focus = vec![Reference::new(entry.full_url.clone())];
    }

    let answer = BundleEntry::from_resource(&Resource::Observation(answer))
        .map_err(|e| format!("could not serialize tuple answer: {e}"))?;
    Ok(Some(LinkedTuple { answer, supporting }))
}

/// Dates without a zone (`YYYY-MM-DDTHH:MM:SS`) are UTC; mark them with `Z`.
fn normalize_effective(raw: &str) -> String {
    if raw.len() == 19 {
        format!("{raw}Z")
    } else {
        raw.to_owned()
    }
}

fn build_supporting(
    context: &LinkContext<'_>,
    kind: SupportingKind,
    id: &str,
    effective: &str,
    record: &DecodedTupleRecord,
    segments: &[&str],
) -> Option<Resource> {
    if segments.len() < 4 {
        tracing::warn!(
            "tuple answer has {} positional fields, a {} needs at least 4",
            segments.len(),
            kind.resource_type()
        );
        return None;
    }

    let identifier = context.identifier(format!("{}/{id}", kind.resource_type()));
    let code: CodeableConcept = Coding::new(segments[1], segments[2], segments[3]).into();
    let subject = Reference::patient(context.patient_id);
    let id = id.to_owned();
    let effective = effective.to_owned();

    let resource = match kind {
        SupportingKind::MedicationStatement => Resource::MedicationStatement(MedicationStatement {
            id,
            identifier,
            status: "active".into(),
            medication_codeable_concept: code,
            effective_date_time: effective,
            subject,
            dosage: dosage(segments),
        }),
        SupportingKind::MedicationRequest => Resource::MedicationRequest(MedicationRequest {
            id,
            identifier,
            status: "active".into(),
            intent: "order".into(),
            medication_codeable_concept: code,
            authored_on: effective,
            subject,
            dosage_instruction: dosage(segments),
        }),
        SupportingKind::Observation => Resource::Observation(Observation {
            id,
            identifier,
            status: "final".into(),
            category: Vec::new(),
            code,
            effective_date_time: effective,
            subject,
            focus: Vec::new(),
            note: Vec::new(),
            component: Vec::new(),
            value: observation_value(record.value_type(), segments),
        }),
        SupportingKind::Condition => Resource::Condition(Condition {
            id,
            identifier,
            code,
            onset_date_time: effective,
            subject,
        }),
        SupportingKind::Procedure => Resource::Procedure(Procedure {
            id,
            identifier,
            code,
            performed_date_time: effective,
            subject,
        }),
    };
    Some(resource)
}

fn dosage(segments: &[&str]) -> Vec<Dosage> {
    let Some(value) = segments.get(4) else {
        return Vec::new();
    };
    vec![Dosage {
        dose_and_rate: vec![DoseAndRate {
            dose_quantity: Quantity::from_text(value, segments.get(5).copied()),
        }],
    }]
}

fn observation_value(value_type: Option<&str>, segments: &[&str]) -> Option<ObservationValue> {
    let value_type = value_type.unwrap_or_default();
    let value = segments.get(4).copied();
    match value_type {
        "Quantity" => {
            let unit = if segments.len() == 6 { segments.get(5).copied() } else { None };
            value.map(|v| ObservationValue::Quantity(Quantity::from_text(v, unit)))
        }
        "String" => value.map(|v| ObservationValue::String(v.to_owned())),
        "Ratio" => {
            let (numerator, denominator) = value?.split_once(':').or_else(|| {
                tracing::warn!("Ratio value {value:?} is not of the form n:d");
                None
            })?;
            Some(ObservationValue::Ratio(Ratio {
                numerator: Quantity::from_text(numerator, None),
                denominator: Quantity::from_text(denominator, None),
            }))
        }
        "CodeableConcept" => match (segments.get(4), segments.get(5), segments.get(6)) {
            (Some(system), Some(code), Some(display)) => Some(ObservationValue::CodeableConcept(
                Coding::new(*system, *code, *display).into(),
            )),
            _ => {
                tracing::warn!("CodeableConcept value needs system, code and display");
                None
            }
        },
        "Integer" => match value?.trim().parse::<i64>() {
            Ok(n) => Some(ObservationValue::Integer(n)),
            Err(e) => {
                tracing::warn!("Integer value {value:?} could not be parsed: {e}");
                None
            }
        },
        other => Some(ObservationValue::String(format!(
            "value[x] type of {other} not being handled"
        ))),
    }
}
