//! Resources synthesized into the evidence bundle.
//!
//! Answer records are `Observation`s. Supporting resources are one of a fixed set of kinds
//! (`MedicationStatement`, `MedicationRequest`, `Observation`, `Condition`, `Procedure`) and
//! source documents are `DocumentReference`s. All are serialize-only: they are built by the
//! linker and written into a bundle, never read back as typed values.

use crate::datatypes::{
    Annotation, Attachment, CodeableConcept, Dosage, Identifier, Quantity, Ratio, Reference,
};
use serde::Serialize;

// ============================================================================
// Observation
// ============================================================================

/// The `value[x]` choice of an Observation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ObservationValue {
    #[serde(rename = "valueString")]
    String(String),
    #[serde(rename = "valueQuantity")]
    Quantity(Quantity),
    #[serde(rename = "valueRatio")]
    Ratio(Ratio),
    #[serde(rename = "valueCodeableConcept")]
    CodeableConcept(CodeableConcept),
    #[serde(rename = "valueInteger")]
    Integer(i64),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationComponent {
    pub code: CodeableConcept,
    pub value_string: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<CodeableConcept>,
    pub code: CodeableConcept,
    pub effective_date_time: String,
    pub subject: Reference,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub focus: Vec<Reference>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub note: Vec<Annotation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub component: Vec<ObservationComponent>,
    #[serde(flatten)]
    pub value: Option<ObservationValue>,
}

impl Observation {
    /// Returns true if the observation carries a value or at least one focus reference.
    ///
    /// Answer observations failing this check must not be written to a bundle.
    pub fn has_evidence(&self) -> bool {
        self.value.is_some() || !self.focus.is_empty()
    }
}

// ============================================================================
// Supporting resources
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationStatement {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub status: String,
    pub medication_codeable_concept: CodeableConcept,
    pub effective_date_time: String,
    pub subject: Reference,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dosage: Vec<Dosage>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationRequest {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub status: String,
    pub intent: String,
    pub medication_codeable_concept: CodeableConcept,
    pub authored_on: String,
    pub subject: Reference,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dosage_instruction: Vec<Dosage>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub code: CodeableConcept,
    pub onset_date_time: String,
    pub subject: Reference,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Procedure {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub code: CodeableConcept,
    pub performed_date_time: String,
    pub subject: Reference,
}

// ============================================================================
// Source documents
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DocumentContent {
    pub attachment: Attachment,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub status: String,
    #[serde(rename = "type")]
    pub doc_type: CodeableConcept,
    pub subject: Reference,
    pub date: String,
    pub content: Vec<DocumentContent>,
}

// ============================================================================
// Resource facade
// ============================================================================

/// Any resource the orchestrator synthesizes, tagged with its `resourceType`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    Observation(Observation),
    MedicationStatement(MedicationStatement),
    MedicationRequest(MedicationRequest),
    Condition(Condition),
    Procedure(Procedure),
    DocumentReference(DocumentReference),
}

impl Resource {
    pub fn resource_type(&self) -> &'static str {
        match self {
            Resource::Observation(_) => "Observation",
            Resource::MedicationStatement(_) => "MedicationStatement",
            Resource::MedicationRequest(_) => "MedicationRequest",
            Resource::Condition(_) => "Condition",
            Resource::Procedure(_) => "Procedure",
            Resource::DocumentReference(_) => "DocumentReference",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Resource::Observation(r) => &r.id,
            Resource::MedicationStatement(r) => &r.id,
            Resource::MedicationRequest(r) => &r.id,
            Resource::Condition(r) => &r.id,
            Resource::Procedure(r) => &r.id,
            Resource::DocumentReference(r) => &r.id,
        }
    }

    /// `<resourceType>/<id>`, used both as bundle `fullUrl` and as a focus reference.
    pub fn full_url(&self) -> String {
        format!("{}/{}", self.resource_type(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::Coding;
    use serde_json::json;

    fn answer(value: Option<ObservationValue>, focus: Vec<Reference>) -> Observation {
        Observation {
            id: "obs-1".into(),
            identifier: vec![Identifier {
                system: "http://example.org/".into(),
                value: "Observation/obs-1".into(),
            }],
            status: "final".into(),
            category: Vec::new(),
            code: Coding::code_only("urn:gtri:heat:form:Registry", "q1").into(),
            effective_date_time: "2024-01-01T00:00:00Z".into(),
            subject: Reference::patient("p1"),
            focus,
            note: Vec::new(),
            component: Vec::new(),
            value,
        }
    }

    #[test]
    fn observation_value_is_flattened() {
        let resource = Resource::Observation(answer(
            Some(ObservationValue::String("42".into())),
            Vec::new(),
        ));
        let value = serde_json::to_value(&resource).expect("serialize");
        assert_eq!(value["resourceType"], "Observation");
        assert_eq!(value["valueString"], "42");
        assert!(value.get("focus").is_none());
        assert!(value.get("value").is_none());
    }

    #[test]
    fn observation_without_value_or_focus_has_no_evidence() {
        assert!(!answer(None, Vec::new()).has_evidence());
        assert!(answer(None, vec![Reference::new("Condition/1")]).has_evidence());
        assert!(answer(Some(ObservationValue::Integer(3)), Vec::new()).has_evidence());
    }

    #[test]
    fn full_url_uses_resource_type_and_id() {
        let resource = Resource::Condition(Condition {
            id: "c9".into(),
            identifier: Vec::new(),
            code: CodeableConcept::default(),
            onset_date_time: "2020-01-01".into(),
            subject: Reference::patient("p1"),
        });
        assert_eq!(resource.full_url(), "Condition/c9");
        let value = serde_json::to_value(&resource).expect("serialize");
        assert_eq!(value["onsetDateTime"], json!("2020-01-01"));
    }
}
