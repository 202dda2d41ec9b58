//! Job package (`Questionnaire`) wire model and translation.
//!
//! A job package is authored as a FHIR `Questionnaire`. The orchestrator only needs a small
//! projection of it:
//! - the declared library lists (`cql-form-job-list` / `nlpql-form-job-list` extensions)
//! - the ordered groups of questions
//! - per question: the bound task (`cqlTask` / `nlpqlTask`) and the `cardinality`
//!
//! Unlike on-disk formats, Questionnaires come from a FHIR server and carry many elements the
//! orchestrator ignores, so the wire structs accept unknown fields.

use crate::{FhirError, FhirResult};
use rc_types::NonEmptyText;
use serde::Deserialize;

/// Extension listing the structured-query libraries a job package runs.
pub const CQL_JOB_LIST_URL: &str = "http://gtri.gatech.edu/fakeFormIg/cql-form-job-list";
/// Extension listing the text-analytics libraries a job package runs.
pub const NLPQL_JOB_LIST_URL: &str = "http://gtri.gatech.edu/fakeFormIg/nlpql-form-job-list";
/// Question extension binding a structured-query task (`Library.Task`).
pub const CQL_TASK_URL: &str = "http://gtri.gatech.edu/fakeFormIg/cqlTask";
/// Question extension binding a text-analytics task (`Library.Task`).
pub const NLPQL_TASK_URL: &str = "http://gtri.gatech.edu/fakeFormIg/nlpqlTask";
/// Question extension carrying `single` or `series`.
pub const CARDINALITY_URL: &str = "http://gtri.gatech.edu/fakeFormIg/cardinality";

// ============================================================================
// Public domain-level types
// ============================================================================

/// Which backend executes a library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    /// Declarative query-language libraries (CQL).
    StructuredQuery,
    /// Text-analytics libraries (NLPQL).
    TextAnalytics,
}

impl BackendKind {
    /// File extension used in job lists (`cql` / `nlpql`).
    pub fn extension(self) -> &'static str {
        match self {
            BackendKind::StructuredQuery => "cql",
            BackendKind::TextAnalytics => "nlpql",
        }
    }

    /// `Library.content[0].contentType` for this kind.
    pub fn content_type(self) -> &'static str {
        match self {
            BackendKind::StructuredQuery => "text/cql",
            BackendKind::TextAnalytics => "text/nlpql",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "cql" => Some(BackendKind::StructuredQuery),
            "nlpql" => Some(BackendKind::TextAnalytics),
            _ => None,
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            "text/cql" => Some(BackendKind::StructuredQuery),
            "text/nlpql" => Some(BackendKind::TextAnalytics),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// A library named in a job list or a `job` request parameter (`Name.ext`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LibraryRef {
    pub name: String,
    pub kind: BackendKind,
}

impl LibraryRef {
    /// Parses `Name.ext`. A bare `Name` defaults to a structured-query library.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] for a blank name or an unknown extension.
    pub fn parse(input: &str) -> FhirResult<Self> {
        let input = input.trim();
        let (name, kind) = match input.rsplit_once('.') {
            Some((name, ext)) => {
                let kind = BackendKind::from_extension(ext).ok_or_else(|| {
                    FhirError::InvalidInput(format!(
                        "library '{input}' must end in .cql or .nlpql"
                    ))
                })?;
                (name, kind)
            }
            None => (input, BackendKind::StructuredQuery),
        };
        if name.is_empty() {
            return Err(FhirError::InvalidInput(format!(
                "library reference '{input}' has no name"
            )));
        }
        Ok(Self {
            name: name.to_owned(),
            kind,
        })
    }

    /// `Name.ext`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.kind.extension())
    }
}

/// The task a question is bound to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReference {
    pub library: String,
    pub task: String,
    pub backend: BackendKind,
}

impl TaskReference {
    /// Parses `Library.Task`; `None` if either side is empty or the dot is missing.
    fn parse(value: &str, backend: BackendKind) -> Option<Self> {
        let (library, task) = value.split_once('.')?;
        if library.trim().is_empty() || task.trim().is_empty() {
            return None;
        }
        Some(Self {
            library: library.trim().to_owned(),
            task: task.trim().to_owned(),
            backend,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Cardinality {
    #[default]
    Single,
    Series,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub link_id: String,
    pub text: String,
    pub answer_type: Option<String>,
    pub cardinality: Cardinality,
    pub task: Option<TaskReference>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuestionGroup {
    pub link_id: String,
    pub text: String,
    pub questions: Vec<Question>,
}

/// Domain projection of a job package.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobPackage {
    pub name: NonEmptyText,
    pub version: Option<String>,
    pub groups: Vec<QuestionGroup>,
    /// Libraries declared by the job lists, structured-query first.
    pub declared_libraries: Vec<LibraryRef>,
}

impl JobPackage {
    /// Parse a job package from a `Questionnaire` resource.
    ///
    /// This uses `serde_path_to_error` to report the path of the first element that does not
    /// match the wire schema.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Translation`] if the resource is not a `Questionnaire`, has no
    /// name, or an element has an unexpected type.
    pub fn from_questionnaire(resource: serde_json::Value) -> FhirResult<Self> {
        let wire = match serde_path_to_error::deserialize::<_, QuestionnaireWire>(resource) {
            Ok(parsed) => parsed,
            Err(err) => {
                let path = err.path().to_string();
                let source = err.into_inner();
                let path = if path.is_empty() {
                    "<root>"
                } else {
                    path.as_str()
                };
                return Err(FhirError::Translation(format!(
                    "Questionnaire schema mismatch at {path}: {source}"
                )));
            }
        };

        wire_to_domain(wire)
    }

    /// Questions in form order, across all groups.
    pub fn questions(&self) -> impl Iterator<Item = &Question> {
        self.groups.iter().flat_map(|g| g.questions.iter())
    }

    pub fn question_count(&self) -> usize {
        self.groups.iter().map(|g| g.questions.len()).sum()
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionnaireWire {
    resource_type: String,
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    extension: Vec<ExtensionWire>,
    #[serde(default)]
    item: Vec<ItemWire>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtensionWire {
    url: String,
    value_string: Option<String>,
    #[serde(default)]
    extension: Vec<ExtensionWire>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemWire {
    link_id: String,
    text: Option<String>,
    #[serde(rename = "type")]
    item_type: Option<String>,
    #[serde(default)]
    extension: Vec<ExtensionWire>,
    #[serde(default)]
    item: Vec<ItemWire>,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn wire_to_domain(wire: QuestionnaireWire) -> FhirResult<JobPackage> {
    if wire.resource_type != "Questionnaire" {
        return Err(FhirError::Translation(format!(
            "expected a Questionnaire, got {}",
            wire.resource_type
        )));
    }

    let name = wire
        .name
        .as_deref()
        .map(NonEmptyText::new)
        .transpose()
        .map_err(|e| FhirError::Translation(format!("Questionnaire.name: {e}")))?
        .ok_or_else(|| FhirError::Translation("Questionnaire.name is required".into()))?;

    let mut declared_libraries = Vec::new();
    for (url, kind) in [
        (CQL_JOB_LIST_URL, BackendKind::StructuredQuery),
        (NLPQL_JOB_LIST_URL, BackendKind::TextAnalytics),
    ] {
        for list in wire.extension.iter().filter(|e| e.url == url) {
            for entry in &list.extension {
                let Some(file_name) = entry.value_string.as_deref() else {
                    continue;
                };
                let mut library = LibraryRef::parse(file_name)?;
                // The list a library appears in decides its kind when the name has no suffix.
                if !file_name.contains('.') {
                    library.kind = kind;
                }
                declared_libraries.push(library);
            }
        }
    }

    let groups = wire
        .item
        .into_iter()
        .map(|group| {
            if group.item.is_empty() {
                // A childless top-level item is treated as a group of one.
                let question = item_to_question(&group);
                return QuestionGroup {
                    link_id: group.link_id,
                    text: group.text.unwrap_or_default(),
                    questions: vec![question],
                };
            }
            QuestionGroup {
                questions: group.item.iter().map(item_to_question).collect(),
                link_id: group.link_id,
                text: group.text.unwrap_or_default(),
            }
        })
        .collect();

    Ok(JobPackage {
        name,
        version: wire.version,
        groups,
        declared_libraries,
    })
}

fn item_to_question(item: &ItemWire) -> Question {
    let mut task = None;
    let mut cardinality = Cardinality::Single;

    for ext in &item.extension {
        let Some(value) = ext.value_string.as_deref() else {
            continue;
        };
        match ext.url.as_str() {
            CQL_TASK_URL if task.is_none() => {
                task = TaskReference::parse(value, BackendKind::StructuredQuery);
            }
            NLPQL_TASK_URL if task.is_none() => {
                task = TaskReference::parse(value, BackendKind::TextAnalytics);
            }
            CARDINALITY_URL => {
                if value.eq_ignore_ascii_case("series") {
                    cardinality = Cardinality::Series;
                }
            }
            _ => {}
        }
    }

    Question {
        link_id: item.link_id.clone(),
        text: item.text.clone().unwrap_or_default(),
        answer_type: item.item_type.clone(),
        cardinality,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_form() -> serde_json::Value {
        json!({
            "resourceType": "Questionnaire",
            "name": "SyphilisRegistry",
            "version": "1.0.0",
            "extension": [
                {"url": CQL_JOB_LIST_URL, "extension": [
                    {"url": "job", "valueString": "demographics.cql"},
                    {"url": "job", "valueString": "treatment.cql"}
                ]},
                {"url": NLPQL_JOB_LIST_URL, "extension": [
                    {"url": "job", "valueString": "notes.nlpql"}
                ]}
            ],
            "item": [{
                "linkId": "g1",
                "text": "Demographics",
                "item": [
                    {"linkId": "q1", "text": "Age", "type": "string", "extension": [
                        {"url": CQL_TASK_URL, "valueString": "demographics.Age"},
                        {"url": CARDINALITY_URL, "valueString": "single"}
                    ]},
                    {"linkId": "q2", "text": "Treatments", "type": "string", "extension": [
                        {"url": CQL_TASK_URL, "valueString": "treatment.Meds"},
                        {"url": CARDINALITY_URL, "valueString": "series"}
                    ]},
                    {"linkId": "q3", "text": "Pregnant", "type": "string", "extension": [
                        {"url": NLPQL_TASK_URL, "valueString": "notes.Pregnancy"}
                    ]},
                    {"linkId": "q4", "text": "Free text", "type": "string"}
                ]
            }]
        })
    }

    #[test]
    fn parses_job_lists_and_questions() {
        let package = JobPackage::from_questionnaire(registry_form()).expect("parse form");
        assert_eq!(package.name.as_str(), "SyphilisRegistry");
        assert_eq!(package.version.as_deref(), Some("1.0.0"));
        assert_eq!(
            package
                .declared_libraries
                .iter()
                .map(LibraryRef::file_name)
                .collect::<Vec<_>>(),
            vec!["demographics.cql", "treatment.cql", "notes.nlpql"]
        );
        assert_eq!(package.question_count(), 4);

        let questions: Vec<&Question> = package.questions().collect();
        assert_eq!(
            questions[0].task,
            Some(TaskReference {
                library: "demographics".into(),
                task: "Age".into(),
                backend: BackendKind::StructuredQuery,
            })
        );
        assert_eq!(questions[1].cardinality, Cardinality::Series);
        assert_eq!(
            questions[2].task.as_ref().map(|t| t.backend),
            Some(BackendKind::TextAnalytics)
        );
        assert_eq!(questions[3].task, None);
    }

    #[test]
    fn rejects_non_questionnaire() {
        let err = JobPackage::from_questionnaire(json!({"resourceType": "Library", "name": "x"}))
            .expect_err("not a questionnaire");
        match err {
            FhirError::Translation(msg) => assert!(msg.contains("Library")),
            other => panic!("expected Translation error, got {other:?}"),
        }
    }

    #[test]
    fn reports_path_of_wrong_types() {
        let mut form = registry_form();
        form["item"][0]["item"][0]["linkId"] = json!(7);
        let err = JobPackage::from_questionnaire(form).expect_err("wrong linkId type");
        match err {
            FhirError::Translation(msg) => assert!(msg.contains("item[0].item[0].linkId")),
            other => panic!("expected Translation error, got {other:?}"),
        }
    }

    #[test]
    fn library_ref_defaults_to_structured_query() {
        let library = LibraryRef::parse("demographics").expect("bare name");
        assert_eq!(library.kind, BackendKind::StructuredQuery);
        assert_eq!(library.file_name(), "demographics.cql");

        let library = LibraryRef::parse("notes.NLPQL").expect("uppercase ext");
        assert_eq!(library.kind, BackendKind::TextAnalytics);

        assert!(LibraryRef::parse("notes.txt").is_err());
        assert!(LibraryRef::parse(".cql").is_err());
    }

    #[test]
    fn malformed_task_reference_is_ignored() {
        let form = json!({
            "resourceType": "Questionnaire",
            "name": "Broken",
            "item": [{"linkId": "q1", "text": "Lonely", "extension": [
                {"url": CQL_TASK_URL, "valueString": "NoDotHere"}
            ]}]
        });
        let package = JobPackage::from_questionnaire(form).expect("parse form");
        assert_eq!(package.groups.len(), 1);
        assert_eq!(package.groups[0].questions[0].task, None);
    }
}
