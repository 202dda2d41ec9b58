//! Computation `Library` wire model.
//!
//! Libraries are looked up by name on the structured-query backend. Only the first content
//! attachment matters: its `contentType` decides which backend runs the library, and for
//! text-analytics libraries its base64 `data` is the source registered with the backend.

use crate::{BackendKind, FhirError, FhirResult};
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub content: Vec<LibraryAttachment>,
}

impl Library {
    /// Parses a `Library` resource.
    pub fn from_value(value: serde_json::Value) -> FhirResult<Self> {
        if value.get("resourceType").and_then(serde_json::Value::as_str) != Some("Library") {
            return Err(FhirError::InvalidInput(
                "expected a Library resource".into(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// The first `Library` in a search-set `Bundle`, if the search matched anything.
    pub fn first_in_search_set(search_set: &serde_json::Value) -> FhirResult<Option<Self>> {
        match first_entry_resource(search_set) {
            Some(resource) => Self::from_value(resource.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or("<unnamed>")
    }

    /// The backend that runs this library, from `content[0].contentType`.
    ///
    /// # Errors
    ///
    /// - [`FhirError::MissingContentType`] if there is no content or no content type.
    /// - [`FhirError::UnsupportedContentType`] for anything other than `text/cql` or
    ///   `text/nlpql`.
    pub fn kind(&self) -> FhirResult<BackendKind> {
        let content_type = self
            .content
            .first()
            .and_then(|c| c.content_type.as_deref())
            .ok_or_else(|| FhirError::MissingContentType(self.display_name().to_owned()))?;
        BackendKind::from_content_type(content_type).ok_or_else(|| {
            FhirError::UnsupportedContentType {
                library: self.display_name().to_owned(),
                content_type: content_type.to_owned(),
            }
        })
    }

    /// Decodes `content[0].data` into UTF-8 source text.
    pub fn source_text(&self) -> FhirResult<String> {
        let library = self.display_name().to_owned();
        let data = self
            .content
            .first()
            .and_then(|c| c.data.as_deref())
            .ok_or_else(|| FhirError::LibraryContent {
                library: library.clone(),
                reason: "content[0].data is missing".into(),
            })?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| FhirError::LibraryContent {
                library: library.clone(),
                reason: e.to_string(),
            })?;
        String::from_utf8(bytes).map_err(|e| FhirError::LibraryContent {
            library,
            reason: e.to_string(),
        })
    }
}

/// `entry[0].resource` of a search-set `Bundle`.
pub fn first_entry_resource(search_set: &serde_json::Value) -> Option<&serde_json::Value> {
    search_set
        .get("entry")?
        .as_array()?
        .first()?
        .get("resource")
}
