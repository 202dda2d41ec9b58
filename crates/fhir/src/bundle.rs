//! Evidence `Bundle` wire model.
//!
//! The evidence bundle is a FHIR `Bundle` of type `collection`. Entries are identified by
//! `fullUrl` (`<ResourceType>/<id>`) and the bundle never holds two entries with the same
//! `fullUrl`; insertion goes through [`Bundle::push_unique`] to keep that true.

use crate::{FhirResult, Resource};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    pub full_url: String,
    #[schema(value_type = Object)]
    pub resource: serde_json::Value,
}

impl BundleEntry {
    pub fn new(full_url: impl Into<String>, resource: serde_json::Value) -> Self {
        Self {
            full_url: full_url.into(),
            resource,
        }
    }

    /// Builds an entry from a typed resource, using `<type>/<id>` as the `fullUrl`.
    pub fn from_resource(resource: &Resource) -> FhirResult<Self> {
        Ok(Self {
            full_url: resource.full_url(),
            resource: serde_json::to_value(resource)?,
        })
    }

    /// Parses a backend-supplied entry. Entries without a `fullUrl` cannot be referenced and
    /// are rejected.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let full_url = value.get("fullUrl")?.as_str()?;
        let resource = value
            .get("resource")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Some(Self::new(full_url, resource))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BundleType {
    Collection,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[schema(example = "Bundle")]
    pub resource_type: String,
    pub id: String,
    #[serde(rename = "type")]
    pub bundle_type: BundleType,
    pub entry: Vec<BundleEntry>,
    pub total: usize,
}

impl Bundle {
    /// An empty `collection` bundle with a fresh id.
    pub fn collection() -> Self {
        Self {
            resource_type: "Bundle".into(),
            id: rc_uuid::new_resource_id(),
            bundle_type: BundleType::Collection,
            entry: Vec::new(),
            total: 0,
        }
    }

    /// Returns true if an entry with this `fullUrl` is already present.
    pub fn contains(&self, full_url: &str) -> bool {
        self.entry.iter().any(|e| e.full_url == full_url)
    }

    /// Appends `entry` unless one with the same `fullUrl` exists. Returns whether it was added.
    pub fn push_unique(&mut self, entry: BundleEntry) -> bool {
        if self.contains(&entry.full_url) {
            return false;
        }
        self.entry.push(entry);
        self.total = self.entry.len();
        true
    }

    /// Appends every entry not already present, preserving order.
    pub fn extend_unique(&mut self, entries: impl IntoIterator<Item = BundleEntry>) {
        let mut seen: HashSet<String> = self.entry.iter().map(|e| e.full_url.clone()).collect();
        for entry in entries {
            if seen.insert(entry.full_url.clone()) {
                self.entry.push(entry);
            }
        }
        self.total = self.entry.len();
    }

    /// Returns true if a JSON payload is a `Bundle`.
    pub fn is_bundle(value: &serde_json::Value) -> bool {
        value.get("resourceType").and_then(serde_json::Value::as_str) == Some("Bundle")
    }
}
