//! Flattens raw backend payloads into one map keyed by task name.
//!
//! Structured-query payloads are `Parameters`-like collections: each entry's `fullUrl` is the
//! task (expression) name, and the entry's `value` parameter carries the result. Text-analytics
//! payloads are flat record lists grouped by `nlpql_feature`. The backend kind comes from the
//! [`RawPayload`] tag; shapes are never guessed.

use crate::collector::{RawBackendResult, RawPayload};
use fhir::{BackendKind, Bundle, BundleEntry};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// One text-analytics record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct TextAnalyticsRecord {
    pub nlpql_feature: String,
    #[serde(default)]
    pub tuple: Option<String>,
    #[serde(default)]
    pub report_id: Option<String>,
    #[serde(default)]
    pub report_date: Option<String>,
    #[serde(default)]
    pub report_text: Option<String>,
    #[serde(default)]
    pub report_type: Option<String>,
    #[serde(default)]
    pub sentence: Option<String>,
    #[serde(default, rename = "_id")]
    pub id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NormalizedValue {
    /// A single value (string, number, or a lone resource).
    Scalar(serde_json::Value),
    /// A bundle of resources, as bundle entries.
    Resources(Vec<BundleEntry>),
    /// Text-analytics records for one feature.
    Records(Vec<TextAnalyticsRecord>),
}

/// Task name to value, per backend, plus the libraries each backend ran.
#[derive(Clone, Debug, Default)]
pub struct NormalizedResultMap {
    values: HashMap<(BackendKind, String), NormalizedValue>,
    libraries: BTreeMap<BackendKind, Vec<String>>,
}

impl NormalizedResultMap {
    pub fn get(&self, backend: BackendKind, task: &str) -> Option<&NormalizedValue> {
        self.values.get(&(backend, task.to_owned()))
    }

    /// Names of the libraries collected for a backend, including ones that returned nothing.
    pub fn libraries(&self, backend: BackendKind) -> &[String] {
        self.libraries
            .get(&backend)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn ran(&self, backend: BackendKind) -> bool {
        !self.libraries(backend).is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stores a value; a later value for the same task replaces the earlier one.
    pub fn insert(&mut self, backend: BackendKind, task: String, value: NormalizedValue) {
        if let Some(previous) = self.values.insert((backend, task.clone()), value) {
            tracing::warn!(
                "task {task} was returned by more than one {backend} library; keeping the last ({} replaced)",
                variant_name(&previous)
            );
        }
    }

    fn record_library(&mut self, backend: BackendKind, name: &str) {
        self.libraries
            .entry(backend)
            .or_default()
            .push(name.to_owned());
    }
}

fn variant_name(value: &NormalizedValue) -> &'static str {
    match value {
        NormalizedValue::Scalar(_) => "scalar",
        NormalizedValue::Resources(_) => "resources",
        NormalizedValue::Records(_) => "records",
    }
}

/// Flattens every collected result into one map.
pub fn normalize(results: Vec<RawBackendResult>) -> NormalizedResultMap {
    let mut map = NormalizedResultMap::default();
    for result in results {
        map.record_library(result.library.kind, &result.library.name);
        match result.payload {
            RawPayload::StructuredQuery(payload) => flatten_structured(&mut map, payload),
            RawPayload::TextAnalytics(payload) => flatten_text_analytics(&mut map, payload),
            RawPayload::Error(_) => {
                tracing::debug!("{} produced no usable result", result.library.file_name());
            }
        }
    }
    map
}

fn flatten_structured(map: &mut NormalizedResultMap, payload: serde_json::Value) {
    let serde_json::Value::Object(mut payload) = payload else {
        return;
    };
    let Some(serde_json::Value::Array(entries)) = payload.remove("entry") else {
        return;
    };

    for entry in entries {
        let Some(task) = entry.get("fullUrl").and_then(serde_json::Value::as_str) else {
            tracing::debug!("skipping structured-query entry without fullUrl");
            continue;
        };
        let Some(value_parameter) = entry
            .pointer("/resource/parameter")
            .and_then(serde_json::Value::as_array)
            .and_then(|params| {
                params
                    .iter()
                    .find(|p| p.get("name").and_then(serde_json::Value::as_str) == Some("value"))
            })
        else {
            tracing::debug!("structured-query entry {task} has no value parameter");
            continue;
        };

        let value = value_parameter
            .as_object()
            .and_then(|param| param.iter().find(|(key, _)| key.as_str() != "name"))
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| serde_json::Value::String("null".into()));

        let normalized = if Bundle::is_bundle(&value) {
            NormalizedValue::Resources(bundle_entries(&value))
        } else {
            NormalizedValue::Scalar(value)
        };
        map.insert(BackendKind::StructuredQuery, task.to_owned(), normalized);
    }
}

fn bundle_entries(bundle: &serde_json::Value) -> Vec<BundleEntry> {
    bundle
        .get("entry")
        .and_then(serde_json::Value::as_array)
        .map(|entries| entries.iter().filter_map(BundleEntry::from_value).collect())
        .unwrap_or_default()
}

fn flatten_text_analytics(map: &mut NormalizedResultMap, payload: serde_json::Value) {
    let serde_json::Value::Array(records) = payload else {
        return;
    };

    // Feature order follows first appearance so logs read in backend order.
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<TextAnalyticsRecord>> = HashMap::new();
    for raw in records {
        match serde_json::from_value::<TextAnalyticsRecord>(raw) {
            Ok(record) => {
                if !grouped.contains_key(&record.nlpql_feature) {
                    order.push(record.nlpql_feature.clone());
                }
                grouped
                    .entry(record.nlpql_feature.clone())
                    .or_default()
                    .push(record);
            }
            Err(e) => tracing::debug!("skipping malformed text-analytics record: {e}"),
        }
    }

    for feature in order {
        if let Some(records) = grouped.remove(&feature).filter(|r| !r.is_empty()) {
            map.insert(
                BackendKind::TextAnalytics,
                feature,
                NormalizedValue::Records(records),
            );
        }
    }
}
