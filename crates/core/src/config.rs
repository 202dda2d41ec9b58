//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into the orchestrator and
//! its clients. Nothing in the core reads process-wide environment variables while a job is
//! running; binaries call [`core_config_from_lookup`] with an environment reader instead.

use crate::constants::{
    DEFAULT_DEPLOY_URL, DEFAULT_JOB_DATA_DIR, DEFAULT_MAX_CONCURRENT_REQUESTS,
    TEXT_ANALYTICS_DISABLED,
};
use crate::{CoreError, CoreResult};
use std::path::{Path, PathBuf};

/// Authorization for the external FHIR server, configured as `"<scheme> <token>"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FhirAuth {
    scheme: String,
    token: String,
}

impl FhirAuth {
    /// Parses `"<scheme> <token>"`, for example `"Bearer abc123"`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if the value has no space or either half is empty.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let (scheme, token) = raw.trim().split_once(' ').ok_or_else(|| {
            CoreError::Config("EXTERNAL_FHIR_SERVER_AUTH must look like '<scheme> <token>'".into())
        })?;
        let (scheme, token) = (scheme.trim(), token.trim());
        if scheme.is_empty() || token.is_empty() {
            return Err(CoreError::Config(
                "EXTERNAL_FHIR_SERVER_AUTH must look like '<scheme> <token>'".into(),
            ));
        }
        Ok(Self {
            scheme: scheme.to_owned(),
            token: token.to_owned(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The `Authorization` header value.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.scheme, self.token)
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    structured_query_url: String,
    fhir_server_url: String,
    fhir_server_auth: Option<FhirAuth>,
    text_analytics_url: Option<String>,
    deploy_url: String,
    job_data_dir: PathBuf,
    max_concurrent_requests: usize,
}

impl CoreConfig {
    /// Create a new `CoreConfig` with defaults for everything but the two required URLs.
    ///
    /// # Arguments
    ///
    /// * `structured_query_url` - Base URL of the structured-query backend, which also serves
    ///   job packages and libraries.
    /// * `fhir_server_url` - Base URL of the external FHIR server holding patient data.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if either URL is blank.
    pub fn new(structured_query_url: &str, fhir_server_url: &str) -> CoreResult<Self> {
        Ok(Self {
            structured_query_url: required_base_url("CQF_RULER_R4", structured_query_url)?,
            fhir_server_url: required_base_url("EXTERNAL_FHIR_SERVER_URL", fhir_server_url)?,
            fhir_server_auth: None,
            text_analytics_url: None,
            deploy_url: DEFAULT_DEPLOY_URL.to_owned(),
            job_data_dir: PathBuf::from(DEFAULT_JOB_DATA_DIR),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        })
    }

    pub fn with_fhir_server_auth(mut self, auth: Option<FhirAuth>) -> Self {
        self.fhir_server_auth = auth;
        self
    }

    /// Enables the text-analytics backend. `None` disables it.
    pub fn with_text_analytics_url(mut self, url: Option<&str>) -> Self {
        self.text_analytics_url = url.map(normalize_base_url);
        self
    }

    pub fn with_deploy_url(mut self, deploy_url: &str) -> Self {
        self.deploy_url = normalize_base_url(deploy_url);
        self
    }

    pub fn with_job_data_dir(mut self, job_data_dir: PathBuf) -> Self {
        self.job_data_dir = job_data_dir;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max.max(1);
        self
    }

    pub fn structured_query_url(&self) -> &str {
        &self.structured_query_url
    }

    pub fn fhir_server_url(&self) -> &str {
        &self.fhir_server_url
    }

    pub fn fhir_server_auth(&self) -> Option<&FhirAuth> {
        self.fhir_server_auth.as_ref()
    }

    pub fn text_analytics_url(&self) -> Option<&str> {
        self.text_analytics_url.as_deref()
    }

    pub fn text_analytics_enabled(&self) -> bool {
        self.text_analytics_url.is_some()
    }

    pub fn deploy_url(&self) -> &str {
        &self.deploy_url
    }

    pub fn job_data_dir(&self) -> &Path {
        &self.job_data_dir
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }
}

/// Resolve a [`CoreConfig`] from a key lookup (normally the process environment).
///
/// Reads `CQF_RULER_R4`, `EXTERNAL_FHIR_SERVER_URL`, `EXTERNAL_FHIR_SERVER_AUTH`,
/// `NLPAAS_URL`, `DEPLOY_URL`, `JOB_DATA_DIR` and `MAX_CONCURRENT_REQUESTS`.
///
/// # Errors
///
/// Returns [`CoreError::Config`] if a required key is missing or a value cannot be parsed.
pub fn core_config_from_lookup<F>(lookup: F) -> CoreResult<CoreConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let structured_query_url = lookup("CQF_RULER_R4")
        .ok_or_else(|| CoreError::Config("CQF_RULER_R4 must be set".into()))?;
    let fhir_server_url = lookup("EXTERNAL_FHIR_SERVER_URL")
        .ok_or_else(|| CoreError::Config("EXTERNAL_FHIR_SERVER_URL must be set".into()))?;

    let text_analytics_url = text_analytics_url_from_env_value(lookup("NLPAAS_URL"));
    let mut config = CoreConfig::new(&structured_query_url, &fhir_server_url)?
        .with_fhir_server_auth(fhir_auth_from_env_value(lookup("EXTERNAL_FHIR_SERVER_AUTH"))?)
        .with_text_analytics_url(text_analytics_url.as_deref())
        .with_max_concurrent_requests(max_concurrent_requests_from_env_value(
            lookup("MAX_CONCURRENT_REQUESTS"),
        )?);

    if let Some(deploy_url) = non_blank(lookup("DEPLOY_URL")) {
        config = config.with_deploy_url(&deploy_url);
    }
    if let Some(dir) = non_blank(lookup("JOB_DATA_DIR")) {
        config = config.with_job_data_dir(PathBuf::from(dir));
    }
    Ok(config)
}

/// Ensures a base URL ends in exactly one `/` so paths can be appended directly.
pub fn normalize_base_url(url: &str) -> String {
    format!("{}/", url.trim().trim_end_matches('/'))
}

/// Parse the text-analytics URL setting.
///
/// An absent or blank value, or the literal `False`, disables the backend.
pub fn text_analytics_url_from_env_value(value: Option<String>) -> Option<String> {
    non_blank(value).filter(|v| v != TEXT_ANALYTICS_DISABLED)
}

/// Parse the optional external FHIR server authorization setting.
pub fn fhir_auth_from_env_value(value: Option<String>) -> CoreResult<Option<FhirAuth>> {
    non_blank(value).map(|v| FhirAuth::parse(&v)).transpose()
}

/// Parse the dispatch concurrency bound; absent or blank means the default.
pub fn max_concurrent_requests_from_env_value(value: Option<String>) -> CoreResult<usize> {
    match non_blank(value) {
        None => Ok(DEFAULT_MAX_CONCURRENT_REQUESTS),
        Some(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(CoreError::Config(format!(
                "MAX_CONCURRENT_REQUESTS must be a positive integer, got '{v}'"
            ))),
        },
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required_base_url(key: &str, value: &str) -> CoreResult<String> {
    if value.trim().is_empty() {
        return Err(CoreError::Config(format!("{key} cannot be empty")));
    }
    Ok(normalize_base_url(value))
}
