//! Constants used throughout the orchestration core.
//!
//! Code systems written onto synthesized resources, storage layout names and configuration
//! defaults live here so they stay consistent across the linker, the store and the binaries.

/// Default directory for job records when no explicit directory is configured.
pub const DEFAULT_JOB_DATA_DIR: &str = "job_data";

/// Directory name (under the job data dir) for individual job records.
pub const JOBS_DIR_NAME: &str = "jobs";

/// Directory name (under the job data dir) for batch job records.
pub const BATCHES_DIR_NAME: &str = "batches";

/// Filename for a persisted job.
pub const JOB_JSON_FILENAME: &str = "job.json";

/// Filename for a persisted batch job.
pub const BATCH_JSON_FILENAME: &str = "batch.json";

/// Default identifier system for synthesized resources.
pub const DEFAULT_DEPLOY_URL: &str = "http://example.org/";

/// Default bound on in-flight backend requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// Value of the text-analytics URL setting that disables that backend.
pub const TEXT_ANALYTICS_DISABLED: &str = "False";

/// Backend status codes treated as hard timeouts.
pub const TIMEOUT_STATUS_CODES: [u16; 2] = [504, 408];

/// Prefix of the code system for answer observations; the job package name is appended.
pub const FORM_CODE_SYSTEM_PREFIX: &str = "urn:gtri:heat:form:";

pub const OBSERVATION_CATEGORY_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/observation-category";

/// Code system of the components on text-analytics answer observations.
pub const NLP_ANSWER_TYPE_SYSTEM: &str = "http://gtri.gatech.edu/fakeFormIg/nlp-answer-type-label";

pub const LOINC_SYSTEM: &str = "http://loinc.org";

/// Attachment text for reports that came back without text.
pub const MISSING_REPORT_TEXT: &str = "No Document Text Available";
