//! Job and batch-job records.
//!
//! A [`Job`] is created `inProgress` at submission and completed exactly once. A [`BatchJob`]
//! only lists its children; its status is derived from theirs whenever it is read, never
//! stored.

use chrono::{DateTime, Utc};
use fhir::{Bundle, OperationOutcome, Parameter, Parameters, FHIR_DATETIME_FORMAT};
use rc_uuid::JobUuid;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    InProgress,
    Complete,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "inProgress",
            JobStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished pipeline run produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Bundle(Bundle),
    Outcome(OperationOutcome),
}

impl JobResult {
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            JobResult::Bundle(bundle) => serde_json::to_value(bundle),
            JobResult::Outcome(outcome) => serde_json::to_value(outcome),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobUuid,
    pub status: JobStatus,
    pub patient_id: String,
    /// `id` or `identifier`: how the patient was named at submission.
    pub patient_id_type: String,
    pub job_package: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub parent_batch_id: Option<JobUuid>,
}

impl Job {
    /// A new in-progress job with a fresh id.
    pub fn start(patient_id: &str, patient_id_type: &str, job_package: &str) -> Self {
        Self {
            id: JobUuid::new(),
            status: JobStatus::InProgress,
            patient_id: patient_id.to_owned(),
            patient_id_type: patient_id_type.to_owned(),
            job_package: job_package.to_owned(),
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            parent_batch_id: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == JobStatus::Complete
    }

    /// The job status document returned to callers.
    pub fn to_parameters(&self) -> Parameters {
        let mut parameter = vec![
            Parameter::string("jobId", self.id.to_string()),
            Parameter::date_time("jobStartDateTime", format_timestamp(&self.started_at)),
            Parameter::string("jobStatus", self.status.as_str()),
        ];
        if let Some(result) = &self.result {
            parameter.push(Parameter::resource("result", result.to_value()));
        }
        if let Some(completed_at) = &self.completed_at {
            parameter.push(Parameter::date_time(
                "jobCompletedDateTime",
                format_timestamp(completed_at),
            ));
        }
        Parameters::new(parameter)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: JobUuid,
    pub patient_id: String,
    pub job_package: String,
    pub started_at: DateTime<Utc>,
    /// Fixed at dispatch time.
    pub child_job_ids: Vec<JobUuid>,
}

impl BatchJob {
    pub fn new(patient_id: &str, job_package: &str, child_job_ids: Vec<JobUuid>) -> Self {
        Self {
            id: JobUuid::new(),
            patient_id: patient_id.to_owned(),
            job_package: job_package.to_owned(),
            started_at: Utc::now(),
            child_job_ids,
        }
    }

    /// The batch document returned at submission: ids only, no status.
    pub fn to_parameters(&self) -> Parameters {
        Parameters::new(self.base_parameters())
    }

    fn base_parameters(&self) -> Vec<Parameter> {
        let child_jobs = serde_json::json!({
            "resourceType": "List",
            "status": "current",
            "mode": "working",
            "entry": self
                .child_job_ids
                .iter()
                .map(|id| serde_json::json!({"item": {"display": id.to_string()}}))
                .collect::<Vec<_>>(),
        });
        vec![
            Parameter::string("batchId", self.id.to_string()),
            Parameter::date_time("jobStartDateTime", format_timestamp(&self.started_at)),
            Parameter::string("patientId", self.patient_id.clone()),
            Parameter::string("jobPackage", self.job_package.clone()),
            Parameter::resource("childJobs", child_jobs),
        ]
    }
}

/// A batch as read back, with its status derived from its children.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchJobView {
    pub batch: BatchJob,
    pub children: Vec<(JobUuid, JobStatus)>,
}

impl BatchJobView {
    /// `complete` iff every child is complete. A child missing from the store counts as
    /// still in progress.
    pub fn status(&self) -> JobStatus {
        let all_complete = self.batch.child_job_ids.iter().all(|id| {
            self.children
                .iter()
                .any(|(child, status)| child == id && *status == JobStatus::Complete)
        });
        if all_complete {
            JobStatus::Complete
        } else {
            JobStatus::InProgress
        }
    }

    pub fn to_parameters(&self) -> Parameters {
        let mut parameter = self.batch.base_parameters();
        parameter.push(Parameter::string("jobStatus", self.status().as_str()));
        Parameters::new(parameter)
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format(FHIR_DATETIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::IssueCode;

    #[test]
    fn status_document_includes_result_once_complete() {
        let mut job = Job::start("p1", "id", "Registry");
        let doc = serde_json::to_value(job.to_parameters()).expect("serialize");
        assert_eq!(doc["parameter"][2]["valueString"], "inProgress");
        assert_eq!(doc["parameter"].as_array().map(Vec::len), Some(3));

        job.status = JobStatus::Complete;
        job.completed_at = Some(Utc::now());
        job.result = Some(JobResult::Outcome(OperationOutcome::error(
            IssueCode::Timeout,
            "upstream timeout",
        )));
        let doc = serde_json::to_value(job.to_parameters()).expect("serialize");
        assert_eq!(doc["parameter"][2]["valueString"], "complete");
        assert_eq!(doc["parameter"][3]["name"], "result");
        assert_eq!(doc["parameter"][3]["resource"]["resourceType"], "OperationOutcome");
        assert_eq!(doc["parameter"][4]["name"], "jobCompletedDateTime");
    }

    #[test]
    fn job_result_round_trips_untagged() {
        let bundle = JobResult::Bundle(Bundle::collection());
        let json = serde_json::to_string(&bundle).expect("serialize");
        let parsed: JobResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, bundle);

        let outcome = JobResult::Outcome(OperationOutcome::error(IssueCode::NotFound, "x"));
        let json = serde_json::to_string(&outcome).expect("serialize");
        let parsed: JobResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, outcome);
    }

    #[test]
    fn batch_status_is_derived_from_children() {
        let ids: Vec<JobUuid> = (0..5).map(|_| JobUuid::new()).collect();
        let batch = BatchJob::new("p1", "Registry", ids.clone());
        let mut children: Vec<(JobUuid, JobStatus)> =
            ids.iter().map(|id| (id.clone(), JobStatus::Complete)).collect();
        children[4].1 = JobStatus::InProgress;

        let mut view = BatchJobView {
            batch,
            children,
        };
        assert_eq!(view.status(), JobStatus::InProgress);
        view.children[4].1 = JobStatus::Complete;
        assert_eq!(view.status(), JobStatus::Complete);

        let doc = serde_json::to_value(view.to_parameters()).expect("serialize");
        let child_jobs = doc["parameter"]
            .as_array()
            .and_then(|params| params.iter().find(|p| p["name"] == "childJobs"))
            .expect("childJobs");
        assert_eq!(child_jobs["resource"]["entry"].as_array().map(Vec::len), Some(5));
        assert_eq!(child_jobs["resource"]["mode"], "working");
    }
}
