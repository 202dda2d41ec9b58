//! Job persistence port.
//!
//! The orchestrator only talks to [`JobStore`]. [`FileJobStore`] keeps one JSON document per
//! job under a sharded directory tree; [`InMemoryJobStore`] backs tests and throwaway runs.

mod file;
mod memory;

pub use file::FileJobStore;
pub use memory::InMemoryJobStore;

use crate::job::{BatchJob, BatchJobView, Job, JobResult, JobStatus};
use crate::StoreResult;
use async_trait::async_trait;
use rc_uuid::JobUuid;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job. Returns `false` (and changes nothing) if the id is taken.
    async fn create(&self, job: &Job) -> StoreResult<bool>;

    async fn get(&self, id: &JobUuid) -> StoreResult<Option<Job>>;

    /// Marks a job complete with its result and completion time, returning the stored job.
    ///
    /// # Errors
    ///
    /// - [`crate::StoreError::NotFound`] if the job does not exist.
    /// - [`crate::StoreError::AlreadyComplete`] if it was completed before.
    async fn complete_with(&self, id: &JobUuid, result: JobResult) -> StoreResult<Job>;

    /// Every stored job, oldest first.
    async fn list(&self) -> StoreResult<Vec<Job>>;

    /// Inserts a new batch. Returns `false` if the id is taken.
    async fn create_batch(&self, batch: &BatchJob) -> StoreResult<bool>;

    async fn get_batch(&self, id: &JobUuid) -> StoreResult<Option<BatchJob>>;

    /// Removes a batch record; its children stay, with their parent cleared.
    /// Returns `false` if there was no such batch.
    async fn delete_batch(&self, id: &JobUuid) -> StoreResult<bool>;

    /// Status of every child of a batch, in child order. Children missing from the store
    /// are left out.
    async fn list_batch_children_status(
        &self,
        batch_id: &JobUuid,
    ) -> StoreResult<Vec<(JobUuid, JobStatus)>> {
        let Some(batch) = self.get_batch(batch_id).await? else {
            return Ok(Vec::new());
        };
        let mut statuses = Vec::with_capacity(batch.child_job_ids.len());
        for child in &batch.child_job_ids {
            if let Some(job) = self.get(child).await? {
                statuses.push((child.clone(), job.status));
            }
        }
        Ok(statuses)
    }

    /// A batch together with its children's current statuses.
    async fn batch_view(&self, batch_id: &JobUuid) -> StoreResult<Option<BatchJobView>> {
        let Some(batch) = self.get_batch(batch_id).await? else {
            return Ok(None);
        };
        let children = self.list_batch_children_status(batch_id).await?;
        Ok(Some(BatchJobView { batch, children }))
    }
}

/// Applies a completion to a stored job, enforcing the single-completion rule.
pub(crate) fn apply_completion(job: &mut Job, result: JobResult) -> StoreResult<()> {
    if job.is_complete() {
        return Err(crate::StoreError::AlreadyComplete(job.id.to_string()));
    }
    job.status = JobStatus::Complete;
    job.result = Some(result);
    job.completed_at = Some(chrono::Utc::now());
    Ok(())
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store must share.

    use super::*;
    use crate::StoreError;
    use fhir::{Bundle, IssueCode, OperationOutcome};

    pub async fn create_is_collision_checked(store: &dyn JobStore) {
        let job = Job::start("p1", "id", "Registry");
        assert!(store.create(&job).await.expect("create"));
        assert!(!store.create(&job).await.expect("second create"));
        assert_eq!(store.get(&job.id).await.expect("get"), Some(job));
    }

    pub async fn complete_once_then_read_twice(store: &dyn JobStore) {
        let job = Job::start("p1", "id", "Registry");
        store.create(&job).await.expect("create");

        let result = JobResult::Bundle(Bundle::collection());
        let completed = store
            .complete_with(&job.id, result.clone())
            .await
            .expect("complete");
        assert!(completed.is_complete());
        assert!(completed.completed_at.is_some());

        let first = store.get(&job.id).await.expect("get").expect("job");
        let second = store.get(&job.id).await.expect("get").expect("job");
        assert_eq!(first, second);
        assert_eq!(first.result, Some(result));

        let err = store
            .complete_with(
                &job.id,
                JobResult::Outcome(OperationOutcome::error(IssueCode::Transient, "late")),
            )
            .await
            .expect_err("second completion");
        assert!(matches!(err, StoreError::AlreadyComplete(_)));
    }

    pub async fn completing_unknown_job_fails(store: &dyn JobStore) {
        let err = store
            .complete_with(&JobUuid::new(), JobResult::Bundle(Bundle::collection()))
            .await
            .expect_err("unknown");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    pub async fn batch_lifecycle(store: &dyn JobStore) {
        let mut children = Vec::new();
        for _ in 0..5 {
            children.push(Job::start("p1", "id", "Registry"));
        }
        let batch = BatchJob::new(
            "p1",
            "Registry",
            children.iter().map(|j| j.id.clone()).collect(),
        );
        for child in &mut children {
            child.parent_batch_id = Some(batch.id.clone());
            store.create(child).await.expect("create child");
        }
        assert!(store.create_batch(&batch).await.expect("create batch"));

        let view = store.batch_view(&batch.id).await.expect("view").expect("batch");
        assert_eq!(view.children.len(), 5);
        assert_eq!(view.status(), JobStatus::InProgress);

        for child in &children[..4] {
            store
                .complete_with(&child.id, JobResult::Bundle(Bundle::collection()))
                .await
                .expect("complete");
        }
        let view = store.batch_view(&batch.id).await.expect("view").expect("batch");
        assert_eq!(view.status(), JobStatus::InProgress);

        store
            .complete_with(&children[4].id, JobResult::Bundle(Bundle::collection()))
            .await
            .expect("complete");
        let view = store.batch_view(&batch.id).await.expect("view").expect("batch");
        assert_eq!(view.status(), JobStatus::Complete);

        assert!(store.delete_batch(&batch.id).await.expect("delete"));
        assert!(!store.delete_batch(&batch.id).await.expect("second delete"));
        assert_eq!(store.get_batch(&batch.id).await.expect("get batch"), None);
        let child = store.get(&children[0].id).await.expect("get").expect("child");
        assert_eq!(child.parent_batch_id, None);
    }

    pub async fn lists_every_job(store: &dyn JobStore) {
        let a = Job::start("p1", "id", "Registry");
        let b = Job::start("p2", "identifier", "Registry");
        store.create(&a).await.expect("create");
        store.create(&b).await.expect("create");
        let mut ids: Vec<String> = store
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|j| j.id.to_string())
            .collect();
        ids.sort();
        let mut expected = vec![a.id.to_string(), b.id.to_string()];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
