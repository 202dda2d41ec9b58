use super::{apply_completion, JobStore};
use crate::job::{BatchJob, Job, JobResult};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use rc_uuid::JobUuid;
use std::collections::HashMap;
use std::sync::RwLock;

/// Jobs and batches held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobUuid, Job>>,
    batches: RwLock<HashMap<JobUuid, BatchJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Internal(e.to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> StoreResult<bool> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(true)
    }

    async fn get(&self, id: &JobUuid) -> StoreResult<Option<Job>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(id).cloned())
    }

    async fn complete_with(&self, id: &JobUuid, result: JobResult) -> StoreResult<Job> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_completion(job, result)?;
        Ok(job.clone())
    }

    async fn list(&self) -> StoreResult<Vec<Job>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|job| job.started_at);
        Ok(all)
    }

    async fn create_batch(&self, batch: &BatchJob) -> StoreResult<bool> {
        let mut batches = self.batches.write().map_err(poisoned)?;
        if batches.contains_key(&batch.id) {
            return Ok(false);
        }
        batches.insert(batch.id.clone(), batch.clone());
        Ok(true)
    }

    async fn get_batch(&self, id: &JobUuid) -> StoreResult<Option<BatchJob>> {
        let batches = self.batches.read().map_err(poisoned)?;
        Ok(batches.get(id).cloned())
    }

    async fn delete_batch(&self, id: &JobUuid) -> StoreResult<bool> {
        let removed = self.batches.write().map_err(poisoned)?.remove(id);
        let Some(batch) = removed else {
            return Ok(false);
        };
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        for child in &batch.child_job_ids {
            if let Some(job) = jobs.get_mut(child) {
                job.parent_batch_id = None;
            }
        }
        Ok(true)
    }
}
