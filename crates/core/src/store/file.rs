//! File-backed job store.
//!
//! Layout under the job data directory:
//!
//! ```text
//! <root>/jobs/<s1>/<s2>/<32hex-id>/job.json
//! <root>/batches/<s1>/<s2>/<32hex-id>/batch.json
//! ```
//!
//! where `s1`/`s2` are the first two hex pairs of the id. Writes go to a temporary file that
//! is then renamed over the target, and every read-modify-write holds the store's write lock,
//! so a reader never sees a half-written job. File I/O goes through `tokio::fs`; the directory
//! walk behind [`JobStore::list`] runs on the blocking pool.

use super::{apply_completion, JobStore};
use crate::constants::{BATCHES_DIR_NAME, BATCH_JSON_FILENAME, JOBS_DIR_NAME, JOB_JSON_FILENAME};
use crate::job::{BatchJob, Job, JobResult};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use rc_uuid::JobUuid;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::task;

#[derive(Debug)]
pub struct FileJobStore {
    jobs_dir: PathBuf,
    batches_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageDirCreation`] if the directories cannot be created.
    pub fn open(root: &Path) -> StoreResult<Self> {
        let jobs_dir = root.join(JOBS_DIR_NAME);
        let batches_dir = root.join(BATCHES_DIR_NAME);
        fs::create_dir_all(&jobs_dir).map_err(StoreError::StorageDirCreation)?;
        fs::create_dir_all(&batches_dir).map_err(StoreError::StorageDirCreation)?;
        Ok(Self {
            jobs_dir,
            batches_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn job_path(&self, id: &JobUuid) -> PathBuf {
        id.sharded_dir(&self.jobs_dir).join(JOB_JSON_FILENAME)
    }

    fn batch_path(&self, id: &JobUuid) -> PathBuf {
        id.sharded_dir(&self.batches_dir).join(BATCH_JSON_FILENAME)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: &Job) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.job_path(&job.id);
        if exists(&path).await? {
            return Ok(false);
        }
        write_json(&path, job).await?;
        tracing::debug!("created job {}", job.id);
        Ok(true)
    }

    async fn get(&self, id: &JobUuid) -> StoreResult<Option<Job>> {
        read_json(&self.job_path(id)).await
    }

    async fn complete_with(&self, id: &JobUuid, result: JobResult) -> StoreResult<Job> {
        let _guard = self.write_lock.lock().await;
        let path = self.job_path(id);
        let mut job: Job = read_json(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_completion(&mut job, result)?;
        write_json(&path, &job).await?;
        Ok(job)
    }

    async fn list(&self) -> StoreResult<Vec<Job>> {
        let jobs_dir = self.jobs_dir.clone();
        let paths = task::spawn_blocking(move || sharded_files(&jobs_dir, JOB_JSON_FILENAME))
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut jobs: Vec<Job> = Vec::with_capacity(paths.len());
        for path in paths {
            match read_json::<Job>(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => tracing::warn!("failed to read job {}: {e}", path.display()),
            }
        }
        jobs.sort_by_key(|job| job.started_at);
        Ok(jobs)
    }

    async fn create_batch(&self, batch: &BatchJob) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.batch_path(&batch.id);
        if exists(&path).await? {
            return Ok(false);
        }
        write_json(&path, batch).await?;
        Ok(true)
    }

    async fn get_batch(&self, id: &JobUuid) -> StoreResult<Option<BatchJob>> {
        read_json(&self.batch_path(id)).await
    }

    async fn delete_batch(&self, id: &JobUuid) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.batch_path(id);
        let Some(batch) = read_json::<BatchJob>(&path).await? else {
            return Ok(false);
        };

        for child in &batch.child_job_ids {
            let child_path = self.job_path(child);
            if let Some(mut job) = read_json::<Job>(&child_path).await? {
                job.parent_batch_id = None;
                write_json(&child_path, &job).await?;
            }
        }

        let dir = id.sharded_dir(&self.batches_dir);
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(StoreError::FileWrite)?;
        Ok(true)
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

async fn exists(path: &Path) -> StoreResult<bool> {
    tokio::fs::try_exists(path).await.map_err(StoreError::FileRead)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::FileRead(e)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(StoreError::Deserialization)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(StoreError::StorageDirCreation)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(StoreError::Serialization)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(StoreError::FileWrite)?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(StoreError::FileWrite)
}

/// Every `<dir>/<s1>/<s2>/<id>/<file_name>` that exists. Blocking.
fn sharded_files(dir: &Path, file_name: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(s1_iter) = fs::read_dir(dir) else {
        return files;
    };
    for s1 in s1_iter.flatten() {
        let Ok(s2_iter) = fs::read_dir(s1.path()) else {
            continue;
        };
        for s2 in s2_iter.flatten() {
            let Ok(id_iter) = fs::read_dir(s2.path()) else {
                continue;
            };
            for id_ent in id_iter.flatten() {
                let path = id_ent.path().join(file_name);
                if path.is_file() {
                    files.push(path);
                }
            }
        }
    }
    files
}
