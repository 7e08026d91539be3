//! In-process registry of job records.
//!
//! Records live in an arena addressed through a `JobId -> slot` index. All
//! mutation goes through [`JobStore::update`], which applies a transition
//! under the write lock so readers always observe the status group
//! (status, current stage, stage start, rate) as one consistent snapshot.
//! Status changes are also published on a per-job watch channel so callers
//! can wait for a job to settle.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::diversity::{Dataset, DatasetId};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::stage::{ProgressSink, Stage};

use super::job::{JobId, JobStatus, ProcessingJob};

struct JobSlot {
    job: ProcessingJob,
    cancel: CancellationToken,
    status_tx: watch::Sender<JobStatus>,
}

#[derive(Default)]
struct StoreInner {
    slots: Vec<JobSlot>,
    index: HashMap<JobId, usize>,
    datasets: HashMap<DatasetId, Dataset>,
}

impl StoreInner {
    fn slot(&self, id: JobId) -> OrchestratorResult<&JobSlot> {
        self.index
            .get(&id)
            .map(|&index| &self.slots[index])
            .ok_or(OrchestratorError::NotFound(id))
    }

    fn slot_mut(&mut self, id: JobId) -> OrchestratorResult<&mut JobSlot> {
        match self.index.get(&id) {
            Some(&index) => Ok(&mut self.slots[index]),
            None => Err(OrchestratorError::NotFound(id)),
        }
    }
}

/// Shared store of job and dataset records.
#[derive(Default)]
pub struct JobStore {
    inner: RwLock<StoreInner>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job and returns its identifier.
    pub fn insert(&self, job: ProcessingJob) -> JobId {
        let id = job.id();
        let (status_tx, _) = watch::channel(job.status());
        let mut inner = self.inner.write().expect("job store write lock poisoned");
        let index = inner.slots.len();
        inner.slots.push(JobSlot {
            job,
            cancel: CancellationToken::new(),
            status_tx,
        });
        inner.index.insert(id, index);
        id
    }

    /// Snapshot of a job record.
    pub fn get(&self, id: JobId) -> OrchestratorResult<ProcessingJob> {
        let inner = self.inner.read().expect("job store read lock poisoned");
        inner.slot(id).map(|slot| slot.job.clone())
    }

    /// Reads a job under the read lock without cloning it.
    pub fn inspect<R>(&self, id: JobId, f: impl FnOnce(&ProcessingJob) -> R) -> OrchestratorResult<R> {
        let inner = self.inner.read().expect("job store read lock poisoned");
        inner.slot(id).map(|slot| f(&slot.job))
    }

    /// Applies a mutation atomically. A failed mutation must leave the job untouched.
    pub fn update<R>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut ProcessingJob) -> OrchestratorResult<R>,
    ) -> OrchestratorResult<R> {
        let mut inner = self.inner.write().expect("job store write lock poisoned");
        let slot = inner.slot_mut(id)?;
        let result = f(&mut slot.job)?;
        let current = slot.job.status();
        slot.status_tx.send_if_modified(|status| {
            let changed = *status != current;
            *status = current;
            changed
        });
        Ok(result)
    }

    /// Cancellation token shared with the job's worker.
    pub fn cancellation_token(&self, id: JobId) -> OrchestratorResult<CancellationToken> {
        let inner = self.inner.read().expect("job store read lock poisoned");
        inner.slot(id).map(|slot| slot.cancel.clone())
    }

    /// Receiver that observes every status change of a job.
    pub fn subscribe(&self, id: JobId) -> OrchestratorResult<watch::Receiver<JobStatus>> {
        let inner = self.inner.read().expect("job store read lock poisoned");
        inner.slot(id).map(|slot| slot.status_tx.subscribe())
    }

    /// Snapshots of every job, in creation order.
    pub fn records(&self) -> Vec<ProcessingJob> {
        let inner = self.inner.read().expect("job store read lock poisoned");
        inner.slots.iter().map(|slot| slot.job.clone()).collect()
    }

    /// Number of jobs stored.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("job store read lock poisoned")
            .slots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of jobs in each status.
    pub fn status_counts(&self) -> BTreeMap<JobStatus, usize> {
        let inner = self.inner.read().expect("job store read lock poisoned");
        let mut counts = BTreeMap::new();
        for slot in &inner.slots {
            *counts.entry(slot.job.status()).or_insert(0) += 1;
        }
        counts
    }

    /// Stores a curated dataset and returns its identifier.
    pub fn insert_dataset(&self, dataset: Dataset) -> DatasetId {
        let id = dataset.id;
        self.inner
            .write()
            .expect("job store write lock poisoned")
            .datasets
            .insert(id, dataset);
        id
    }

    /// Dataset by identifier.
    pub fn dataset(&self, id: DatasetId) -> Option<Dataset> {
        self.inner
            .read()
            .expect("job store read lock poisoned")
            .datasets
            .get(&id)
            .cloned()
    }

    /// Dataset produced by a job, if curation ran.
    pub fn dataset_for_job(&self, job_id: JobId) -> Option<Dataset> {
        let inner = self.inner.read().expect("job store read lock poisoned");
        inner
            .datasets
            .values()
            .find(|dataset| dataset.job_id == Some(job_id))
            .cloned()
    }
}

impl ProgressSink for JobStore {
    fn set_total_units(&self, job_id: JobId, stage: Stage, total: u64) {
        let _ = self.update(job_id, |job| Ok(job.set_total_units(stage, total)));
    }

    fn units_completed(&self, job_id: JobId, stage: Stage, done: u64) {
        let _ = self.update(job_id, |job| Ok(job.record_progress(stage, done, Utc::now())));
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("jobs", &self.len())
            .finish()
    }
}
