//! Storage accounting for jobs.
//!
//! A job's storage counter only moves when a stage commits its output, and
//! each stage commits at most once per job, so retried or failed stages can
//! never be double counted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stage::Stage;

/// Errors that can occur while metering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeteringError {
    #[error("stage '{0}' output was already committed")]
    AlreadyCommitted(Stage),
}

/// Cumulative bytes committed by a job's stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMeter {
    /// Sum of all committed artifact sizes. Monotonically non-decreasing.
    storage_size_bytes: u64,
    /// Bytes committed per stage.
    #[serde(default)]
    committed: BTreeMap<Stage, u64>,
}

impl StorageMeter {
    /// Creates an empty meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits a stage's output size and returns the new total.
    pub fn commit(&mut self, stage: Stage, bytes: u64) -> Result<u64, MeteringError> {
        if self.committed.contains_key(&stage) {
            return Err(MeteringError::AlreadyCommitted(stage));
        }
        self.committed.insert(stage, bytes);
        self.storage_size_bytes = self.storage_size_bytes.saturating_add(bytes);
        Ok(self.storage_size_bytes)
    }

    /// Sum of all committed bytes.
    pub fn total(&self) -> u64 {
        self.storage_size_bytes
    }

    /// Bytes committed by `stage`, if it committed.
    pub fn committed_for(&self, stage: Stage) -> Option<u64> {
        self.committed.get(&stage).copied()
    }

    /// Whether `stage` already committed its output.
    pub fn is_committed(&self, stage: Stage) -> bool {
        self.committed.contains_key(&stage)
    }
}
