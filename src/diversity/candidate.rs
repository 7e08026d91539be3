//! Candidate items, selection budgets and curated datasets.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::error::ErrorKind;
use crate::scheduler::JobId;

use super::selector::Selection;

/// Errors that can occur during curation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CurationError {
    #[error("Invalid budget: {0}")]
    InvalidBudget(String),

    #[error("Candidate {0} appears more than once in the pool")]
    DuplicateCandidate(CandidateId),

    #[error("Candidate {id} has embedding dimension {actual}, expected {expected}")]
    DimensionMismatch {
        id: CandidateId,
        expected: usize,
        actual: usize,
    },

    #[error("Candidate {0} has an empty embedding")]
    EmptyEmbedding(CandidateId),

    #[error("Candidate {0} has a non-finite embedding value or quality score")]
    NonFinite(CandidateId),

    #[error("Candidate {0} has a zero-length embedding, which has no angle")]
    ZeroVector(CandidateId),

    #[error("Failed to load candidates: {0}")]
    Source(String),

    #[error("Selection cancelled")]
    Cancelled,
}

impl CurationError {
    /// Error category recorded when curation fails.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CurationError::Source(_) | CurationError::Cancelled => ErrorKind::Export,
            _ => ErrorKind::Configuration,
        }
    }
}

/// Identifier of a candidate within its pool. Lower ids win exact ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub u64);

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An item eligible for the curated dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub id: CandidateId,
    /// Fixed-dimension content feature vector.
    pub embedding: Vec<f64>,
    /// Higher is better; biases selection among near-duplicates.
    pub quality: f64,
    /// Contribution to the byte budget if selected.
    pub size_bytes: u64,
}

impl CandidateItem {
    /// Creates a candidate. Validation happens when a pool is selected from.
    pub fn new(id: u64, embedding: Vec<f64>, quality: f64, size_bytes: u64) -> Self {
        Self {
            id: CandidateId(id),
            embedding,
            quality,
            size_bytes,
        }
    }
}

/// Checks a pool for duplicate ids, inconsistent dimensions and non-finite values.
///
/// Returns the shared embedding dimension (0 for an empty pool).
pub fn validate_pool(pool: &[CandidateItem]) -> Result<usize, CurationError> {
    let Some(first) = pool.first() else {
        return Ok(0);
    };
    let dimension = first.embedding.len();
    let mut seen = HashSet::with_capacity(pool.len());

    for item in pool {
        if !seen.insert(item.id) {
            return Err(CurationError::DuplicateCandidate(item.id));
        }
        if item.embedding.is_empty() {
            return Err(CurationError::EmptyEmbedding(item.id));
        }
        if item.embedding.len() != dimension {
            return Err(CurationError::DimensionMismatch {
                id: item.id,
                expected: dimension,
                actual: item.embedding.len(),
            });
        }
        if !item.quality.is_finite() || item.embedding.iter().any(|v| !v.is_finite()) {
            return Err(CurationError::NonFinite(item.id));
        }
    }

    Ok(dimension)
}

/// Count and/or byte limits for a curated dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionBudget {
    /// Maximum number of items.
    pub count: Option<usize>,
    /// Maximum cumulative `size_bytes` of the selected items.
    pub bytes: Option<u64>,
}

impl SelectionBudget {
    /// Creates a budget. At least one limit must be given, and a given
    /// limit must be non-zero.
    pub fn new(count: Option<usize>, bytes: Option<u64>) -> Result<Self, CurationError> {
        if count.is_none() && bytes.is_none() {
            return Err(CurationError::InvalidBudget(
                "either a count budget or a byte budget is required".to_string(),
            ));
        }
        if count == Some(0) {
            return Err(CurationError::InvalidBudget(
                "count budget must be at least 1".to_string(),
            ));
        }
        if bytes == Some(0) {
            return Err(CurationError::InvalidBudget(
                "byte budget must be at least 1".to_string(),
            ));
        }
        Ok(Self { count, bytes })
    }

    /// Count-only budget. Not validated; jobs and `curate_dataset` re-check
    /// budgets through [`SelectionBudget::new`].
    pub fn count(count: usize) -> Self {
        Self {
            count: Some(count),
            bytes: None,
        }
    }

    /// Byte-only budget. Not validated, like [`SelectionBudget::count`].
    pub fn bytes(bytes: u64) -> Self {
        Self {
            count: None,
            bytes: Some(bytes),
        }
    }

    /// Effective item limit for a pool of `pool_size` items.
    pub fn max_items(&self, pool_size: usize) -> usize {
        self.count.map_or(pool_size, |count| count.min(pool_size))
    }

    /// Whether `size` more bytes fit on top of `used`. A total that would
    /// overflow `u64` never fits, even without a byte limit.
    pub fn fits(&self, used: u64, size: u64) -> bool {
        let Some(total) = used.checked_add(size) else {
            return false;
        };
        self.bytes.map_or(true, |limit| total <= limit)
    }
}

/// Identifier of a curated dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(Uuid);

impl DatasetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DatasetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A curated dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    /// Owning production job; `None` for curation-only runs.
    pub job_id: Option<JobId>,
    /// Bytes of the curated output.
    pub output_size_bytes: u64,
    pub sample_count: u64,
    /// Selected candidates in selection order.
    pub selected: Vec<CandidateId>,
    pub created_at: DateTime<Utc>,
}

impl Dataset {
    /// Builds the dataset record from a finished selection.
    pub fn from_selection(job_id: Option<JobId>, selection: &Selection) -> Self {
        Self {
            id: DatasetId::new(),
            job_id,
            output_size_bytes: selection.total_bytes,
            sample_count: selection.selected.len() as u64,
            selected: selection.selected.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Loads the candidate pool a job's final artifact yields.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn candidates(
        &self,
        job_id: JobId,
        artifact: &Artifact,
    ) -> Result<Vec<CandidateItem>, CurationError>;
}
