//! Dataset curation by diversity selection.
//!
//! Once a job's production stages finish, its outputs are broken into a
//! candidate pool (one [`CandidateItem`] per clip, with an embedding and a
//! quality score). Curation picks a budget-limited subset that covers the
//! pool as evenly as possible while preferring higher quality among
//! near-duplicates.
//!
//! Components:
//!
//! 1. **Candidates** - items, budgets, the dataset record and the
//!    [`CandidateSource`] that builds a pool from a job's final artifact
//! 2. **Distance** - the metric over embeddings (Euclidean or angular)
//! 3. **Selector** - greedy max-min selection with exact or
//!    random-projection scoring
//!
//! # Usage
//!
//! ```rust,ignore
//! use capforge::diversity::{CandidateItem, DistanceMetric, DiversitySelector, SelectionBudget};
//!
//! let pool = vec![
//!     CandidateItem::new(1, vec![0.0, 1.0], 0.9, 4_096),
//!     CandidateItem::new(2, vec![1.0, 0.0], 0.4, 4_096),
//! ];
//! let selection = DiversitySelector::new(DistanceMetric::Euclidean)
//!     .select(&pool, SelectionBudget::count(1))?;
//! assert_eq!(selection.selected.len(), 1);
//! ```

pub mod candidate;
pub mod distance;
pub mod selector;

pub use candidate::{
    validate_pool, CandidateId, CandidateItem, CandidateSource, CurationError, Dataset, DatasetId,
    SelectionBudget,
};
pub use distance::{cosine_similarity, euclidean_distance, DistanceMetric};
pub use selector::{
    DiversitySelector, ProjectionParams, ScoringStrategy, Selection,
    DEFAULT_APPROXIMATE_THRESHOLD, DEFAULT_PROJECTION_DIMENSION,
};
