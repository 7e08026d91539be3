//! Budget-constrained max-min diversity selection.
//!
//! The selector grows a subset greedily: each round it takes the open
//! candidate farthest from everything already selected. Ties on distance go
//! to the higher quality score, then to the lower candidate id, so the same
//! pool always yields the same sequence. Every candidate starts infinitely
//! far from the empty selection, which makes the first pick the
//! highest-quality candidate that fits the budget.
//!
//! A candidate whose size would overflow the byte budget is skipped for good
//! (the budget only shrinks) and the round continues with the next best.
//!
//! Per-round distance updates run in parallel with rayon; the pick itself is
//! serial because each round depends on the previous one.

use std::cmp::Reverse;

use ndarray::Array2;
use ordered_float::OrderedFloat;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::candidate::{validate_pool, CandidateId, CandidateItem, CurationError, SelectionBudget};
use super::distance::DistanceMetric;

/// Default target dimension of the random projection.
pub const DEFAULT_PROJECTION_DIMENSION: usize = 32;

/// Default pool size above which [`ScoringStrategy::Auto`] projects.
pub const DEFAULT_APPROXIMATE_THRESHOLD: usize = 20_000;

/// Gaussian random projection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionParams {
    /// Target dimension. Embeddings already this small are not projected.
    pub dimension: usize,
    /// Seed of the projection matrix.
    pub seed: u64,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_PROJECTION_DIMENSION,
            seed: 42,
        }
    }
}

impl ProjectionParams {
    /// Builds the `source_dim x dimension` projection matrix, scaled so that
    /// squared lengths are preserved in expectation.
    fn matrix(&self, source_dim: usize) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let scale = 1.0 / (self.dimension as f64).sqrt();
        Array2::from_shape_simple_fn((source_dim, self.dimension), || {
            let value: f64 = StandardNormal.sample(&mut rng);
            value * scale
        })
    }
}

/// How candidate distances are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringStrategy {
    /// Distances in the full embedding space.
    Exact,
    /// Distances after a seeded random projection to a lower dimension.
    Approximate(ProjectionParams),
    /// Exact for pools up to `threshold` items, approximate above.
    Auto {
        threshold: usize,
        projection: ProjectionParams,
    },
}

impl Default for ScoringStrategy {
    fn default() -> Self {
        ScoringStrategy::Auto {
            threshold: DEFAULT_APPROXIMATE_THRESHOLD,
            projection: ProjectionParams::default(),
        }
    }
}

impl ScoringStrategy {
    /// Projection to apply for a pool of `pool_size` vectors of `dimension`.
    fn projection_for(&self, pool_size: usize, dimension: usize) -> Option<ProjectionParams> {
        let params = match *self {
            ScoringStrategy::Exact => return None,
            ScoringStrategy::Approximate(params) => params,
            ScoringStrategy::Auto {
                threshold,
                projection,
            } => {
                if pool_size <= threshold {
                    return None;
                }
                projection
            }
        };
        (params.dimension > 0 && params.dimension < dimension).then_some(params)
    }
}

/// Result of a selection run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Selected candidates in selection order.
    pub selected: Vec<CandidateId>,
    /// Sum of `size_bytes` over the selected candidates.
    pub total_bytes: u64,
    /// Candidates passed over because they no longer fit the byte budget.
    pub skipped_over_budget: usize,
    /// Whether distances were computed in a projected space.
    pub approximate: bool,
}

impl Selection {
    /// Number of selected candidates.
    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Open,
    Selected,
    Skipped,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    min_distance: f64,
}

/// Greedy max-min diversity selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiversitySelector {
    metric: DistanceMetric,
    strategy: ScoringStrategy,
}

impl DiversitySelector {
    /// Exact selector over `metric`.
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            strategy: ScoringStrategy::Exact,
        }
    }

    /// Sets how distances are scored.
    pub fn with_strategy(mut self, strategy: ScoringStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Distance metric in use.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Scoring strategy in use.
    pub fn strategy(&self) -> ScoringStrategy {
        self.strategy
    }

    /// Selects a diverse subset of `pool` within `budget`.
    ///
    /// The pool is validated first; a pool with duplicate ids, mixed
    /// dimensions or non-finite values is rejected. An empty pool or a zero
    /// count budget yields an empty selection.
    pub fn select(
        &self,
        pool: &[CandidateItem],
        budget: SelectionBudget,
    ) -> Result<Selection, CurationError> {
        self.select_until(pool, budget, || false)
    }

    /// Like [`DiversitySelector::select`], but polls `is_cancelled` before
    /// every round and stops with [`CurationError::Cancelled`] once it
    /// returns true.
    pub fn select_until(
        &self,
        pool: &[CandidateItem],
        budget: SelectionBudget,
        is_cancelled: impl Fn() -> bool,
    ) -> Result<Selection, CurationError> {
        let dimension = validate_pool(pool)?;
        if self.metric == DistanceMetric::Angular {
            if let Some(item) = pool
                .iter()
                .find(|item| item.embedding.iter().all(|v| *v == 0.0))
            {
                return Err(CurationError::ZeroVector(item.id));
            }
        }

        let limit = budget.max_items(pool.len());
        let projection = self.strategy.projection_for(pool.len(), dimension);
        let mut selection = Selection {
            approximate: projection.is_some(),
            ..Selection::default()
        };
        if limit == 0 {
            return Ok(selection);
        }

        let rows = self.embedding_rows(pool, dimension, projection);
        let mut slots = vec![
            Slot {
                state: SlotState::Open,
                min_distance: f64::INFINITY,
            };
            pool.len()
        ];

        while selection.selected.len() < limit {
            if is_cancelled() {
                debug!(
                    selected = selection.selected.len(),
                    "Diversity selection cancelled"
                );
                return Err(CurationError::Cancelled);
            }
            let Some(best) = best_open(&slots, pool) else {
                break;
            };

            let item = &pool[best];
            if !budget.fits(selection.total_bytes, item.size_bytes) {
                slots[best].state = SlotState::Skipped;
                selection.skipped_over_budget += 1;
                continue;
            }

            // `fits` guarantees the sum does not overflow.
            slots[best].state = SlotState::Selected;
            selection.selected.push(item.id);
            selection.total_bytes += item.size_bytes;

            let chosen = rows.row(best);
            let metric = self.metric;
            slots
                .par_iter_mut()
                .enumerate()
                .filter(|(_, slot)| slot.state == SlotState::Open)
                .for_each(|(index, slot)| {
                    let distance = metric.distance_prepared(rows.row(index), chosen);
                    if distance < slot.min_distance {
                        slot.min_distance = distance;
                    }
                });
        }

        debug!(
            pool = pool.len(),
            selected = selection.selected.len(),
            bytes = selection.total_bytes,
            skipped = selection.skipped_over_budget,
            approximate = selection.approximate,
            metric = %self.metric,
            "Diversity selection finished"
        );

        Ok(selection)
    }

    fn embedding_rows(
        &self,
        pool: &[CandidateItem],
        dimension: usize,
        projection: Option<ProjectionParams>,
    ) -> Array2<f64> {
        let rows = Array2::from_shape_fn((pool.len(), dimension), |(i, j)| pool[i].embedding[j]);
        let rows = match projection {
            Some(params) => rows.dot(&params.matrix(dimension)),
            None => rows,
        };
        self.metric.prepare(rows)
    }
}

/// Open candidate ranked first by (min distance, quality, lowest id).
fn best_open(slots: &[Slot], pool: &[CandidateItem]) -> Option<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.state == SlotState::Open)
        .max_by_key(|(index, slot)| {
            let item = &pool[*index];
            (
                OrderedFloat(slot.min_distance),
                OrderedFloat(item.quality),
                Reverse(item.id),
            )
        })
        .map(|(index, _)| index)
}
