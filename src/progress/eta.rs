//! Throughput smoothing and completion projection.
//!
//! [`RateEstimator`] turns cumulative progress reports into instantaneous
//! rates and smooths the last `window` of them with an exponential moving
//! average. With fewer than two samples the rate is unknown (`None`), never
//! zero. [`project_eta`] combines the current stage's rate with historical
//! mean durations of the stages that have not started yet.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Default number of rate samples kept for smoothing.
pub const DEFAULT_RATE_WINDOW: usize = 10;

/// Minimum samples before a rate is reported.
const MIN_SAMPLES: usize = 2;

/// Windowed EMA over instantaneous units-per-second samples.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window: usize,
    samples: VecDeque<f64>,
    /// Last (cumulative units, timestamp) observation.
    anchor: Option<(u64, DateTime<Utc>)>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

impl RateEstimator {
    /// Estimator smoothing over the last `window` rate samples. A window below 2 is raised to 2.
    pub fn new(window: usize) -> Self {
        let window = window.max(MIN_SAMPLES);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            anchor: None,
        }
    }

    /// Number of samples retained.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Clears all samples and anchors at `units` completed as of `at`.
    pub fn restart(&mut self, units: u64, at: DateTime<Utc>) {
        self.samples.clear();
        self.anchor = Some((units, at));
    }

    /// Clears all samples and the anchor.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.anchor = None;
    }

    /// Records a cumulative progress report and returns the smoothed rate.
    ///
    /// Reports at the same instant as the anchor are folded into the next
    /// interval. A report going backwards re-anchors without a sample.
    pub fn observe(&mut self, units_done: u64, at: DateTime<Utc>) -> Option<f64> {
        match self.anchor {
            None => self.anchor = Some((units_done, at)),
            Some((prev_units, _)) if units_done < prev_units => {
                self.anchor = Some((units_done, at));
            }
            Some((prev_units, prev_at)) => {
                let elapsed = (at - prev_at)
                    .to_std()
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                if elapsed > 0.0 {
                    self.push_sample((units_done - prev_units) as f64 / elapsed);
                    self.anchor = Some((units_done, at));
                }
            }
        }
        self.rate()
    }

    /// Adds an instantaneous rate sample. Non-finite or negative values are ignored.
    pub fn push_sample(&mut self, rate: f64) {
        if !rate.is_finite() || rate < 0.0 {
            return;
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(rate);
    }

    /// Samples currently retained.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Smoothed rate, or `None` while fewer than two samples exist.
    pub fn rate(&self) -> Option<f64> {
        if self.samples.len() < MIN_SAMPLES {
            return None;
        }
        let alpha = 2.0 / (self.window as f64 + 1.0);
        let mut samples = self.samples.iter();
        let mut ema = *samples.next()?;
        for sample in samples {
            ema = alpha * sample + (1.0 - alpha) * ema;
        }
        Some(ema)
    }
}

/// Mean observed duration per stage, fed by successful completions.
#[derive(Debug, Clone, Default)]
pub struct StageDurationHistory {
    totals: HashMap<Stage, (Duration, u32)>,
}

impl StageDurationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one completed run of `stage`.
    pub fn record(&mut self, stage: Stage, duration: Duration) {
        let entry = self.totals.entry(stage).or_insert((Duration::ZERO, 0));
        entry.0 += duration;
        entry.1 += 1;
    }

    /// Mean duration of `stage`, if it ever completed.
    pub fn mean(&self, stage: Stage) -> Option<Duration> {
        self.totals
            .get(&stage)
            .filter(|(_, count)| *count > 0)
            .map(|(total, count)| *total / *count)
    }

    /// Completed runs recorded for `stage`.
    pub fn samples(&self, stage: Stage) -> u32 {
        self.totals.get(&stage).map(|(_, count)| *count).unwrap_or(0)
    }
}

/// Progress of the stage currently executing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CurrentStageProgress {
    pub units_done: u64,
    pub total_units: Option<u64>,
    pub rate: Option<f64>,
}

impl CurrentStageProgress {
    /// Remaining time for the current stage, if the rate and total are known.
    pub fn remaining(&self) -> Option<Duration> {
        let total = self.total_units?;
        let remaining_units = total.saturating_sub(self.units_done);
        if remaining_units == 0 {
            return Some(Duration::ZERO);
        }
        let rate = self.rate.filter(|rate| *rate > 0.0)?;
        Some(Duration::from_secs_f64(remaining_units as f64 / rate))
    }
}

/// Projected time to completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EtaEstimate {
    /// Remaining time of the executing stage.
    pub current_stage_remaining: Option<Duration>,
    /// Sum of mean durations of stages not yet started. `None` if any is unknown.
    pub pending_stages_remaining: Option<Duration>,
    /// Pending stages with no duration history.
    pub unknown_stages: Vec<Stage>,
    /// Overall projection, when every component is known.
    pub total: Option<Duration>,
}

impl EtaEstimate {
    /// Estimate for a job that has nothing left to do.
    pub fn finished() -> Self {
        Self {
            current_stage_remaining: None,
            pending_stages_remaining: Some(Duration::ZERO),
            unknown_stages: Vec::new(),
            total: Some(Duration::ZERO),
        }
    }
}

/// Projects remaining time from the current stage and the stages still pending.
pub fn project_eta(
    current: Option<CurrentStageProgress>,
    pending: &[Stage],
    history: &StageDurationHistory,
) -> EtaEstimate {
    let current_stage_remaining = current.as_ref().and_then(CurrentStageProgress::remaining);

    let mut pending_total = Duration::ZERO;
    let mut unknown_stages = Vec::new();
    for stage in pending {
        match history.mean(*stage) {
            Some(mean) => pending_total += mean,
            None => unknown_stages.push(*stage),
        }
    }
    let pending_stages_remaining = unknown_stages.is_empty().then_some(pending_total);

    let total = match (current.is_some(), current_stage_remaining, pending_stages_remaining) {
        (true, Some(current), Some(pending)) => Some(current + pending),
        (false, _, Some(pending)) => Some(pending),
        _ => None,
    };

    EtaEstimate {
        current_stage_remaining,
        pending_stages_remaining,
        unknown_stages,
        total,
    }
}
