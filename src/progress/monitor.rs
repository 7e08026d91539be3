//! Background monitor that periodically logs job counts.
//!
//! Lets operators follow a busy orchestrator without reading per-job log
//! lines: every tick it snapshots the store and logs how many jobs sit in
//! each status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::scheduler::{JobStatus, JobStore};

/// Job counts per status at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    /// Counts the jobs currently held by `store`.
    pub fn from_store(store: &JobStore) -> Self {
        let mut counts = Self::default();
        for (status, count) in store.status_counts() {
            match status {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Completed => counts.completed = count,
                JobStatus::Failed => counts.failed = count,
                JobStatus::Cancelled => counts.cancelled = count,
            }
        }
        counts
    }

    /// Jobs counted, in any status.
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    /// Jobs that have reached a terminal status.
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// A background task that logs [`JobCounts`] every `interval`.
///
/// Call [`ProgressMonitor::stop`] to end it; dropping the monitor also
/// signals the task to exit at its next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Starts the monitor on the current tokio runtime.
    pub fn start(store: Arc<JobStore>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let counts = JobCounts::from_store(&store);
                let pct = if counts.total() > 0 {
                    counts.finished() as f64 / counts.total() as f64 * 100.0
                } else {
                    0.0
                };

                tracing::info!(
                    pending = counts.pending,
                    running = counts.running,
                    completed = counts.completed,
                    failed = counts.failed,
                    cancelled = counts.cancelled,
                    finished_pct = format!("{:.1}%", pct),
                    elapsed_secs = start.elapsed().as_secs(),
                    "Orchestrator progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signals the monitor to stop and waits for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
