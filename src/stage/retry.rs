//! Bounded retry of recoverable stage failures.
//!
//! Model load and inference failures are retried inside the stage boundary;
//! the job state machine only ever sees the final outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::error::StageError;

use super::{StageConfig, StageContext, StageOutput, StageRunner};

/// Default number of attempts for a retryable failure.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between attempts.
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// How many times a stage invocation is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Returns whether another attempt is allowed after `attempts` tries.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }
}

/// Stage wrapper applying a [`RetryPolicy`] to retryable failures.
pub struct RetryingStage {
    inner: Arc<dyn StageRunner>,
    policy: RetryPolicy,
}

impl RetryingStage {
    /// Wraps `inner` with `policy`.
    pub fn new(inner: Arc<dyn StageRunner>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl StageRunner for RetryingStage {
    async fn run(
        &self,
        input: &Artifact,
        config: &StageConfig,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let mut attempts = 0;
        loop {
            ctx.checkpoint()?;
            attempts += 1;

            let err = match self.inner.run(input, config, ctx).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            if !self.policy.should_retry(attempts) {
                return Err(if attempts > 1 {
                    StageError::RetriesExhausted {
                        attempts,
                        last: Box::new(err),
                    }
                } else {
                    err
                });
            }

            warn!(
                job_id = %ctx.job_id(),
                stage = %ctx.stage(),
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                error = %err,
                "Retryable stage failure, trying again"
            );

            if !self.policy.backoff.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.policy.backoff) => {}
                    _ = ctx.cancellation_token().cancelled() => {
                        debug!(job_id = %ctx.job_id(), stage = %ctx.stage(), "Cancelled during retry backoff");
                        return Err(StageError::Cancelled);
                    }
                }
            }
        }
    }
}
