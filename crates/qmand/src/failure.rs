//! Retry policy for jobs whose command did not succeed.

use std::sync::Arc;
use std::time::Duration;

use qman_lib::ClientError;
use thiserror::Error;
use tracing::warn;

use crate::config::{Config, MAX_DELAY_SECS};
use crate::job::Job;

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Released { priority: u32, delay: Duration },
    Buried { priority: u32 },
}

#[derive(Debug, Error)]
pub enum FailureError {
    /// The job's statistics could not be read, so no decision was possible.
    #[error("cannot read stats for job {job}: {source}")]
    Stats {
        job: u64,
        #[source]
        source: ClientError,
    },
    /// The decision was made but the server refused it.
    #[error("cannot retire job {job}: {source}")]
    Retire {
        job: u64,
        #[source]
        source: ClientError,
    },
}

/// Decides how to retire a job whose command failed.
///
/// An error means the job record itself is unusable; the worker treats it as
/// fatal.
pub trait FailureStrategy {
    /// # Errors
    ///
    /// Returns a [`FailureError`] if the job could not be inspected or retired.
    fn handle_failed_job(&self, job: Job) -> Result<FailureDecision, FailureError>;
}

/// Linear backoff that restarts every `max_tries` reservations.
///
/// The n-th attempt of a cycle is released after `n * base_failure_delay`;
/// the last attempt of a cycle buries the job at its current priority.
/// Delays saturate at [`MAX_DELAY_SECS`].
#[derive(Debug, Clone)]
pub struct GenericJobFailureStrategy {
    config: Arc<Config>,
}

impl GenericJobFailureStrategy {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Decision for a job reserved `reserves` times at `priority`.
    pub fn decide(&self, reserves: u32, priority: u32) -> FailureDecision {
        let max_tries = self.config.max_tries().max(1);
        let attempt = reserves.saturating_sub(1) % max_tries + 1;
        if attempt >= max_tries {
            FailureDecision::Buried { priority }
        } else {
            FailureDecision::Released {
                priority,
                delay: self
                    .config
                    .base_failure_delay()
                    .saturating_mul(attempt)
                    .min(Duration::from_secs(MAX_DELAY_SECS)),
            }
        }
    }
}

impl FailureStrategy for GenericJobFailureStrategy {
    fn handle_failed_job(&self, job: Job) -> Result<FailureDecision, FailureError> {
        let id = job.id();
        let stats = job
            .stats()
            .map_err(|source| FailureError::Stats { job: id, source })?;
        let decision = self.decide(stats.reserves, stats.priority);
        let retired = match decision {
            FailureDecision::Released { priority, delay } => {
                warn!(
                    job = id,
                    reserves = stats.reserves,
                    delay_secs = delay.as_secs(),
                    "Releasing failed job"
                );
                job.release(priority, delay)
            }
            FailureDecision::Buried { priority } => {
                warn!(job = id, reserves = stats.reserves, "Burying failed job");
                job.bury(priority)
            }
        };
        retired.map_err(|source| FailureError::Retire { job: id, source })?;
        Ok(decision)
    }
}
