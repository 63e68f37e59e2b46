//! Step definitions for the behavioural scenarios.

mod failure_steps;
mod worker_steps;

pub use failure_steps::FailureWorld;
pub use worker_steps::WorkerWorld;
