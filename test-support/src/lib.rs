//! Test support utilities.
//!
//! Fakes for the queue collaborator traits plus small helpers for
//! environment, logging and polling in tests.

pub mod commands;
pub mod connection;
pub mod env_guard;
pub mod job;
pub mod logging;
pub mod util;

pub use commands::{Outcome, ScriptedCommand, scripted_payload, scripted_serializer};
pub use connection::{FakeConnection, FakeRemote};
pub use job::{FakeJob, JobOp};
pub use util::wait_until;
