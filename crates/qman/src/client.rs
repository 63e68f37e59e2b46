//! Inserting an envelope into a beanstalkd tube.
//!
//! Kept apart from `lib.rs` so argument parsing stays focused and the
//! network side is testable against a scripted server.

use std::time::Duration;

use qman_lib::beanstalk::BeanstalkConnection;
use qman_lib::producer::{Producer, PutOptions};
use qman_lib::{ClientError, Envelope, QueueConnection};
use thiserror::Error;
use tracing::{debug, warn};

use crate::Args;

/// Errors that can occur while enqueueing.
#[derive(Debug, Error)]
pub enum CliError {
    /// Serializing the envelope failed.
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Talking to the queue server failed.
    #[error("queue server: {0}")]
    Queue(#[from] ClientError),
}

/// Insert the command described by `args` and return the new job id.
///
/// # Examples
///
/// ```no_run
/// # use qman::{Args, run};
/// # use clap::Parser;
/// let args = Args::parse_from(["qman", "qman.exec", r#"{"program":"true"}"#]);
/// let id = run(args)?;
/// println!("queued job {id}");
/// # Ok::<(), qman::CliError>(())
/// ```
pub fn run(args: Args) -> Result<u64, CliError> {
    let payload = serde_json::to_vec(&Envelope::new(args.command_type, args.data))?;
    let options = PutOptions {
        priority: args.priority,
        delay: Duration::from_secs(args.delay),
        ttr: Duration::from_secs(args.ttr),
    };

    let mut connection = BeanstalkConnection::connect(args.server)?;
    connection.use_tube(&args.tube)?;
    let id = connection.put(&payload, &options)?;
    debug!(job = id, tube = %args.tube, "Queued job");
    if let Err(e) = connection.quit() {
        warn!(error = %e, "Failed to close connection");
    }
    Ok(id)
}
