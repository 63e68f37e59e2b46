//! Producer side of the queue.
//!
//! [`Dispatcher`] serializes commands and inserts them through a
//! [`Producer`]. With fallback enabled, a command that cannot be queued runs
//! in-process instead so the work is not lost.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::command::Command;
use crate::connection::ClientError;
use crate::serializer::{CommandSerializer, SerializerError};

/// Priority used when none is given; lower values are more urgent.
pub const DEFAULT_PRIORITY: u32 = 1024;
/// Time a worker may hold a job before the server releases it again.
pub const DEFAULT_TTR: Duration = Duration::from_secs(60);

/// Insertion options for a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    pub priority: u32,
    pub delay: Duration,
    pub ttr: Duration,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            delay: Duration::ZERO,
            ttr: DEFAULT_TTR,
        }
    }
}

/// Something that can insert raw payloads into a queue.
pub trait Producer {
    /// Insert `payload` and return the server-assigned job id.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the job could not be inserted.
    fn put(&mut self, payload: &[u8], options: &PutOptions) -> Result<u64, ClientError>;
}

/// Where a dispatched command ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Inserted with the given job id.
    Queued(u64),
    /// Could not be queued and was executed in-process; carries the
    /// command's own success flag.
    ExecutedLocally(bool),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Serializer(#[from] SerializerError),
    #[error("failed to queue command: {0}")]
    Client(#[from] ClientError),
    #[error("fallback execution failed: {0:#}")]
    Fallback(anyhow::Error),
}

/// Queues commands through a [`Producer`].
pub struct Dispatcher<P> {
    producer: P,
    serializer: CommandSerializer,
    fallback: bool,
}

impl<P: Producer> Dispatcher<P> {
    pub fn new(producer: P, serializer: CommandSerializer) -> Self {
        Self {
            producer,
            serializer,
            fallback: false,
        }
    }

    /// Execute commands in-process when they cannot be queued.
    pub fn enable_fallback(&mut self) -> &mut Self {
        self.fallback = true;
        self
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback
    }

    pub fn serializer(&self) -> &CommandSerializer {
        &self.serializer
    }

    pub fn producer_mut(&mut self) -> &mut P {
        &mut self.producer
    }

    /// Serialize and insert `command`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Serializer`] if the command cannot be
    /// encoded. Insert failures surface as [`DispatchError::Client`] unless
    /// fallback is enabled, in which case the command runs locally and only
    /// an execution error is returned.
    pub fn queue(
        &mut self,
        command: &mut dyn Command,
        options: &PutOptions,
    ) -> Result<Dispatched, DispatchError> {
        let payload = self.serializer.serialize(command)?;
        match self.producer.put(&payload, options) {
            Ok(id) => {
                info!(job = id, command_type = command.command_type(), "Queued command");
                Ok(Dispatched::Queued(id))
            }
            Err(e) if self.fallback => {
                warn!(
                    error = %e,
                    command_type = command.command_type(),
                    "Queueing failed; executing command in-process"
                );
                let succeeded = command.execute().map_err(DispatchError::Fallback)?;
                Ok(Dispatched::ExecutedLocally(succeeded))
            }
            Err(e) => Err(e.into()),
        }
    }
}
