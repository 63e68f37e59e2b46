//! Collaborator contracts between the worker runtime and a queue server.
//!
//! The runtime never talks to a socket directly. It asks a
//! [`QueueConnection`] for a [`PendingReserve`], waits for the reserve's
//! socket to become readable and then completes it, receiving a
//! [`ReservedJob`] whose [`JobHandle`] retires the job on the server.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors reported by a queue client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport failed.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    /// The connection was closed or never established.
    #[error("not connected")]
    Disconnected,
    /// The server replied with something the client could not parse.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server reported an error status.
    #[error("server error: {0}")]
    Server(String),
}

impl ClientError {
    /// Whether the error means the connection itself is gone.
    ///
    /// Only these errors lead to a reconnection attempt; every other error is
    /// reported and the listener is dropped.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Disconnected)
    }
}

/// Server-side state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Ready,
    Reserved,
    Delayed,
    Buried,
}

/// Statistics the server keeps for a job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobStats {
    pub id: u64,
    #[serde(default)]
    pub tube: String,
    pub state: JobState,
    #[serde(rename = "pri")]
    pub priority: u32,
    /// Number of times the job has been reserved, including the current
    /// reservation.
    pub reserves: u32,
    #[serde(default)]
    pub age: u64,
    #[serde(default)]
    pub delay: u64,
    #[serde(default)]
    pub ttr: u64,
    #[serde(default)]
    pub timeouts: u32,
    #[serde(default)]
    pub releases: u32,
    #[serde(default)]
    pub buries: u32,
    #[serde(default)]
    pub kicks: u32,
}

impl JobStats {
    /// Minimal stats for a freshly reserved job.
    pub fn reserved(id: u64, priority: u32, reserves: u32) -> Self {
        Self {
            id,
            tube: String::new(),
            state: JobState::Reserved,
            priority,
            reserves,
            age: 0,
            delay: 0,
            ttr: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        }
    }
}

/// Server-side handle to one reserved job.
///
/// Exactly one of `delete`, `release` or `bury` retires the job.
pub trait JobHandle {
    fn id(&self) -> u64;

    /// # Errors
    ///
    /// Returns a [`ClientError`] if the server could not be queried.
    fn stats(&self) -> Result<JobStats, ClientError>;

    /// # Errors
    ///
    /// Returns a [`ClientError`] if the server refused the request.
    fn delete(&self) -> Result<(), ClientError>;

    /// # Errors
    ///
    /// Returns a [`ClientError`] if the server refused the request.
    fn release(&self, priority: u32, delay: Duration) -> Result<(), ClientError>;

    /// # Errors
    ///
    /// Returns a [`ClientError`] if the server refused the request.
    fn bury(&self, priority: u32) -> Result<(), ClientError>;
}

/// A reserved job as delivered by the server.
pub struct ReservedJob {
    pub handle: Box<dyn JobHandle>,
    pub payload: Vec<u8>,
}

impl ReservedJob {
    pub fn new(handle: Box<dyn JobHandle>, payload: Vec<u8>) -> Self {
        Self { handle, payload }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }
}

impl std::fmt::Debug for ReservedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedJob")
            .field("id", &self.id())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A reserve request that has been sent but whose reply is still pending.
pub trait PendingReserve {
    /// Descriptor that becomes readable once the reply is available.
    fn socket(&self) -> RawFd;

    /// Read the reply.
    ///
    /// Only call this once [`PendingReserve::socket`] is readable; otherwise
    /// the call may block.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the reply could not be read or reported
    /// a failure.
    fn invoke(self: Box<Self>) -> Result<ReservedJob, ClientError>;
}

/// A connection to one queue server.
pub trait QueueConnection {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Replace the set of watched queues.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the server refused a queue.
    fn watch_queues(&mut self, queues: &[String]) -> Result<(), ClientError>;

    /// Issue a reserve request without waiting for the reply.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the request could not be sent.
    fn reserve_handle(&mut self) -> Result<Box<dyn PendingReserve>, ClientError>;

    /// Re-establish the transport and restore watched queues.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the server is still unreachable.
    fn reconnect(&mut self) -> Result<(), ClientError>;

    /// Drop the transport without telling the server.
    fn disconnect(&mut self);

    /// Politely close the connection.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the quit request could not be sent.
    fn quit(&mut self) -> Result<(), ClientError>;
}
