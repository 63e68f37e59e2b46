//! Shared types for the qman job queue.
//!
//! This crate holds everything both sides of the queue need to agree on:
//! the [`Command`] trait and its wire envelope, the [`CommandSerializer`]
//! registry that turns payloads back into commands, the collaborator traits
//! describing a queue connection, and a blocking beanstalkd client that
//! implements them.
//!
//! The worker runtime lives in the `qmand` crate; the `qman` binary is a thin
//! producer built on [`producer::Dispatcher`].

pub mod beanstalk;
pub mod command;
pub mod connection;
pub mod envelope;
pub mod producer;
pub mod serializer;

pub use command::{CallCommand, CallTable, Command, CommandError};
pub use connection::{
    ClientError, JobHandle, JobState, JobStats, PendingReserve, QueueConnection, ReservedJob,
};
pub use envelope::Envelope;
pub use serializer::{CommandSerializer, ConflictKind, SerializerError};
