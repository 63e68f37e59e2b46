#![cfg_attr(docsrs, feature(doc_cfg))]

//! Library components for the qmand worker daemon.
//!
//! # Overview
//! - [`config::Config`]: operational limits loaded from
//!   `/etc/qmand/config.toml` with environment and CLI overrides, locked once
//!   a worker is built.
//! - [`event_loop::EventLoop`]: the single-threaded reactor multiplexing
//!   queue sockets, timers and termination signals.
//! - [`worker::Worker`]: arms a job listener per connection and retires each
//!   job through a [`failure::FailureStrategy`] when its command fails.
//!
//! # Examples
//! ```rust,no_run
//! use qmand::config::Config;
//!
//! let cfg = Config::load().expect("configuration must be valid");
//! println!("servers: {:?}", cfg.servers());
//! ```
pub mod commands;
pub mod config;
pub mod event_loop;
pub mod failure;
pub mod job;
pub mod logging;
pub mod process;
pub mod util;
pub mod worker;

pub use worker::{Worker, WorkerBuilder, WorkerError};
