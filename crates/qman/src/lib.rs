//! Library utilities for the `qman` CLI.

use clap::Parser;
use qman_lib::beanstalk::DEFAULT_TUBE;
use qman_lib::producer::{DEFAULT_PRIORITY, DEFAULT_TTR};
use serde_json::Value;

mod client;

pub use client::{CliError, run};

/// Server used when `--server` is not given.
pub const DEFAULT_SERVER: &str = "127.0.0.1:11300";

/// Command line arguments for the `qman` producer.
#[derive(Debug, Clone, Parser)]
#[command(name = "qman", about = "Enqueue a command for a qman worker")]
pub struct Args {
    /// Command type tag, e.g. "qman.exec".
    #[arg(value_parser = validate_command_type)]
    pub command_type: String,

    /// Command data as JSON. It is recommended to quote this argument.
    #[arg(value_parser = parse_data, default_value = "null")]
    pub data: Value,

    /// Queue server as HOST:PORT.
    #[arg(long, default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Tube to insert into.
    #[arg(long, default_value = DEFAULT_TUBE)]
    pub tube: String,

    /// Job priority; lower is more urgent.
    #[arg(long, default_value_t = DEFAULT_PRIORITY)]
    pub priority: u32,

    /// Seconds before the job becomes ready.
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    /// Seconds a worker may hold the job.
    #[arg(long, default_value_t = DEFAULT_TTR.as_secs())]
    pub ttr: u64,
}

fn validate_command_type(s: &str) -> Result<String, String> {
    if s.trim().is_empty() || s.chars().any(char::is_whitespace) {
        Err(String::from("command type must be a single non-empty word"))
    } else {
        Ok(s.to_owned())
    }
}

fn parse_data(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("data must be valid JSON: {e}"))
}
