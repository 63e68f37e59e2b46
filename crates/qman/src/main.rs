//! CLI producer for qman queues.
//! Wraps the given command in its envelope and inserts it into a tube.

use std::process::ExitCode;

use clap::Parser;
use qman::{Args, run};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    match run(Args::parse()) {
        Ok(id) => {
            println!("{id}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("qman: {e}");
            ExitCode::FAILURE
        }
    }
}
