//! Logging setup for the worker.
//!
//! Logs go through `tracing`; the filter is read from `RUST_LOG` and defaults
//! to `info`.

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt};

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global tracing subscriber, writing to stdout.
///
/// # Examples
///
/// ```rust,no_run
/// use qmand::logging::init;
///
/// init(false);
/// tracing::info!("Logging is initialized!");
/// ```
pub fn init(json: bool) {
    init_with_writer(fmt::writer::BoxMakeWriter::new(std::io::stdout), json);
}

/// Initialize logging with a custom writer, optionally as JSON lines.
pub fn init_with_writer<W>(writer: W, json: bool)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = fmt().with_env_filter(filter()).with_writer(writer);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
