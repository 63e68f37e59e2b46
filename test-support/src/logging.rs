//! Log capture for tests.
//!
//! Installs a subscriber for the current thread only, so tests can assert on
//! log output without touching the global subscriber or the environment.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt};

/// Shared in-memory log sink.
#[derive(Clone, Default)]
pub struct LogBuffer {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

pub struct LogWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            buf: Arc::clone(&self.buf),
        }
    }
}

/// Run `f` with logs at `filter` level captured into the returned buffer.
///
/// # Examples
///
/// ```rust
/// use test_support::logging::capture_logs;
///
/// let (value, logs) = capture_logs("info", || {
///     tracing::info!("hello");
///     3
/// });
/// assert_eq!(value, 3);
/// assert!(logs.contents().contains("hello"));
/// ```
pub fn capture_logs<R>(filter: &str, f: impl FnOnce() -> R) -> (R, LogBuffer) {
    let buffer = LogBuffer::default();
    let subscriber = fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(buffer.clone())
        .with_ansi(false)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    (value, buffer)
}
