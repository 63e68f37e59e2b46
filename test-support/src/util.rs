//! Utility helpers for asynchronous tests.

use std::time::Duration;
use tokio::time::sleep;

/// Poll `condition` until it holds, trying at most `tries` times.
///
/// Sleeping between polls yields to the runtime, so tasks driven alongside
/// the caller (for example via `tokio::join!`) make progress.
///
/// # Examples
///
/// ```rust,ignore
/// use std::time::Duration;
/// use test_support::wait_until;
///
/// let ready = wait_until(|| remote.quit_calls() > 0, 50, Duration::from_millis(10)).await;
/// assert!(ready);
/// ```
pub async fn wait_until(mut condition: impl FnMut() -> bool, tries: u32, delay: Duration) -> bool {
    for _ in 0..tries {
        if condition() {
            return true;
        }
        sleep(delay).await;
    }
    condition()
}
