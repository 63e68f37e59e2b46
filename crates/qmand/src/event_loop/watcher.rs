//! Watcher descriptions and the tasks that drive them.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error};

use super::{EventLoop, LoopInner};
use crate::util::guarded;

/// Identifier assigned to a registered watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub(super) u64);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a watcher waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    /// The descriptor becomes readable. Fires once.
    Readable(RawFd),
    /// Fires after `after`, then every `every` if set.
    Timer {
        after: Duration,
        every: Option<Duration>,
    },
    /// The process receives the signal. Fires on every delivery.
    Signal(Signal),
}

/// Callback run when a watcher fires.
///
/// The result is `Err` when the watcher could not be armed, for example when
/// a descriptor cannot be polled or a signal handler cannot be installed.
pub type WatcherCallback = Rc<dyn Fn(&EventLoop, WatcherId, io::Result<()>)>;

/// An event source plus the callback to run when it fires.
pub struct Watcher {
    kind: WatcherKind,
    callback: WatcherCallback,
}

impl Watcher {
    pub fn readable(fd: RawFd, callback: impl Fn(&EventLoop, WatcherId, io::Result<()>) + 'static) -> Self {
        Self {
            kind: WatcherKind::Readable(fd),
            callback: Rc::new(callback),
        }
    }

    pub fn timer(
        after: Duration,
        every: Option<Duration>,
        callback: impl Fn(&EventLoop, WatcherId, io::Result<()>) + 'static,
    ) -> Self {
        Self {
            kind: WatcherKind::Timer { after, every },
            callback: Rc::new(callback),
        }
    }

    pub fn signal(signal: Signal, callback: impl Fn(&EventLoop, WatcherId, io::Result<()>) + 'static) -> Self {
        Self {
            kind: WatcherKind::Signal(signal),
            callback: Rc::new(callback),
        }
    }

    pub fn kind(&self) -> WatcherKind {
        self.kind
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher").field("kind", &self.kind).finish()
    }
}

/// Run the callback for `id` if both the loop and the watcher still exist.
fn fire(inner: &Weak<LoopInner>, id: WatcherId, callback: &WatcherCallback, event: io::Result<()>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let event_loop = EventLoop { inner };
    if !event_loop.contains_watcher(id) {
        return;
    }
    if let Err(panic) = guarded(|| callback(&event_loop, id, event)) {
        error!(watcher = %id, panic = %panic, "Watcher callback panicked");
    }
}

/// Future backing a registered watcher. Aborting the task stops the watcher.
pub(super) async fn drive(id: WatcherId, watcher: Watcher, inner: Weak<LoopInner>) {
    let Watcher { kind, callback } = watcher;
    match kind {
        WatcherKind::Readable(fd) => {
            let readiness = wait_readable(fd).await;
            // The poll registration is gone by now, so the callback may
            // register the same descriptor again.
            fire(&inner, id, &callback, readiness);
        }
        WatcherKind::Timer { after, every } => {
            tokio::time::sleep(after).await;
            loop {
                fire(&inner, id, &callback, Ok(()));
                let Some(period) = every else {
                    break;
                };
                tokio::time::sleep(period).await;
            }
            if every.is_none() {
                if let Some(inner) = inner.upgrade() {
                    EventLoop { inner }.forget_watcher(id);
                }
            }
        }
        WatcherKind::Signal(sig) => {
            let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
                Ok(stream) => stream,
                Err(e) => {
                    fire(&inner, id, &callback, Err(e));
                    return;
                }
            };
            while stream.recv().await.is_some() {
                debug!(watcher = %id, signal = sig.as_str(), "Signal received");
                fire(&inner, id, &callback, Ok(()));
            }
        }
    }
}

async fn wait_readable(fd: RawFd) -> io::Result<()> {
    let async_fd = AsyncFd::with_interest(fd, Interest::READABLE)?;
    let guard = async_fd.readable().await?;
    drop(guard);
    Ok(())
}
