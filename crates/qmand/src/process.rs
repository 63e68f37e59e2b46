//! Process-level capabilities the worker depends on.
//!
//! The worker reads the clock, samples its own resident memory and blocks
//! termination signals around job receipt. Each concern sits behind a small
//! trait so tests can substitute deterministic fakes.

use std::cell::RefCell;
use std::time::Instant;

use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;

/// Source of monotonic time.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("cannot determine current process id: {0}")]
    Pid(&'static str),
    #[error("process {0} not found")]
    ProcessNotFound(Pid),
}

/// Memory statistics for the current process.
pub trait ProcessStats {
    /// Resident memory in bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`StatsError`] if the process could not be inspected.
    fn resident_memory(&self) -> Result<u64, StatsError>;
}

/// [`ProcessStats`] backed by `sysinfo`.
pub struct SysinfoStats {
    pid: Pid,
    system: RefCell<System>,
}

impl SysinfoStats {
    /// # Errors
    ///
    /// Returns [`StatsError::Pid`] if the platform cannot report the
    /// current process id.
    pub fn new() -> Result<Self, StatsError> {
        let pid = sysinfo::get_current_pid().map_err(StatsError::Pid)?;
        Ok(Self {
            pid,
            system: RefCell::new(System::new()),
        })
    }
}

impl ProcessStats for SysinfoStats {
    fn resident_memory(&self) -> Result<u64, StatsError> {
        let mut system = self.system.borrow_mut();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        system
            .process(self.pid)
            .map(sysinfo::Process::memory)
            .ok_or(StatsError::ProcessNotFound(self.pid))
    }
}

/// Blocks and unblocks signal delivery to the calling thread.
pub trait SignalMask {
    /// # Errors
    ///
    /// Returns the OS error if the mask could not be changed.
    fn block(&self, signals: &[Signal]) -> nix::Result<()>;

    /// # Errors
    ///
    /// Returns the OS error if the mask could not be changed.
    fn unblock(&self, signals: &[Signal]) -> nix::Result<()>;
}

/// [`SignalMask`] using `pthread_sigmask` on the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSignalMask;

fn sig_set(signals: &[Signal]) -> SigSet {
    let mut set = SigSet::empty();
    for signal in signals {
        set.add(*signal);
    }
    set
}

impl SignalMask for ThreadSignalMask {
    fn block(&self, signals: &[Signal]) -> nix::Result<()> {
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sig_set(signals)), None)
    }

    fn unblock(&self, signals: &[Signal]) -> nix::Result<()> {
        pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&sig_set(signals)), None)
    }
}

/// Keeps `signals` blocked until dropped.
///
/// Signals raised while the guard is alive stay pending and are delivered
/// when it is dropped, so a termination request never interrupts the
/// hand-over of a reserved job.
pub struct SignalMaskGuard<'a> {
    mask: &'a dyn SignalMask,
    signals: Vec<Signal>,
}

impl<'a> SignalMaskGuard<'a> {
    pub fn block(mask: &'a dyn SignalMask, signals: &[Signal]) -> Self {
        if !signals.is_empty() {
            if let Err(e) = mask.block(signals) {
                tracing::warn!(error = %e, "Failed to block termination signals");
            }
        }
        Self {
            mask,
            signals: signals.to_vec(),
        }
    }
}

impl Drop for SignalMaskGuard<'_> {
    fn drop(&mut self) {
        if self.signals.is_empty() {
            return;
        }
        if let Err(e) = self.mask.unblock(&self.signals) {
            tracing::warn!(error = %e, "Failed to unblock termination signals");
        }
    }
}


/// Deterministic stand-ins for the process capabilities.
#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod testing {
    use super::{Clock, ProcessStats, SignalMask, StatsError};
    use nix::sys::signal::Signal;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    /// A clock that only moves when told to. Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        now: Rc<Cell<Instant>>,
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self {
                now: Rc::new(Cell::new(Instant::now())),
            }
        }
    }

    impl ManualClock {
        pub fn advance(&self, by: Duration) {
            self.now.set(self.now.get() + by);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.now.get()
        }
    }

    /// Reports whatever resident memory it was last given.
    #[derive(Debug, Clone, Default)]
    pub struct FixedStats {
        bytes: Rc<Cell<u64>>,
    }

    impl FixedStats {
        pub fn new(bytes: u64) -> Self {
            Self {
                bytes: Rc::new(Cell::new(bytes)),
            }
        }

        pub fn set(&self, bytes: u64) {
            self.bytes.set(bytes);
        }
    }

    impl ProcessStats for FixedStats {
        fn resident_memory(&self) -> Result<u64, StatsError> {
            Ok(self.bytes.get())
        }
    }

    /// Whether a [`RecordingMask`] call blocked or unblocked signals.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MaskChange {
        Block,
        Unblock,
    }

    /// Records mask changes instead of touching the thread's signal mask.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingMask {
        calls: Rc<RefCell<Vec<(MaskChange, Vec<Signal>)>>>,
    }

    impl RecordingMask {
        pub fn calls(&self) -> Vec<(MaskChange, Vec<Signal>)> {
            self.calls.borrow().clone()
        }
    }

    impl SignalMask for RecordingMask {
        fn block(&self, signals: &[Signal]) -> nix::Result<()> {
            self.calls
                .borrow_mut()
                .push((MaskChange::Block, signals.to_vec()));
            Ok(())
        }

        fn unblock(&self, signals: &[Signal]) -> nix::Result<()> {
            self.calls
                .borrow_mut()
                .push((MaskChange::Unblock, signals.to_vec()));
            Ok(())
        }
    }
}
