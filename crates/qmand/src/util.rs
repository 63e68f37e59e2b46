//! Internal utilities shared by worker components.
//!
//! Every callback the worker runs on behalf of user code goes through
//! [`guarded`], so a panic is reported and contained instead of tearing the
//! event loop down. The fatal-error hook consults [`in_guarded_section`] to
//! tell contained panics from fatal ones.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        GUARD_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Whether the current thread is running inside [`guarded`].
pub fn in_guarded_section() -> bool {
    GUARD_DEPTH.with(|d| d.get() > 0)
}

/// Run `f`, converting a panic into `Err` with the panic message.
pub fn guarded<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    let _depth = DepthGuard::enter();
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
