//! Single-threaded reactor driving the worker.
//!
//! The loop multiplexes three kinds of event sources: readable sockets (one
//! pending reserve per queue connection), timers (break-condition checks and
//! reconnection attempts) and process signals. Each registered [`Watcher`]
//! runs as a task on a [`LocalSet`] owned by the loop; removing the watcher
//! aborts its task. Callbacks run one at a time on the loop's thread.
//!
//! Callbacks and tasks only hold a weak reference to the loop's state, so
//! dropping the last [`EventLoop`] handle tears every watcher down.

mod watcher;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use qman_lib::{ClientError, PendingReserve, QueueConnection, ReservedJob};
use tokio::sync::watch;
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, error, info, warn};

use crate::process::{SignalMask, SignalMaskGuard, ThreadSignalMask};
use crate::util::guarded;

pub use watcher::{Watcher, WatcherCallback, WatcherId, WatcherKind};

/// Interval between break-condition checks unless configured otherwise.
pub const DEFAULT_BREAK_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// A queue connection shared between the worker and the loop's watchers.
pub type SharedConnection = Rc<RefCell<dyn QueueConnection>>;

/// Predicate evaluated on every break-condition check; `true` stops the loop.
pub type BreakCondition = Rc<dyn Fn() -> bool>;

/// Receives jobs and listener removals from the loop.
pub trait JobListener {
    /// A job was reserved on `connection`.
    ///
    /// Runs with the loop's termination signals blocked.
    fn job_received(&self, event_loop: &EventLoop, connection: &SharedConnection, job: ReservedJob);

    /// The listener for `connection` was dropped because the connection was
    /// lost. `listener` is the listener to re-register once reconnected.
    fn listener_removed(
        &self,
        event_loop: &EventLoop,
        connection: SharedConnection,
        listener: Rc<dyn JobListener>,
    );
}

/// How long [`EventLoop::run`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Until [`EventLoop::stop`] is called or a [`StopHandle`] fires.
    #[default]
    UntilStopped,
    /// A single pass over whatever is ready.
    Once,
}

/// Thread-safe handle requesting the loop to stop.
///
/// The loop completes the stop, removing every watcher, once it next gets to
/// run.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

struct Registered {
    id: WatcherId,
    kind: WatcherKind,
    task: JoinHandle<()>,
}

pub(crate) struct LoopInner {
    local: LocalSet,
    watchers: RefCell<Vec<Registered>>,
    next_id: Cell<u64>,
    break_conditions: RefCell<Vec<(String, BreakCondition)>>,
    break_timer: Cell<Option<WatcherId>>,
    break_interval: Cell<Duration>,
    termination_signals: RefCell<Vec<Signal>>,
    signal_mask: Box<dyn SignalMask>,
    stop_tx: Arc<watch::Sender<bool>>,
    stopping: Cell<bool>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        for watcher in self.watchers.get_mut().drain(..) {
            watcher.task.abort();
        }
    }
}

/// Handle to the reactor. Clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("watchers", &self.watchers())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_signal_mask(Box::new(ThreadSignalMask))
    }

    /// Create a loop that blocks termination signals through `mask`.
    pub fn with_signal_mask(mask: Box<dyn SignalMask>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Rc::new(LoopInner {
                local: LocalSet::new(),
                watchers: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
                break_conditions: RefCell::new(Vec::new()),
                break_timer: Cell::new(None),
                break_interval: Cell::new(DEFAULT_BREAK_CHECK_INTERVAL),
                termination_signals: RefCell::new(Vec::new()),
                signal_mask: mask,
                stop_tx: Arc::new(stop_tx),
                stopping: Cell::new(false),
            }),
        }
    }

    /// Interval of the shared break-condition timer.
    ///
    /// Only affects a timer created after the call.
    pub fn set_break_check_interval(&self, interval: Duration) {
        self.inner.break_interval.set(interval);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.inner.stop_tx))
    }

    /// Add `watcher` to the active set and start it.
    pub fn register_watcher(&self, watcher: Watcher) -> WatcherId {
        let id = WatcherId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        let kind = watcher.kind();
        let task = self
            .inner
            .local
            .spawn_local(watcher::drive(id, watcher, Rc::downgrade(&self.inner)));
        self.inner
            .watchers
            .borrow_mut()
            .push(Registered { id, kind, task });
        debug!(watcher = %id, kind = ?kind, "Registered watcher");
        id
    }

    /// Stop `id` and remove it from the active set.
    ///
    /// Returns `false` if the watcher was not registered.
    pub fn remove_watcher(&self, id: WatcherId) -> bool {
        let removed = self.take_watcher(id);
        match removed {
            Some(watcher) => {
                watcher.task.abort();
                debug!(watcher = %id, "Removed watcher");
                true
            }
            None => false,
        }
    }

    /// Drop the bookkeeping for a watcher whose task has finished by itself.
    fn forget_watcher(&self, id: WatcherId) {
        drop(self.take_watcher(id));
    }

    fn take_watcher(&self, id: WatcherId) -> Option<Registered> {
        let mut watchers = self.inner.watchers.borrow_mut();
        let index = watchers.iter().position(|w| w.id == id)?;
        Some(watchers.remove(index))
    }

    pub fn contains_watcher(&self, id: WatcherId) -> bool {
        self.inner.watchers.borrow().iter().any(|w| w.id == id)
    }

    /// Active watchers in registration order.
    pub fn watchers(&self) -> Vec<(WatcherId, WatcherKind)> {
        self.inner
            .watchers
            .borrow()
            .iter()
            .map(|w| (w.id, w.kind))
            .collect()
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.borrow().len()
    }

    /// Signals blocked while a job is being received.
    pub fn termination_signals(&self) -> Vec<Signal> {
        self.inner.termination_signals.borrow().clone()
    }

    /// Arm a listener on `connection`: issue a reserve and watch its socket.
    ///
    /// Returns `None` if the reserve could not be issued; a lost connection
    /// is then handed to [`JobListener::listener_removed`].
    pub fn register_job_listener(
        &self,
        connection: SharedConnection,
        listener: Rc<dyn JobListener>,
    ) -> Option<WatcherId> {
        let name = connection.borrow().name().to_owned();
        let reserve = connection.borrow_mut().reserve_handle();
        let pending = match reserve {
            Ok(pending) => pending,
            Err(e) => {
                self.drop_listener(&name, &connection, &listener, &e);
                return None;
            }
        };
        let fd = pending.socket();
        let slot = RefCell::new(Some(pending));
        let watcher = Watcher::readable(fd, move |event_loop, id, readiness| {
            let Some(pending) = slot.borrow_mut().take() else {
                return;
            };
            event_loop.handle_incoming_job(id, &connection, &listener, pending, readiness);
        });
        let id = self.register_watcher(watcher);
        debug!(connection = %name, watcher = %id, "Registered job listener");
        Some(id)
    }

    fn handle_incoming_job(
        &self,
        id: WatcherId,
        connection: &SharedConnection,
        listener: &Rc<dyn JobListener>,
        pending: Box<dyn PendingReserve>,
        readiness: io::Result<()>,
    ) {
        let name = connection.borrow().name().to_owned();
        debug!(connection = %name, watcher = %id, "Incoming job");
        let received = readiness.map_err(ClientError::from).and_then(|()| {
            let signals = self.termination_signals();
            let _blocked = SignalMaskGuard::block(self.inner.signal_mask.as_ref(), &signals);
            let job = pending.invoke()?;
            if let Err(panic) = guarded(|| listener.job_received(self, connection, job)) {
                error!(connection = %name, panic = %panic, "Job handler panicked");
            }
            Ok(())
        });

        self.remove_watcher(id);
        if let Err(e) = received {
            self.drop_listener(&name, connection, listener, &e);
            return;
        }
        if self.is_stopped() {
            debug!(connection = %name, "Loop stopped; not re-arming job listener");
            return;
        }
        self.register_job_listener(Rc::clone(connection), Rc::clone(listener));
    }

    fn drop_listener(
        &self,
        name: &str,
        connection: &SharedConnection,
        listener: &Rc<dyn JobListener>,
        cause: &ClientError,
    ) {
        if cause.is_connection_lost() {
            error!(connection = %name, error = %cause, "Connection lost while receiving job");
            self.remove_job_listener(connection, listener);
        } else {
            error!(connection = %name, error = %cause, "Failed to receive job; dropping listener");
        }
    }

    /// Disconnect `connection` and notify `listener` that it was removed.
    pub fn remove_job_listener(&self, connection: &SharedConnection, listener: &Rc<dyn JobListener>) {
        warn!(connection = %connection.borrow().name(), "Removing job listener");
        connection.borrow_mut().disconnect();
        if let Err(panic) = guarded(|| {
            listener.listener_removed(self, Rc::clone(connection), Rc::clone(listener));
        }) {
            error!(panic = %panic, "Listener removal handler panicked");
        }
    }

    /// Try to reconnect `connection` after `after`, then every `every` until
    /// it succeeds, and re-register `listener` on success.
    pub fn schedule_reconnection(
        &self,
        after: Duration,
        every: Duration,
        connection: SharedConnection,
        listener: Rc<dyn JobListener>,
    ) -> WatcherId {
        let id = self.register_watcher(Watcher::timer(
            after,
            Some(every),
            move |event_loop, id, _| {
                let name = connection.borrow().name().to_owned();
                info!(connection = %name, "Trying to reconnect");
                let reconnected = connection.borrow_mut().reconnect();
                match reconnected {
                    Ok(()) => {
                        info!(connection = %name, "Reconnected");
                        event_loop.remove_watcher(id);
                        event_loop.register_job_listener(Rc::clone(&connection), Rc::clone(&listener));
                    }
                    Err(e) => {
                        warn!(connection = %name, error = %e, "Reconnect failed; retrying");
                    }
                }
            },
        ));
        info!(watcher = %id, after = ?after, every = ?every, "Scheduled reconnection");
        id
    }

    /// Add or replace the named condition checked by the shared break timer.
    ///
    /// The timer is created with the first condition and shared by all later
    /// ones.
    pub fn register_break_condition(&self, name: &str, condition: impl Fn() -> bool + 'static) {
        {
            let mut conditions = self.inner.break_conditions.borrow_mut();
            let condition: BreakCondition = Rc::new(condition);
            match conditions.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = condition,
                None => conditions.push((name.to_owned(), condition)),
            }
        }
        let timer_alive = self
            .inner
            .break_timer
            .get()
            .is_some_and(|id| self.contains_watcher(id));
        if !timer_alive {
            let interval = self.inner.break_interval.get();
            let id = self.register_watcher(Watcher::timer(interval, Some(interval), |event_loop, _, _| {
                event_loop.check_break_conditions();
            }));
            self.inner.break_timer.set(Some(id));
        }
        debug!(condition = name, "Registered break condition");
    }

    /// Names of registered break conditions in evaluation order.
    pub fn break_conditions(&self) -> Vec<String> {
        self.inner
            .break_conditions
            .borrow()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Evaluate every break condition in order, stopping the loop for each
    /// one that holds. Returns whether any held.
    pub fn check_break_conditions(&self) -> bool {
        let conditions = self.inner.break_conditions.borrow().clone();
        let mut triggered = false;
        for (name, condition) in &conditions {
            let holds = guarded(|| condition()).unwrap_or_else(|panic| {
                error!(condition = %name, panic = %panic, "Break condition panicked");
                false
            });
            if holds {
                info!(condition = %name, "Noticed breaking condition");
                triggered = true;
                self.stop();
            }
        }
        debug!("Checked all break conditions");
        triggered
    }

    /// Stop the loop when `signal` is delivered.
    ///
    /// The signal is also blocked while jobs are being received.
    pub fn register_break_signal(&self, signal: Signal) -> WatcherId {
        {
            let mut signals = self.inner.termination_signals.borrow_mut();
            if !signals.contains(&signal) {
                signals.push(signal);
            }
        }
        self.register_watcher(Watcher::signal(signal, move |event_loop, _, delivered| {
            match delivered {
                Ok(()) => info!(signal = signal.as_str(), "Received breaking signal"),
                Err(e) => error!(
                    signal = signal.as_str(),
                    error = %e,
                    "Failed to install signal handler; stopping"
                ),
            }
            event_loop.stop();
        }))
    }

    /// Run the loop.
    ///
    /// Returns immediately if the loop has already been stopped.
    pub async fn run(&self, mode: RunMode) {
        info!(mode = ?mode, "Starting event loop");
        match mode {
            RunMode::UntilStopped => {
                let mut stopped = self.inner.stop_tx.subscribe();
                self.inner
                    .local
                    .run_until(async move {
                        // The sender lives as long as the loop.
                        let _ = stopped.wait_for(|stopped| *stopped).await;
                    })
                    .await;
            }
            RunMode::Once => {
                self.inner.local.run_until(tokio::task::yield_now()).await;
            }
        }
        if self.is_stopped() {
            self.stop();
        }
        info!("Broke out of event loop");
    }

    /// Drive the loop's watchers until `future` completes.
    pub async fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.inner.local.run_until(future).await
    }

    /// Stop every watcher, clear the active set and make [`EventLoop::run`]
    /// return. Calling it again is a no-op.
    pub fn stop(&self) {
        let drained: Vec<Registered> = self.inner.watchers.borrow_mut().drain(..).collect();
        for watcher in &drained {
            watcher.task.abort();
        }
        self.inner.break_timer.set(None);
        if !self.inner.stopping.replace(true) {
            info!(removed = drained.len(), "Stopping event loop");
        }
        self.inner.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }
}
