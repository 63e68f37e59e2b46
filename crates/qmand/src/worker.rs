//! Worker lifecycle: wiring queue connections to the event loop.
//!
//! A [`Worker`] arms one job listener per connection, registers the
//! lifetime and memory break conditions plus the configured termination
//! signals, and then runs the loop until something stops it. Every job is
//! decoded, executed and retired by [`JobDispatch`]; failed jobs go to the
//! [`FailureStrategy`]. When the loop returns, every connection is quit.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qman_lib::{ClientError, CommandSerializer, ReservedJob};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::event_loop::{EventLoop, JobListener, RunMode, SharedConnection, StopHandle};
use crate::failure::{FailureDecision, FailureError, FailureStrategy, GenericJobFailureStrategy};
use crate::job::Job;
use crate::process::{Clock, ProcessStats, StatsError, SysinfoStats, SystemClock};
use crate::util::{guarded, in_guarded_section};

/// Break condition stopping the worker once its lifetime is used up.
pub const TIME_TO_LIVE: &str = "timeToLive";
/// Break condition stopping the worker once it holds too much memory.
pub const MAXIMAL_MEMORY_USAGE: &str = "maximalMemoryUsage";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("a worker needs at least one queue connection")]
    NoConnections,
    #[error("cannot inspect the worker process: {0}")]
    Stats(#[from] StatsError),
    #[error("cannot delete job {job}: {source}")]
    Delete {
        job: u64,
        #[source]
        source: ClientError,
    },
    #[error("cannot bury undecodable job {job}: {source}")]
    Bury {
        job: u64,
        #[source]
        source: ClientError,
    },
    /// The failure strategy could not retire a job. Fatal.
    #[error(transparent)]
    Failure(#[from] FailureError),
}

/// How a received job was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Deleted,
    Failed(FailureDecision),
    /// The payload could not be decoded; the job was buried at `priority`.
    Undecodable { priority: u32 },
}

/// Decodes, executes and retires jobs handed over by the event loop.
pub struct JobDispatch {
    config: Arc<Config>,
    serializer: CommandSerializer,
    strategy: Box<dyn FailureStrategy>,
}

impl JobDispatch {
    pub fn new(
        config: Arc<Config>,
        serializer: CommandSerializer,
        strategy: Box<dyn FailureStrategy>,
    ) -> Self {
        Self {
            config,
            serializer,
            strategy,
        }
    }

    /// Run one reserved job to completion.
    ///
    /// A command that returns `false`, returns an error or panics has failed
    /// and is handed to the failure strategy. A payload that cannot be
    /// decoded is buried straight away.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkerError`] if the job could not be retired.
    pub fn handle_job(&self, reserved: ReservedJob) -> Result<JobOutcome, WorkerError> {
        let id = reserved.id();
        let command = match self.serializer.unserialize(&reserved.payload) {
            Ok(command) => command,
            Err(e) => {
                error!(job = id, error = %e, "Cannot decode job payload; burying");
                let priority = reserved
                    .handle
                    .stats()
                    .map(|stats| stats.priority)
                    .unwrap_or_else(|stats_err| {
                        warn!(job = id, error = %stats_err, "Cannot read job priority");
                        self.config.default_priority()
                    });
                reserved
                    .handle
                    .bury(priority)
                    .map_err(|source| WorkerError::Bury { job: id, source })?;
                return Ok(JobOutcome::Undecodable { priority });
            }
        };

        let mut job = Job::from_reserved(reserved, command);
        debug!(job = id, command = job.command().command_type(), "Executing job");
        let succeeded = match guarded(|| job.execute()) {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                warn!(job = id, "Job reported failure");
                false
            }
            Ok(Err(e)) => {
                warn!(job = id, error = %e, "Job returned an error");
                false
            }
            Err(panic) => {
                error!(job = id, panic = %panic, "Job panicked");
                false
            }
        };

        if succeeded {
            job.delete()
                .map_err(|source| WorkerError::Delete { job: id, source })?;
            info!(job = id, "Job done");
            return Ok(JobOutcome::Deleted);
        }
        let decision = self.strategy.handle_failed_job(job)?;
        Ok(JobOutcome::Failed(decision))
    }
}

impl JobListener for JobDispatch {
    fn job_received(&self, event_loop: &EventLoop, connection: &SharedConnection, job: ReservedJob) {
        let name = connection.borrow().name().to_owned();
        match self.handle_job(job) {
            Ok(outcome) => debug!(connection = %name, outcome = ?outcome, "Handled job"),
            Err(WorkerError::Failure(e)) => {
                error!(connection = %name, error = %e, "Failure strategy could not retire job; stopping");
                event_loop.stop();
            }
            Err(e) => error!(connection = %name, error = %e, "Failed to retire job"),
        }
    }

    fn listener_removed(
        &self,
        event_loop: &EventLoop,
        connection: SharedConnection,
        listener: Rc<dyn JobListener>,
    ) {
        event_loop.schedule_reconnection(
            self.config.reconnect_after(),
            self.config.reconnect_every(),
            connection,
            listener,
        );
    }
}

/// Lifetime and memory ceilings, evaluated as break conditions.
struct Limits {
    clock: Box<dyn Clock>,
    stats: Box<dyn ProcessStats>,
    started: Cell<Option<Instant>>,
    max_lifetime: Duration,
    max_memory_bytes: u64,
}

impl Limits {
    fn start(&self) {
        self.started.set(Some(self.clock.now()));
    }

    fn time_to_live_exceeded(&self) -> bool {
        let Some(started) = self.started.get() else {
            return false;
        };
        self.clock.now().saturating_duration_since(started) >= self.max_lifetime
    }

    fn memory_exceeded(&self) -> bool {
        match self.stats.resident_memory() {
            Ok(bytes) => bytes >= self.max_memory_bytes,
            Err(e) => {
                warn!(error = %e, "Cannot read resident memory");
                false
            }
        }
    }
}

/// Runs jobs from a set of queue connections until a break condition,
/// termination signal or stop request ends the loop.
pub struct Worker {
    config: Arc<Config>,
    event_loop: EventLoop,
    connections: Vec<SharedConnection>,
    dispatch: Rc<JobDispatch>,
    limits: Rc<Limits>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("connections", &self.connections.len())
            .field("event_loop", &self.event_loop)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.event_loop.stop_handle()
    }

    /// Whether the worker has been alive for its whole lifetime.
    ///
    /// Always `false` before [`Worker::run`] starts.
    pub fn check_time_to_live(&self) -> bool {
        self.limits.time_to_live_exceeded()
    }

    /// Whether resident memory reached the configured ceiling.
    pub fn check_maximal_memory_usage(&self) -> bool {
        self.limits.memory_exceeded()
    }

    /// Run until the loop stops, then quit every connection.
    pub async fn run(&self) {
        self.limits.start();
        info!(connections = self.connections.len(), "Starting worker");

        let interval = self.config.break_check_interval();
        if !interval.is_zero() {
            self.event_loop.set_break_check_interval(interval);
        }

        let queues = self.config.watched_queues();
        for connection in &self.connections {
            if !queues.is_empty() {
                let watched = connection.borrow_mut().watch_queues(queues);
                if let Err(e) = watched {
                    error!(
                        connection = %connection.borrow().name(),
                        error = %e,
                        "Failed to watch queues"
                    );
                }
            }
            let listener: Rc<dyn JobListener> = self.dispatch.clone();
            self.event_loop
                .register_job_listener(Rc::clone(connection), listener);
        }

        let limits = Rc::clone(&self.limits);
        self.event_loop
            .register_break_condition(TIME_TO_LIVE, move || limits.time_to_live_exceeded());
        let limits = Rc::clone(&self.limits);
        self.event_loop
            .register_break_condition(MAXIMAL_MEMORY_USAGE, move || limits.memory_exceeded());
        for signal in self.config.termination_signals() {
            self.event_loop.register_break_signal(*signal);
        }

        self.event_loop.run(RunMode::UntilStopped).await;
        self.shutdown();
    }

    fn shutdown(&self) {
        for connection in &self.connections {
            let mut connection = connection.borrow_mut();
            match connection.quit() {
                Ok(()) => debug!(connection = %connection.name(), "Connection closed"),
                Err(e) => error!(
                    connection = %connection.name(),
                    error = %e,
                    "Failed to quit connection"
                ),
            }
        }
        info!("Worker stopped");
    }
}

/// Assembles a [`Worker`], filling in production defaults.
#[derive(Default)]
pub struct WorkerBuilder {
    config: Option<Config>,
    event_loop: Option<EventLoop>,
    serializer: Option<CommandSerializer>,
    failure_strategy: Option<Box<dyn FailureStrategy>>,
    clock: Option<Box<dyn Clock>>,
    process_stats: Option<Box<dyn ProcessStats>>,
}

impl WorkerBuilder {
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn with_event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: CommandSerializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    #[must_use]
    pub fn with_failure_strategy(mut self, strategy: Box<dyn FailureStrategy>) -> Self {
        self.failure_strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_process_stats(mut self, stats: Box<dyn ProcessStats>) -> Self {
        self.process_stats = Some(stats);
        self
    }

    /// Lock the configuration and build a worker over `connections`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NoConnections`] for an empty list and
    /// [`WorkerError::Stats`] if the default memory probe cannot find the
    /// current process.
    pub fn build(self, connections: Vec<SharedConnection>) -> Result<Worker, WorkerError> {
        if connections.is_empty() {
            return Err(WorkerError::NoConnections);
        }
        let mut config = self.config.unwrap_or_default();
        config.lock();
        let config = Arc::new(config);

        let stats = match self.process_stats {
            Some(stats) => stats,
            None => Box::new(SysinfoStats::new()?),
        };
        let limits = Rc::new(Limits {
            clock: self.clock.unwrap_or_else(|| Box::new(SystemClock)),
            stats,
            started: Cell::new(None),
            max_lifetime: config.max_lifetime(),
            max_memory_bytes: config.max_memory_bytes(),
        });
        let strategy = self
            .failure_strategy
            .unwrap_or_else(|| Box::new(GenericJobFailureStrategy::new(Arc::clone(&config))));
        let dispatch = Rc::new(JobDispatch::new(
            Arc::clone(&config),
            self.serializer.unwrap_or_default(),
            strategy,
        ));

        Ok(Worker {
            config,
            event_loop: self.event_loop.unwrap_or_default(),
            connections,
            dispatch,
            limits,
        })
    }
}

/// Stop the worker when a panic escapes to the top of a thread.
///
/// Panics raised inside a guarded callback are contained by the event loop
/// and do not stop it. The previously installed hook still runs.
pub fn install_fatal_error_hook(stop: StopHandle) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if !in_guarded_section() {
            error!(panic = %info, "Stopping worker because fatal error occurred");
            stop.stop();
        }
        previous(info);
    }));
}
