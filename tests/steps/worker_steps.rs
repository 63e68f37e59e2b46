//! Behavioural test steps for the worker.
//!
//! A dispatcher is built around a counting failure strategy so the
//! scenarios can check which jobs were deleted and which were handed on.
//! The memory scenarios use a fixed memory probe instead of the real
//! process.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use cucumber::{World, given, then, when};
use qmand::config::Config;
use qmand::event_loop::SharedConnection;
use qmand::failure::{FailureDecision, FailureError, FailureStrategy, GenericJobFailureStrategy};
use qmand::job::Job;
use qmand::process::testing::FixedStats;
use qmand::worker::{JobDispatch, Worker};
use test_support::{FakeConnection, FakeJob, JobOp, Outcome, scripted_payload, scripted_serializer};

#[derive(Debug, Default, World)]
pub struct WorkerWorld {
    config: Option<Config>,
    ops: Vec<JobOp>,
    strategy_calls: usize,
    wants_stop: Option<bool>,
}

/// Counts calls before delegating to the generic strategy.
struct CountingStrategy {
    inner: GenericJobFailureStrategy,
    calls: Rc<Cell<usize>>,
}

impl FailureStrategy for CountingStrategy {
    fn handle_failed_job(&self, job: Job) -> Result<FailureDecision, FailureError> {
        self.calls.set(self.calls.get() + 1);
        self.inner.handle_failed_job(job)
    }
}

#[given("a worker dispatcher")]
fn worker_dispatcher(world: &mut WorkerWorld) {
    world.config = Some(Config::default());
}

#[expect(clippy::expect_used, reason = "simplify test failure output")]
fn handle(world: &mut WorkerWorld, payload: Vec<u8>) {
    let config = Arc::new(
        world
            .config
            .clone()
            .expect("world.config should be set by a given step"),
    );
    let calls = Rc::new(Cell::new(0));
    let strategy = CountingStrategy {
        inner: GenericJobFailureStrategy::new(Arc::clone(&config)),
        calls: Rc::clone(&calls),
    };
    let dispatch = JobDispatch::new(config, scripted_serializer(), Box::new(strategy));
    let fake = FakeJob::new(1, payload);
    dispatch
        .handle_job(fake.reserved())
        .expect("job is retired");
    world.ops = fake.ops();
    world.strategy_calls = calls.get();
}

#[when(regex = r"^a job whose command (succeeds|fails|returns errors|panics) is handled$")]
fn job_handled(world: &mut WorkerWorld, behaviour: String) {
    let outcome = match behaviour.as_str() {
        "succeeds" => Outcome::Succeed,
        "fails" => Outcome::Fail,
        "returns errors" => Outcome::Error,
        _ => Outcome::Panic,
    };
    handle(world, scripted_payload(outcome));
}

#[when("a job with an undecodable payload is handled")]
fn undecodable_job_handled(world: &mut WorkerWorld) {
    handle(world, b"{\"type\":".to_vec());
}

#[then("the job is deleted")]
fn job_deleted(world: &mut WorkerWorld) {
    assert_eq!(world.ops, vec![JobOp::Delete]);
}

#[then("the job is not deleted")]
fn job_not_deleted(world: &mut WorkerWorld) {
    assert!(!world.ops.contains(&JobOp::Delete));
}

#[then(regex = r"^the job is buried at priority (\d+)$")]
fn job_buried(world: &mut WorkerWorld, priority: u32) {
    assert_eq!(world.ops.last(), Some(&JobOp::Bury { priority }));
}

#[then("the failure strategy is not consulted")]
fn strategy_not_consulted(world: &mut WorkerWorld) {
    assert_eq!(world.strategy_calls, 0);
}

#[then("the failure strategy handles the job once")]
fn strategy_consulted_once(world: &mut WorkerWorld) {
    assert_eq!(world.strategy_calls, 1);
}

#[given(regex = r"^a worker limited to (\d+) bytes of memory$")]
#[expect(clippy::expect_used, reason = "simplify test failure output")]
fn worker_with_memory_limit(world: &mut WorkerWorld, bytes: u64) {
    let mut config = Config::default();
    config
        .set_max_memory_bytes(bytes)
        .expect("fresh configuration is unlocked");
    world.config = Some(config);
}

#[when(regex = r"^the worker holds (\d+) bytes$")]
#[expect(clippy::expect_used, reason = "simplify test failure output")]
fn worker_holds(world: &mut WorkerWorld, bytes: u64) {
    let config = world
        .config
        .clone()
        .expect("world.config should be set by a given step");
    let (connection, _remote) = FakeConnection::new("scenario").expect("socket pair");
    let connection: SharedConnection = Rc::new(RefCell::new(connection));
    let worker = Worker::builder()
        .with_config(config)
        .with_process_stats(Box::new(FixedStats::new(bytes)))
        .build(vec![connection])
        .expect("worker builds");
    world.wants_stop = Some(worker.check_maximal_memory_usage());
}

#[then("the worker asks to stop")]
fn worker_asks_to_stop(world: &mut WorkerWorld) {
    assert_eq!(world.wants_stop, Some(true));
}

#[then("the worker keeps running")]
fn worker_keeps_running(world: &mut WorkerWorld) {
    assert_eq!(world.wants_stop, Some(false));
}
