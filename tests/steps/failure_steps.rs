//! Behavioural test steps for the failure strategy.
//!
//! These steps reproduce the retry table: a failed job is released with a
//! delay growing linearly per attempt and buried on the last attempt of
//! each cycle.

use std::sync::Arc;
use std::time::Duration;

use cucumber::{World, given, then, when};
use qmand::config::Config;
use qmand::failure::{FailureStrategy, GenericJobFailureStrategy};
use qmand::job::Job;
use test_support::{FakeJob, JobOp, Outcome, ScriptedCommand};

#[derive(Debug, Default, World)]
pub struct FailureWorld {
    config: Option<Config>,
    ops: Vec<JobOp>,
}

#[given(regex = r"^a failure strategy allowing (\d+) tries with a base delay of (\d+) seconds$")]
#[expect(clippy::expect_used, reason = "simplify test failure output")]
fn failure_strategy(world: &mut FailureWorld, tries: u32, delay: u64) {
    let mut config = Config::default();
    config
        .set_max_tries(tries)
        .and_then(|c| c.set_base_failure_delay(Duration::from_secs(delay)))
        .expect("fresh configuration is unlocked");
    world.config = Some(config);
}

#[expect(clippy::expect_used, reason = "simplify test failure output")]
fn fail_job(world: &mut FailureWorld, reserves: u32, priority: u32) {
    let config = world
        .config
        .clone()
        .expect("world.config should be set by a given step");
    let strategy = GenericJobFailureStrategy::new(Arc::new(config));
    let fake = FakeJob::new(1, b"payload".to_vec())
        .with_reserves(reserves)
        .with_priority(priority);
    let job = Job::from_reserved(fake.reserved(), Box::new(ScriptedCommand::new(Outcome::Fail)));
    strategy
        .handle_failed_job(job)
        .expect("strategy retires the job");
    world.ops = fake.ops();
}

#[when(regex = r"^a job reserved (\d+) times fails$")]
fn job_fails(world: &mut FailureWorld, reserves: u32) {
    fail_job(world, reserves, 1024);
}

#[when(regex = r"^a job reserved (\d+) times at priority (\d+) fails$")]
fn job_fails_at_priority(world: &mut FailureWorld, reserves: u32, priority: u32) {
    fail_job(world, reserves, priority);
}

fn retirement(world: &FailureWorld) -> Option<&JobOp> {
    world.ops.iter().find(|op| !matches!(op, JobOp::Stats))
}

#[then(regex = r"^the job is released after (\d+) seconds$")]
fn job_released(world: &mut FailureWorld, seconds: u64) {
    match retirement(world) {
        Some(JobOp::Release { delay, .. }) => assert_eq!(*delay, Duration::from_secs(seconds)),
        other => panic!("expected a release, got {other:?}"),
    }
}

#[then("the job is buried")]
fn job_buried(world: &mut FailureWorld) {
    match retirement(world) {
        Some(JobOp::Bury { .. }) => {}
        other => panic!("expected a bury, got {other:?}"),
    }
}

#[then(regex = r"^the job keeps priority (\d+)$")]
fn job_keeps_priority(world: &mut FailureWorld, expected: u32) {
    let priority = match retirement(world) {
        Some(JobOp::Release { priority, .. } | JobOp::Bury { priority }) => *priority,
        other => panic!("expected a retirement, got {other:?}"),
    };
    assert_eq!(priority, expected);
}
