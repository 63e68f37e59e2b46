mod steps;
use cucumber::World as _;
use steps::{FailureWorld, WorkerWorld};

#[tokio::main]
async fn main() {
    FailureWorld::run("tests/features/failure_policy.feature").await;
    WorkerWorld::run("tests/features/worker.feature").await;
}
