//! A reserved queue item paired with its decoded command.

use std::fmt;
use std::time::Duration;

use qman_lib::{ClientError, Command, JobHandle, JobStats, ReservedJob};

/// One unit of work taken from the queue.
///
/// The retire operations consume the job, so at most one of
/// [`Job::delete`], [`Job::release`] and [`Job::bury`] can be issued.
pub struct Job {
    handle: Box<dyn JobHandle>,
    command: Box<dyn Command>,
}

impl Job {
    pub fn new(handle: Box<dyn JobHandle>, command: Box<dyn Command>) -> Self {
        Self { handle, command }
    }

    /// Pair a reserved item with the command decoded from its payload.
    pub fn from_reserved(reserved: ReservedJob, command: Box<dyn Command>) -> Self {
        Self::new(reserved.handle, command)
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn command(&self) -> &dyn Command {
        self.command.as_ref()
    }

    /// Read the server-side statistics for this job.
    ///
    /// # Errors
    ///
    /// Returns the client error if the server could not be asked.
    pub fn stats(&self) -> Result<JobStats, ClientError> {
        self.handle.stats()
    }

    /// Run the command.
    ///
    /// # Errors
    ///
    /// Propagates whatever the command returns.
    pub fn execute(&mut self) -> anyhow::Result<bool> {
        self.command.execute()
    }

    /// # Errors
    ///
    /// Returns the client error if the server rejected the delete.
    pub fn delete(self) -> Result<(), ClientError> {
        self.handle.delete()
    }

    /// Put the job back on the queue after `delay`.
    ///
    /// # Errors
    ///
    /// Returns the client error if the server rejected the release.
    pub fn release(self, priority: u32, delay: Duration) -> Result<(), ClientError> {
        self.handle.release(priority, delay)
    }

    /// Park the job until someone kicks it.
    ///
    /// # Errors
    ///
    /// Returns the client error if the server rejected the bury.
    pub fn bury(self, priority: u32) -> Result<(), ClientError> {
        self.handle.bury(priority)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("command", &self.command.command_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use test_support::{FakeJob, JobOp, Outcome, ScriptedCommand};

    fn job(fake: &FakeJob, outcome: Outcome) -> Job {
        Job::from_reserved(fake.reserved(), Box::new(ScriptedCommand::new(outcome)))
    }

    #[rstest]
    #[case(Outcome::Succeed, true)]
    #[case(Outcome::Fail, false)]
    fn execute_delegates_to_command(#[case] outcome: Outcome, #[case] expected: bool) {
        let fake = FakeJob::new(5, b"x".to_vec());
        let mut job = job(&fake, outcome);
        assert_eq!(job.execute().expect("execute"), expected);
        assert!(fake.ops().is_empty());
    }

    #[rstest]
    fn stats_reads_through() {
        let fake = FakeJob::new(5, b"x".to_vec()).with_reserves(4).with_priority(10);
        let job = job(&fake, Outcome::Succeed);
        let stats = job.stats().expect("stats");
        assert_eq!((stats.reserves, stats.priority), (4, 10));
        assert_eq!(fake.ops(), vec![JobOp::Stats]);
    }

    #[rstest]
    fn retire_operations_reach_the_handle() {
        let fake = FakeJob::new(9, b"x".to_vec());
        job(&fake, Outcome::Succeed).delete().expect("delete");
        job(&fake, Outcome::Succeed)
            .release(7, Duration::from_secs(60))
            .expect("release");
        job(&fake, Outcome::Succeed).bury(3).expect("bury");
        assert_eq!(
            fake.ops(),
            vec![
                JobOp::Delete,
                JobOp::Release {
                    priority: 7,
                    delay: Duration::from_secs(60)
                },
                JobOp::Bury { priority: 3 },
            ]
        );
    }

    #[rstest]
    fn debug_shows_id_and_type() {
        let fake = FakeJob::new(12, b"x".to_vec());
        let rendered = format!("{:?}", job(&fake, Outcome::Fail));
        assert!(rendered.contains("12"));
        assert!(rendered.contains(ScriptedCommand::TYPE));
    }
}
