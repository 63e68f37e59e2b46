//! Recording fake for [`JobHandle`].

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use qman_lib::{ClientError, JobHandle, JobStats, ReservedJob};

/// A call made on a [`FakeJob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOp {
    Stats,
    Delete,
    Release { priority: u32, delay: Duration },
    Bury { priority: u32 },
}

/// A reserved job whose handle records every call.
///
/// Clones share the same recording, so a test can keep one clone while the
/// other is consumed by the code under test.
#[derive(Debug, Clone)]
pub struct FakeJob {
    id: u64,
    payload: Vec<u8>,
    stats: JobStats,
    ops: Rc<RefCell<Vec<JobOp>>>,
    fail_stats: bool,
}

impl FakeJob {
    /// A job reserved for the first time at the default priority.
    pub fn new(id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            payload: payload.into(),
            stats: JobStats::reserved(id, 1024, 1),
            ops: Rc::new(RefCell::new(Vec::new())),
            fail_stats: false,
        }
    }

    #[must_use]
    pub fn with_reserves(mut self, reserves: u32) -> Self {
        self.stats.reserves = reserves;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.stats.priority = priority;
        self
    }

    /// Make `stats` fail with a server error.
    #[must_use]
    pub fn failing_stats(mut self) -> Self {
        self.fail_stats = true;
        self
    }

    pub fn ops(&self) -> Vec<JobOp> {
        self.ops.borrow().clone()
    }

    /// Hand out a [`ReservedJob`] sharing this job's recording.
    pub fn reserved(&self) -> ReservedJob {
        ReservedJob::new(Box::new(self.clone()), self.payload.clone())
    }
}

impl JobHandle for FakeJob {
    fn id(&self) -> u64 {
        self.id
    }

    fn stats(&self) -> Result<JobStats, ClientError> {
        self.ops.borrow_mut().push(JobOp::Stats);
        if self.fail_stats {
            return Err(ClientError::Server("NOT_FOUND".to_owned()));
        }
        Ok(self.stats.clone())
    }

    fn delete(&self) -> Result<(), ClientError> {
        self.ops.borrow_mut().push(JobOp::Delete);
        Ok(())
    }

    fn release(&self, priority: u32, delay: Duration) -> Result<(), ClientError> {
        self.ops
            .borrow_mut()
            .push(JobOp::Release { priority, delay });
        Ok(())
    }

    fn bury(&self, priority: u32) -> Result<(), ClientError> {
        self.ops.borrow_mut().push(JobOp::Bury { priority });
        Ok(())
    }
}
