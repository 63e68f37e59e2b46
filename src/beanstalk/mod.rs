//! Blocking beanstalkd client.
//!
//! [`BeanstalkConnection`] implements [`QueueConnection`] for the worker and
//! [`Producer`] for the dispatcher. A reserve is split in two halves: the
//! `reserve` line is written immediately and the reply is read only once the
//! caller has seen the socket become readable.

mod wire;

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info};

use crate::connection::{
    ClientError, JobHandle, JobStats, PendingReserve, QueueConnection, ReservedJob,
};
use crate::producer::{Producer, PutOptions};
use wire::Wire;

/// Tube every beanstalkd connection watches and uses initially.
pub const DEFAULT_TUBE: &str = "default";

/// Bound on dialling and on each blocking read or write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

type SharedWire = Rc<RefCell<Option<Wire>>>;

fn with_wire<T>(
    wire: &SharedWire,
    f: impl FnOnce(&mut Wire) -> Result<T, ClientError>,
) -> Result<T, ClientError> {
    let mut guard = wire.borrow_mut();
    let result = f(guard.as_mut().ok_or(ClientError::Disconnected)?);
    // A transport error can leave a reply half read; never reuse that stream.
    if matches!(result, Err(ClientError::Connection(_))) {
        *guard = None;
    }
    result
}

/// A connection to one beanstalkd server.
pub struct BeanstalkConnection {
    address: String,
    timeout: Duration,
    wire: SharedWire,
    watched: Vec<String>,
    used: String,
}

impl BeanstalkConnection {
    /// Connect to `address` (`host:port`) with [`DEFAULT_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the server is unreachable.
    pub fn connect(address: impl Into<String>) -> Result<Self, ClientError> {
        Self::connect_with_timeout(address, DEFAULT_TIMEOUT)
    }

    /// Connect to `address`, bounding the dial and every request by `timeout`.
    ///
    /// The same bound applies when the connection is re-established.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the server is unreachable or
    /// `timeout` is zero.
    pub fn connect_with_timeout(
        address: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let address = address.into();
        let wire = Wire::connect(&address, timeout)?;
        info!(server = %address, timeout_ms = timeout.as_millis(), "Connected to beanstalkd");
        Ok(Self {
            address,
            timeout,
            wire: Rc::new(RefCell::new(Some(wire))),
            watched: vec![DEFAULT_TUBE.to_owned()],
            used: DEFAULT_TUBE.to_owned(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.wire.borrow().is_some()
    }

    /// Tubes currently watched.
    pub fn watched(&self) -> &[String] {
        &self.watched
    }

    /// Select the tube that `put` inserts into.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the server refused the tube name.
    pub fn use_tube(&mut self, tube: &str) -> Result<(), ClientError> {
        with_wire(&self.wire, |wire| {
            wire.request(&format!("use {tube}"), None)?
                .expect_status("USING")
                .map(drop)
        })?;
        tube.clone_into(&mut self.used);
        Ok(())
    }

    fn apply_watch_list(wire: &mut Wire, queues: &[String]) -> Result<(), ClientError> {
        for queue in queues {
            wire.request(&format!("watch {queue}"), None)?
                .expect_status("WATCHING")?;
        }
        if !queues.iter().any(|q| q == DEFAULT_TUBE) {
            wire.request(&format!("ignore {DEFAULT_TUBE}"), None)?
                .expect_status("WATCHING")?;
        }
        Ok(())
    }

    /// Release any watched tubes not in `keep`.
    fn ignore_stale(&self, wire: &mut Wire, keep: &[String]) -> Result<(), ClientError> {
        for stale in self
            .watched
            .iter()
            .filter(|t| t.as_str() != DEFAULT_TUBE && !keep.contains(t))
        {
            wire.request(&format!("ignore {stale}"), None)?
                .expect_status("WATCHING")?;
        }
        Ok(())
    }
}

impl QueueConnection for BeanstalkConnection {
    fn name(&self) -> &str {
        &self.address
    }

    fn watch_queues(&mut self, queues: &[String]) -> Result<(), ClientError> {
        if queues.is_empty() {
            return Ok(());
        }
        with_wire(&self.wire, |wire| {
            Self::apply_watch_list(wire, queues)?;
            self.ignore_stale(wire, queues)
        })?;
        debug!(server = %self.address, queues = ?queues, "Watching queues");
        self.watched = queues.to_vec();
        Ok(())
    }

    fn reserve_handle(&mut self) -> Result<Box<dyn PendingReserve>, ClientError> {
        let fd = with_wire(&self.wire, |wire| {
            wire.send("reserve", None)?;
            Ok(wire.fd())
        })?;
        Ok(Box::new(PendingBeanstalkReserve {
            wire: Rc::clone(&self.wire),
            fd,
        }))
    }

    fn reconnect(&mut self) -> Result<(), ClientError> {
        let mut wire = Wire::connect(&self.address, self.timeout)?;
        Self::apply_watch_list(&mut wire, &self.watched)?;
        if self.used != DEFAULT_TUBE {
            wire.request(&format!("use {}", self.used), None)?
                .expect_status("USING")?;
        }
        *self.wire.borrow_mut() = Some(wire);
        info!(server = %self.address, "Reconnected to beanstalkd");
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.wire.borrow_mut().take().is_some() {
            debug!(server = %self.address, "Disconnected from beanstalkd");
        }
    }

    fn quit(&mut self) -> Result<(), ClientError> {
        let Some(mut wire) = self.wire.borrow_mut().take() else {
            return Ok(());
        };
        wire.send("quit", None)
    }
}

impl Producer for BeanstalkConnection {
    fn put(&mut self, payload: &[u8], options: &PutOptions) -> Result<u64, ClientError> {
        let line = format!(
            "put {} {} {} {}",
            options.priority,
            options.delay.as_secs(),
            options.ttr.as_secs().max(1),
            payload.len()
        );
        let reply = with_wire(&self.wire, |wire| wire.request(&line, Some(payload)))?;
        let id = reply.expect_status("INSERTED")?.number(0)?;
        debug!(server = %self.address, tube = %self.used, job = id, "Inserted job");
        Ok(id)
    }
}

struct PendingBeanstalkReserve {
    wire: SharedWire,
    fd: RawFd,
}

impl PendingReserve for PendingBeanstalkReserve {
    fn socket(&self) -> RawFd {
        self.fd
    }

    fn invoke(self: Box<Self>) -> Result<ReservedJob, ClientError> {
        let (id, payload) = with_wire(&self.wire, |wire| {
            let reply = wire.read_reply()?.expect_status("RESERVED")?;
            let id = reply.number(0)?;
            let payload = wire.read_body(reply.number(1)?)?;
            Ok((id, payload))
        })?;
        Ok(ReservedJob::new(
            Box::new(BeanstalkJob {
                id,
                wire: Rc::clone(&self.wire),
            }),
            payload,
        ))
    }
}

/// Handle to a job reserved over a [`BeanstalkConnection`].
pub struct BeanstalkJob {
    id: u64,
    wire: SharedWire,
}

impl BeanstalkJob {
    fn simple(&self, line: &str, expected: &str) -> Result<(), ClientError> {
        with_wire(&self.wire, |wire| {
            wire.request(line, None)?.expect_status(expected).map(drop)
        })
    }
}

impl JobHandle for BeanstalkJob {
    fn id(&self) -> u64 {
        self.id
    }

    fn stats(&self) -> Result<JobStats, ClientError> {
        let body = with_wire(&self.wire, |wire| {
            let reply = wire
                .request(&format!("stats-job {}", self.id), None)?
                .expect_status("OK")?;
            wire.read_body(reply.number(0)?)
        })?;
        serde_yaml::from_slice(&body)
            .map_err(|e| ClientError::Protocol(format!("malformed job stats: {e}")))
    }

    fn delete(&self) -> Result<(), ClientError> {
        self.simple(&format!("delete {}", self.id), "DELETED")
    }

    fn release(&self, priority: u32, delay: Duration) -> Result<(), ClientError> {
        self.simple(
            &format!("release {} {priority} {}", self.id, delay.as_secs()),
            "RELEASED",
        )
    }

    fn bury(&self, priority: u32) -> Result<(), ClientError> {
        self.simple(&format!("bury {} {priority}", self.id), "BURIED")
    }
}
