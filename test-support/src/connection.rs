//! Scripted fake for [`QueueConnection`].
//!
//! Readiness is real: the fake owns one end of a Unix socket pair and the
//! reserve socket it hands out is the other end. Scripting a reply writes a
//! byte, so the event loop sees the reserve become readable exactly as it
//! would with a server.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use qman_lib::{ClientError, PendingReserve, QueueConnection, ReservedJob};

use crate::job::FakeJob;

enum Reply {
    Job(FakeJob),
    ConnectionLost,
    ServerError(String),
}

#[derive(Default)]
struct State {
    replies: VecDeque<Reply>,
    watched: Vec<String>,
    reserve_calls: usize,
    reconnect_calls: usize,
    disconnect_calls: usize,
    quit_calls: usize,
    failing_reconnects: usize,
    fail_reserve: bool,
    fail_quit: bool,
}

/// Test-side controls for a [`FakeConnection`].
#[derive(Clone)]
pub struct FakeRemote {
    state: Rc<RefCell<State>>,
    server: Rc<UnixStream>,
}

impl FakeRemote {
    fn script(&self, reply: Reply) -> io::Result<()> {
        self.state.borrow_mut().replies.push_back(reply);
        (&*self.server).write_all(&[1])
    }

    /// Deliver `job` to the next reserve.
    ///
    /// # Errors
    ///
    /// Returns the socket error if readiness could not be signalled.
    pub fn push_job(&self, job: &FakeJob) -> io::Result<()> {
        self.script(Reply::Job(job.clone()))
    }

    /// Fail the next reserve as if the server had gone away.
    ///
    /// # Errors
    ///
    /// Returns the socket error if readiness could not be signalled.
    pub fn push_connection_lost(&self) -> io::Result<()> {
        self.script(Reply::ConnectionLost)
    }

    /// Fail the next reserve with a server error status.
    ///
    /// # Errors
    ///
    /// Returns the socket error if readiness could not be signalled.
    pub fn push_server_error(&self, status: &str) -> io::Result<()> {
        self.script(Reply::ServerError(status.to_owned()))
    }

    /// Make the next `count` reconnect attempts fail.
    pub fn fail_reconnects(&self, count: usize) {
        self.state.borrow_mut().failing_reconnects = count;
    }

    /// Make issuing a reserve fail with a lost connection.
    pub fn fail_reserve(&self, fail: bool) {
        self.state.borrow_mut().fail_reserve = fail;
    }

    pub fn fail_quit(&self) {
        self.state.borrow_mut().fail_quit = true;
    }

    pub fn reserve_calls(&self) -> usize {
        self.state.borrow().reserve_calls
    }

    pub fn reconnect_calls(&self) -> usize {
        self.state.borrow().reconnect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.borrow().disconnect_calls
    }

    pub fn quit_calls(&self) -> usize {
        self.state.borrow().quit_calls
    }

    pub fn watched(&self) -> Vec<String> {
        self.state.borrow().watched.clone()
    }
}

/// In-memory [`QueueConnection`] driven by a [`FakeRemote`].
pub struct FakeConnection {
    name: String,
    state: Rc<RefCell<State>>,
    client: Rc<UnixStream>,
}

impl FakeConnection {
    /// # Errors
    ///
    /// Returns the socket error if the socket pair could not be created.
    pub fn new(name: &str) -> io::Result<(Self, FakeRemote)> {
        let (client, server) = UnixStream::pair()?;
        client.set_nonblocking(true)?;
        let state = Rc::new(RefCell::new(State::default()));
        let connection = Self {
            name: name.to_owned(),
            state: Rc::clone(&state),
            client: Rc::new(client),
        };
        let remote = FakeRemote {
            state,
            server: Rc::new(server),
        };
        Ok((connection, remote))
    }
}

impl QueueConnection for FakeConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn watch_queues(&mut self, queues: &[String]) -> Result<(), ClientError> {
        self.state.borrow_mut().watched = queues.to_vec();
        Ok(())
    }

    fn reserve_handle(&mut self) -> Result<Box<dyn PendingReserve>, ClientError> {
        let mut state = self.state.borrow_mut();
        state.reserve_calls += 1;
        if state.fail_reserve {
            return Err(ClientError::Disconnected);
        }
        Ok(Box::new(FakeReserve {
            state: Rc::clone(&self.state),
            client: Rc::clone(&self.client),
        }))
    }

    fn reconnect(&mut self) -> Result<(), ClientError> {
        let mut state = self.state.borrow_mut();
        state.reconnect_calls += 1;
        if state.failing_reconnects > 0 {
            state.failing_reconnects -= 1;
            return Err(ClientError::Connection(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            )));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state.borrow_mut().disconnect_calls += 1;
    }

    fn quit(&mut self) -> Result<(), ClientError> {
        let mut state = self.state.borrow_mut();
        state.quit_calls += 1;
        if state.fail_quit {
            return Err(ClientError::Server("INTERNAL_ERROR".to_owned()));
        }
        Ok(())
    }
}

struct FakeReserve {
    state: Rc<RefCell<State>>,
    client: Rc<UnixStream>,
}

impl PendingReserve for FakeReserve {
    fn socket(&self) -> RawFd {
        self.client.as_raw_fd()
    }

    fn invoke(self: Box<Self>) -> Result<ReservedJob, ClientError> {
        let mut marker = [0_u8; 1];
        (&*self.client).read_exact(&mut marker)?;
        let reply = self
            .state
            .borrow_mut()
            .replies
            .pop_front()
            .ok_or_else(|| ClientError::Protocol("no scripted reply".to_owned()))?;
        match reply {
            Reply::Job(job) => Ok(job.reserved()),
            Reply::ConnectionLost => Err(ClientError::Connection(io::Error::from(
                io::ErrorKind::ConnectionReset,
            ))),
            Reply::ServerError(status) => Err(ClientError::Server(status)),
        }
    }
}
