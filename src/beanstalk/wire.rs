//! Line framing for the beanstalkd text protocol.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use crate::connection::ClientError;

/// Statuses that carry no useful payload and only signal a server-side error.
const ERROR_STATUSES: [&str; 4] = [
    "OUT_OF_MEMORY",
    "INTERNAL_ERROR",
    "BAD_FORMAT",
    "UNKNOWN_COMMAND",
];

/// Largest body beanstalkd can be configured to accept (`-z`).
const MAX_BODY_LEN: u64 = 1_073_741_824;

/// One reply line split into its status word and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub status: String,
    pub args: Vec<String>,
}

impl Reply {
    fn parse(line: &str) -> Result<Self, ClientError> {
        let mut words = line.split_ascii_whitespace();
        let status = words
            .next()
            .ok_or_else(|| ClientError::Protocol("empty reply".to_owned()))?
            .to_owned();
        if ERROR_STATUSES.contains(&status.as_str()) {
            return Err(ClientError::Server(status));
        }
        Ok(Self {
            status,
            args: words.map(str::to_owned).collect(),
        })
    }

    /// Fail unless the status equals `expected`.
    pub fn expect_status(self, expected: &str) -> Result<Self, ClientError> {
        if self.status == expected {
            Ok(self)
        } else {
            Err(ClientError::Server(self.to_string()))
        }
    }

    pub fn number(&self, index: usize) -> Result<u64, ClientError> {
        self.args
            .get(index)
            .and_then(|arg| arg.parse().ok())
            .ok_or_else(|| ClientError::Protocol(format!("malformed reply '{self}'")))
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.status)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A connected socket with a buffered reader over it.
pub(crate) struct Wire {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Wire {
    /// Dial `address`, trying each resolved address in turn.
    ///
    /// `timeout` bounds the dial and every later read or write, so a silent
    /// server surfaces as an I/O error instead of blocking the caller.
    pub fn connect(address: &str, timeout: Duration) -> io::Result<Self> {
        let mut last_error = None;
        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::from_stream(stream, timeout),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{address} did not resolve to any address"),
            )
        }))
    }

    fn from_stream(stream: TcpStream, timeout: Duration) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.writer.as_raw_fd()
    }

    /// Write one command line and an optional body.
    pub fn send(&mut self, line: &str, body: Option<&[u8]>) -> Result<(), ClientError> {
        let mut frame = Vec::with_capacity(line.len() + body.map_or(0, <[u8]>::len) + 4);
        frame.extend_from_slice(line.as_bytes());
        frame.extend_from_slice(b"\r\n");
        if let Some(body) = body {
            frame.extend_from_slice(body);
            frame.extend_from_slice(b"\r\n");
        }
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn read_reply(&mut self) -> Result<Reply, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        let line = line
            .strip_suffix("\r\n")
            .ok_or_else(|| ClientError::Protocol(format!("unterminated reply '{}'", line.trim_end())))?;
        Reply::parse(line)
    }

    /// Read a `len`-byte body followed by its CRLF terminator.
    pub fn read_body(&mut self, len: u64) -> Result<Vec<u8>, ClientError> {
        let len = usize::try_from(len)
            .ok()
            .filter(|_| len <= MAX_BODY_LEN)
            .ok_or_else(|| ClientError::Protocol(format!("body length {len} too large")))?;
        let mut body = vec![0; len];
        self.reader.read_exact(&mut body)?;
        let mut terminator = [0; 2];
        self.reader.read_exact(&mut terminator)?;
        if &terminator != b"\r\n" {
            return Err(ClientError::Protocol("body not terminated by CRLF".to_owned()));
        }
        Ok(body)
    }

    pub fn request(&mut self, line: &str, body: Option<&[u8]>) -> Result<Reply, ClientError> {
        self.send(line, body)?;
        self.read_reply()
    }
}
