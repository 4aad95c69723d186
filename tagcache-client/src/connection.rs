//! # Connection
//!
//! Purpose: One TCP socket to the cache server plus its read/write buffers
//! and health bookkeeping.
//!
//! ## Design Principles
//! 1. **Poison On Failure**: any I/O or framing error marks the connection
//!    unhealthy; a half-read response must never be reused.
//! 2. **Reusable Buffers**: the encode scratch and both transport buffers live
//!    as long as the connection.
//! 3. **Configured Sockets**: nodelay, timeouts and keep-alive are applied at
//!    dial time, never per command.

use std::io::{self, ErrorKind};
use std::mem;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, trace, warn};

use tagcache_common::{Command, ProtocolError, TagCacheError, TagCacheResult};

use crate::config::ClientConfig;
use crate::transport::{ReadBuffer, WriteBuffer, DEFAULT_BUFFER_BYTES};

/// A pooled connection slot. The socket is absent until dialed.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    socket: Option<TcpStream>,
    healthy: bool,
    created_at: Instant,
    last_used: Instant,
    reader: ReadBuffer,
    writer: WriteBuffer,
    scratch: Vec<u8>,
}

impl Connection {
    /// Creates a slot without a socket; it reports unhealthy until attached.
    pub fn detached(id: usize, max_line_bytes: usize) -> Self {
        let now = Instant::now();
        Connection {
            id,
            socket: None,
            healthy: false,
            created_at: now,
            last_used: now,
            reader: ReadBuffer::new(max_line_bytes),
            writer: WriteBuffer::new(DEFAULT_BUFFER_BYTES),
            scratch: Vec::with_capacity(256),
        }
    }

    /// Slot index inside the pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy && self.socket.is_some()
    }

    /// Time since the current socket was attached.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last command.
    pub fn idle(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Installs a freshly dialed socket, discarding any buffered state.
    pub fn attach(&mut self, stream: TcpStream) {
        self.shutdown();
        let now = Instant::now();
        self.socket = Some(stream);
        self.healthy = true;
        self.created_at = now;
        self.last_used = now;
        self.reader.clear();
        self.writer.clear();
        debug!(conn = self.id, "connection attached");
    }

    /// Dials the server and attaches the socket.
    pub fn reconnect(&mut self, config: &ClientConfig, timeout: Duration) -> TagCacheResult<()> {
        self.shutdown();
        let stream = dial(config, timeout)?;
        self.attach(stream);
        Ok(())
    }

    pub fn mark_unhealthy(&mut self, reason: &str) {
        if self.healthy {
            warn!(conn = self.id, reason, "connection marked unhealthy");
        }
        self.healthy = false;
    }

    /// Closes the socket; the slot stays unhealthy until reconnected.
    pub fn shutdown(&mut self) {
        if let Some(stream) = self.socket.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.healthy = false;
        self.reader.clear();
        self.writer.clear();
    }

    /// Sends one command and reads its single response line.
    pub fn execute(&mut self, command: &Command<'_>) -> TagCacheResult<Bytes> {
        self.scratch.clear();
        // Encoding failures are caller errors and leave the socket untouched.
        command.encode_into(&mut self.scratch)?;
        trace!(conn = self.id, verb = ?command.verb(), bytes = self.scratch.len(), "execute");
        if self.reader.pending() > 0 {
            // A previous exchange left bytes behind; responses would pair with the wrong command.
            let err = TagCacheError::from(ProtocolError::UnexpectedResponse("unread bytes before command".to_string()));
            return self.settle(Err(err));
        }

        let frame = mem::take(&mut self.scratch);
        let result = self.with_socket(|stream, writer, reader| round_trip(stream, writer, reader, &frame));
        self.scratch = frame;
        result
    }

    /// Queues raw frame bytes on the write buffer.
    pub fn write_frame(&mut self, frame: &[u8]) -> TagCacheResult<()> {
        self.with_socket(|stream, writer, _| writer.write_frame(stream, frame))
    }

    /// Encodes a command onto the write buffer without flushing.
    pub fn queue(&mut self, command: &Command<'_>) -> TagCacheResult<()> {
        self.scratch.clear();
        command.encode_into(&mut self.scratch)?;
        let frame = mem::take(&mut self.scratch);
        let result = self.with_socket(|stream, writer, _| writer.write_frame(stream, &frame));
        self.scratch = frame;
        result
    }

    pub fn flush(&mut self) -> TagCacheResult<()> {
        self.with_socket(|stream, writer, _| writer.flush(stream))
    }

    /// Reads one response line, blocking up to the socket timeout.
    ///
    /// Queued writes are flushed first so the read never waits on a request
    /// that was not sent.
    pub fn read_line(&mut self) -> TagCacheResult<Bytes> {
        if self.writer.used() > 0 {
            self.flush()?;
        }
        self.with_socket(|stream, _, reader| reader.read_line(stream))
    }

    /// Reads one response line if one is available without blocking.
    ///
    /// Only meaningful while the socket is in non-blocking mode.
    pub fn try_read_line(&mut self) -> TagCacheResult<Option<Bytes>> {
        self.with_socket(|stream, _, reader| reader.try_read_line(stream))
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> TagCacheResult<()> {
        let result = match self.socket.as_ref() {
            Some(stream) => stream.set_nonblocking(nonblocking).map_err(TagCacheError::from),
            None => Err(not_connected()),
        };
        self.settle(result)
    }

    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.socket.as_ref()
    }

    /// Runs `op` against the socket and its buffers.
    ///
    /// A socket marked unhealthy is refused until it is reconnected: replies
    /// to an interrupted exchange may still be in flight on it.
    fn with_socket<T>(
        &mut self,
        op: impl FnOnce(&mut TcpStream, &mut WriteBuffer, &mut ReadBuffer) -> TagCacheResult<T>,
    ) -> TagCacheResult<T> {
        let result = match self.socket.as_mut() {
            Some(_) if !self.healthy => Err(unhealthy()),
            Some(stream) => op(stream, &mut self.writer, &mut self.reader),
            None => Err(not_connected()),
        };
        self.settle(result)
    }

    fn settle<T>(&mut self, result: TagCacheResult<T>) -> TagCacheResult<T> {
        self.last_used = Instant::now();
        if let Err(err) = &result {
            if err.poisons_connection() {
                self.mark_unhealthy(&err.to_string());
            }
        }
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens a configured socket to the server.
///
/// Every resolved address is tried in turn with `timeout`.
pub fn dial(config: &ClientConfig, timeout: Duration) -> TagCacheResult<TcpStream> {
    let addr = config.addr();
    let connect_err = |source: io::Error| TagCacheError::Connect {
        addr: addr.clone(),
        source,
    };

    let candidates = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(connect_err)?;

    let mut last_err = io::Error::new(ErrorKind::NotFound, "host resolved to no addresses");
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                configure(&stream, config).map_err(connect_err)?;
                debug!(addr = %candidate, "dialed cache server");
                return Ok(stream);
            }
            Err(err) => last_err = err,
        }
    }
    Err(connect_err(last_err))
}

fn configure(stream: &TcpStream, config: &ClientConfig) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(config.io_timeout())?;
    stream.set_write_timeout(config.io_timeout())?;
    if config.enable_keep_alive {
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(config.keep_alive_idle))
            .with_interval(Duration::from_secs(config.keep_alive_interval));
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
        let keepalive = keepalive.with_retries(config.keep_alive_count);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

fn round_trip(
    stream: &mut TcpStream,
    writer: &mut WriteBuffer,
    reader: &mut ReadBuffer,
    frame: &[u8],
) -> TagCacheResult<Bytes> {
    writer.write_frame(stream, frame)?;
    writer.flush(stream)?;
    reader.read_line(stream)
}

fn not_connected() -> TagCacheError {
    TagCacheError::Io(io::Error::new(ErrorKind::NotConnected, "connection has no socket"))
}

fn unhealthy() -> TagCacheError {
    TagCacheError::Io(io::Error::new(ErrorKind::NotConnected, "connection is unhealthy until reconnected"))
}
