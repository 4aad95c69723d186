//! # Async Dispatcher
//!
//! Purpose: Fire GET requests across several pooled connections and collect
//! whichever responses arrive first, using readiness polling instead of one
//! thread per request.
//!
//! ## Design Principles
//! 1. **Leases, Not Sockets**: every connection in flight stays leased from
//!    the pool until its responses are read or the batch ends.
//! 2. **Scoped Non-Blocking Mode**: a connection is non-blocking only while
//!    in flight; `InFlight` restores blocking mode when it is released.
//! 3. **Per-Connection FIFO**: responses on one socket arrive in request
//!    order, so each connection keeps a queue of its outstanding keys.
//! 4. **Never Stranded**: a connection released with unread responses is
//!    marked unhealthy instead of being returned with a dirty stream.

use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use tagcache_common::{Command, Key, Reply, TagCacheError, TagCacheResult, Value, ValueSerializer, Verb};

use crate::pool::{ConnectionPool, PooledConnection};

/// A key and its value, `None` on a miss.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncResult {
    pub key: String,
    pub value: Option<Value>,
}

struct InFlight<'a> {
    conn: PooledConnection<'a>,
    keys: VecDeque<String>,
    failed: bool,
}

impl InFlight<'_> {
    fn token(&self) -> Token {
        Token(self.conn.index())
    }

    /// Writes one command in blocking mode, then returns to non-blocking reads.
    fn send(&mut self, command: &Command<'_>) -> TagCacheResult<()> {
        self.conn.set_nonblocking(false)?;
        self.conn.queue(command)?;
        self.conn.flush()?;
        self.conn.set_nonblocking(true)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.keys.is_empty() {
            self.conn.mark_unhealthy("released with outstanding responses");
        }
        let _ = self.conn.set_nonblocking(false);
    }
}

/// GET requests in flight across pooled connections.
///
/// Created by `TagCacheClient::async_batch`.
pub struct AsyncBatch<'a> {
    pool: &'a ConnectionPool,
    serializer: &'a ValueSerializer,
    poll: Poll,
    events: Events,
    timeout: Duration,
    inflight: Vec<InFlight<'a>>,
}

impl<'a> AsyncBatch<'a> {
    pub(crate) fn new(pool: &'a ConnectionPool, serializer: &'a ValueSerializer) -> TagCacheResult<Self> {
        Ok(AsyncBatch {
            pool,
            serializer,
            poll: Poll::new()?,
            events: Events::with_capacity(pool.size().max(1)),
            timeout: pool.config().poll_timeout(),
            inflight: Vec::new(),
        })
    }

    /// Overrides how long [`poll`](Self::poll) waits for readiness.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Requests sent and not yet answered.
    pub fn outstanding(&self) -> usize {
        self.inflight.iter().map(|f| f.keys.len()).sum()
    }

    /// Connections currently leased by this batch.
    pub fn connections(&self) -> usize {
        self.inflight.len()
    }

    /// Sends a GET for `key` on an idle connection, or on the least loaded
    /// connection already in flight when the pool has nothing idle.
    ///
    /// # Errors
    /// `InvalidInput` for bad keys, `Unavailable` when no connection can be
    /// leased and none is in flight, or the I/O error of the send. A failed send releases its
    /// connection and drops the requests queued on it.
    pub fn submit(&mut self, key: &str) -> TagCacheResult<()> {
        let command = Command::Get { key: Key::new(key)? };

        let idle = match self.pool.try_acquire() {
            Ok(conn) => conn,
            // Idle slots are dead, but a live connection is already in flight.
            Err(TagCacheError::Unavailable) if self.least_loaded().is_some() => {
                debug!("no idle connection could be revived; sharing one in flight");
                None
            }
            Err(err) => return Err(err),
        };
        let slot = match idle {
            Some(conn) => self.register(conn)?,
            None => match self.least_loaded() {
                Some(slot) => slot,
                None => {
                    let conn = self.pool.acquire()?;
                    self.register(conn)?
                }
            },
        };

        let inflight = &mut self.inflight[slot];
        if let Err(err) = inflight.send(&command) {
            warn!(conn = inflight.conn.index(), error = %err, "async send failed");
            inflight.failed = true;
            self.release_finished();
            return Err(err);
        }
        inflight.keys.push_back(key.to_string());
        trace!(conn = inflight.conn.index(), key, "async request sent");
        Ok(())
    }

    /// Returns the responses available now, waiting up to the timeout when
    /// none are buffered.
    ///
    /// A timeout or a failed readiness wait yields an empty result; requests
    /// still outstanding can be collected by a later call.
    pub fn poll(&mut self) -> Vec<AsyncResult> {
        let mut results = Vec::new();
        if self.outstanding() == 0 {
            return results;
        }

        for slot in 0..self.inflight.len() {
            self.collect(slot, &mut results);
        }

        if results.is_empty() {
            match self.poll.poll(&mut self.events, Some(self.timeout)) {
                Ok(()) => {
                    let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
                    for token in ready {
                        if let Some(slot) = self.inflight.iter().position(|f| f.token() == token) {
                            self.collect(slot, &mut results);
                        }
                    }
                    if results.is_empty() {
                        debug!(outstanding = self.outstanding(), "async poll returned nothing");
                    }
                }
                Err(err) => warn!(error = %err, "readiness wait failed"),
            }
        }

        self.release_finished();
        results
    }

    /// Releases every connection; those still owed responses are marked
    /// unhealthy.
    pub fn end(self) {}

    fn register(&mut self, conn: PooledConnection<'a>) -> TagCacheResult<usize> {
        let fd = match conn.stream() {
            Some(stream) => stream.as_raw_fd(),
            None => return Err(TagCacheError::Unavailable),
        };
        let token = Token(conn.index());
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.inflight.push(InFlight {
            conn,
            keys: VecDeque::new(),
            failed: false,
        });
        Ok(self.inflight.len() - 1)
    }

    fn least_loaded(&self) -> Option<usize> {
        self.inflight
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.failed)
            .min_by_key(|(_, f)| f.keys.len())
            .map(|(slot, _)| slot)
    }

    /// Reads every complete response on one connection.
    fn collect(&mut self, slot: usize, results: &mut Vec<AsyncResult>) {
        let inflight = &mut self.inflight[slot];
        while !inflight.keys.is_empty() {
            let line = match inflight.conn.try_read_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(conn = inflight.conn.index(), error = %err, "async read failed");
                    inflight.failed = true;
                    break;
                }
            };
            match Reply::decode(Verb::Get, &line) {
                Ok(reply) => {
                    let Some(key) = inflight.keys.pop_front() else {
                        break;
                    };
                    let value = match reply {
                        Reply::Value(payload) => Some(self.serializer.decode(payload)),
                        _ => None,
                    };
                    results.push(AsyncResult { key, value });
                }
                Err(err) => {
                    inflight.conn.mark_unhealthy(&err.to_string());
                    inflight.failed = true;
                    break;
                }
            }
        }
    }

    /// Returns answered or failed connections to the pool.
    fn release_finished(&mut self) {
        let mut slot = 0;
        while slot < self.inflight.len() {
            let inflight = &self.inflight[slot];
            if inflight.failed || inflight.keys.is_empty() {
                let inflight = self.inflight.swap_remove(slot);
                if let Some(stream) = inflight.conn.stream() {
                    let fd = stream.as_raw_fd();
                    if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                        debug!(error = %err, "deregister failed");
                    }
                }
            } else {
                slot += 1;
            }
        }
    }
}

impl From<AsyncResult> for (String, Option<Value>) {
    fn from(result: AsyncResult) -> Self {
        (result.key, result.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    use tagcache_common::Format;

    use crate::config::ClientConfig;

    fn config_for(listener: &TcpListener, pool_size: usize) -> ClientConfig {
        let addr = listener.local_addr().unwrap();
        ClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            pool_size,
            timeout_ms: 2000,
            enable_async_io: true,
            ..ClientConfig::default()
        }
    }

    /// Answers every GET with its key once `release` has fired.
    fn serve_after(stream: std::net::TcpStream, release: Option<mpsc::Receiver<()>>) {
        let mut writer = stream.try_clone().unwrap();
        let mut release = release;
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            if let Some(rx) = release.take() {
                let _ = rx.recv();
            }
            let key = line.strip_prefix("GET\t").unwrap_or("?");
            if writer.write_all(format!("VALUE\t{key}\n").as_bytes()).is_err() {
                break;
            }
        }
    }

    fn poll_until(batch: &mut AsyncBatch<'_>, want: usize) -> Vec<AsyncResult> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut results = Vec::new();
        while results.len() < want && batch.outstanding() > 0 && Instant::now() < deadline {
            results.extend(batch.poll());
        }
        results
    }

    #[test]
    fn timed_out_poll_leaves_requests_for_a_later_poll() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener, 1);
        let (release, held) = mpsc::channel();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_after(stream, Some(held));
        });
        let pool = ConnectionPool::new(config);
        let serializer = ValueSerializer::new(Format::Php).unwrap();
        let mut batch = AsyncBatch::new(&pool, &serializer).unwrap();
        batch.set_timeout(Duration::from_millis(20));

        batch.submit("late").unwrap();
        assert!(batch.poll().is_empty());
        assert_eq!(batch.outstanding(), 1);
        assert_eq!(batch.connections(), 1);

        release.send(()).unwrap();
        let results = poll_until(&mut batch, 1);
        assert_eq!(
            results,
            vec![AsyncResult {
                key: "late".to_string(),
                value: Some(Value::from("late")),
            }]
        );
        assert_eq!(batch.connections(), 0);
        batch.end();
        assert_eq!(pool.status().healthy(), 1);
    }

    #[test]
    fn hang_up_mid_batch_releases_the_connection_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener, 1);
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            let _ = reader.read_line(&mut line);
            // Dropping the reader closes the socket without a reply.
        });
        let pool = ConnectionPool::new(config);
        let serializer = ValueSerializer::new(Format::Php).unwrap();
        let mut batch = AsyncBatch::new(&pool, &serializer).unwrap();
        batch.set_timeout(Duration::from_millis(50));

        batch.submit("gone").unwrap();
        let results = poll_until(&mut batch, 1);
        assert!(results.is_empty());
        assert_eq!(batch.outstanding(), 0);
        assert_eq!(batch.connections(), 0);
        batch.end();
        assert_eq!(pool.status().healthy(), 0);
    }

    #[test]
    fn submit_shares_an_in_flight_connection_when_idle_slots_are_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener, 2);
        let (closed, listener_gone) = mpsc::channel();
        thread::spawn(move || {
            let mut handlers = Vec::new();
            for _ in 0..2 {
                let (stream, _) = listener.accept().unwrap();
                handlers.push(thread::spawn(move || serve_after(stream, None)));
            }
            // Later dials are refused.
            drop(listener);
            closed.send(()).unwrap();
            for handler in handlers {
                let _ = handler.join();
            }
        });
        let pool = ConnectionPool::new(config);
        listener_gone.recv().unwrap();
        let serializer = ValueSerializer::new(Format::Php).unwrap();
        let mut batch = AsyncBatch::new(&pool, &serializer).unwrap();

        batch.submit("a").unwrap();
        {
            let mut idle = pool.acquire().unwrap();
            idle.mark_unhealthy("test");
        }

        batch.submit("b").unwrap();
        assert_eq!(batch.connections(), 1);
        assert_eq!(batch.outstanding(), 2);

        let mut keys: Vec<String> = poll_until(&mut batch, 2).into_iter().map(|r| r.key).collect();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
