//! # Pipeline Executor
//!
//! Purpose: Batch many commands into a single write on one leased
//! connection, then read the responses back in submission order.
//!
//! ## Design Principles
//! 1. **One Lease**: the pipeline owns its `PooledConnection` for its whole
//!    lifetime; nothing else can write to that socket meanwhile.
//! 2. **Bounded Batches**: a batch executes implicitly when its encoded size
//!    would pass the batch buffer or its count reaches the configured depth.
//! 3. **FIFO Responses**: responses are paired with the verbs that produced
//!    them, in the order the commands were added.
//! 4. **Reset Either Way**: after every execute the batch is empty again,
//!    whether the round trip succeeded or not.

use std::mem;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use tagcache_common::{Command, ProtocolError, Reply, TagCacheError, TagCacheResult, Verb};

use crate::pool::PooledConnection;

/// Encoded bytes a batch may hold before it executes implicitly.
pub const PIPELINE_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No commands queued.
    Idle,
    /// Commands queued, nothing in flight.
    Collecting,
    /// Batch written; responses being read.
    Flushing,
}

/// One response line and the verb it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResponse {
    verb: Verb,
    line: Bytes,
}

impl PipelineResponse {
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// Raw response line without its terminator.
    pub fn line(&self) -> &[u8] {
        &self.line
    }

    pub fn into_line(self) -> Bytes {
        self.line
    }

    /// Classifies the line for its verb.
    pub fn reply(&self) -> Result<Reply<'_>, ProtocolError> {
        Reply::decode(self.verb, &self.line)
    }
}

/// Commands collected on one leased connection.
pub struct Pipeline<'a> {
    conn: PooledConnection<'a>,
    batch: BytesMut,
    verbs: Vec<Verb>,
    scratch: Vec<u8>,
    completed: Vec<PipelineResponse>,
    depth: usize,
    capacity: usize,
    state: PipelineState,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(conn: PooledConnection<'a>, depth: usize) -> Self {
        Pipeline::with_capacity(conn, depth, PIPELINE_BUFFER_BYTES)
    }

    pub(crate) fn with_capacity(conn: PooledConnection<'a>, depth: usize, capacity: usize) -> Self {
        debug!(conn = conn.index(), depth, "pipeline started");
        Pipeline {
            conn,
            batch: BytesMut::with_capacity(capacity),
            verbs: Vec::with_capacity(depth),
            scratch: Vec::with_capacity(256),
            completed: Vec::new(),
            depth: depth.max(1),
            capacity,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Commands queued and not yet sent.
    pub fn pending(&self) -> usize {
        self.verbs.len()
    }

    /// Responses read by implicit executes and not yet returned.
    pub fn completed(&self) -> usize {
        self.completed.len()
    }

    /// Queues a command.
    ///
    /// May execute the queued batch first (buffer full) or right after
    /// queuing (depth reached); those responses are kept for the next
    /// [`execute`](Self::execute).
    ///
    /// # Errors
    /// `InvalidInput` for unencodable commands; I/O or protocol errors from
    /// an implicit execute.
    pub fn add(&mut self, command: &Command<'_>) -> TagCacheResult<()> {
        self.scratch.clear();
        command.encode_into(&mut self.scratch)?;

        if !self.verbs.is_empty() && self.batch.len() + self.scratch.len() > self.capacity {
            trace!(bytes = self.batch.len(), "pipeline buffer full; executing");
            self.drain()?;
        }

        self.batch.extend_from_slice(&self.scratch);
        self.verbs.push(command.verb());
        self.state = PipelineState::Collecting;

        if self.verbs.len() >= self.depth {
            trace!(depth = self.depth, "pipeline depth reached; executing");
            self.drain()?;
        }
        Ok(())
    }

    /// Sends the queued batch and returns every response collected since the
    /// last execute, in submission order.
    ///
    /// With nothing queued and nothing collected this performs no I/O.
    pub fn execute(&mut self) -> TagCacheResult<Vec<PipelineResponse>> {
        let result = self.drain();
        let responses = mem::take(&mut self.completed);
        result.map(|()| responses)
    }

    /// Like [`execute`](Self::execute) but keeps the responses read before a
    /// failure.
    pub fn execute_partial(&mut self) -> (Vec<PipelineResponse>, Option<TagCacheError>) {
        let result = self.drain();
        (mem::take(&mut self.completed), result.err())
    }

    /// Executes what is queued and releases the connection.
    pub fn end(mut self) -> TagCacheResult<Vec<PipelineResponse>> {
        let responses = self.execute();
        debug!(conn = self.conn.index(), "pipeline ended");
        responses
    }

    fn drain(&mut self) -> TagCacheResult<()> {
        if self.verbs.is_empty() {
            self.state = PipelineState::Idle;
            return Ok(());
        }

        self.state = PipelineState::Flushing;
        let verbs = mem::take(&mut self.verbs);
        let result = self.round_trip(&verbs);

        self.batch.clear();
        self.verbs = verbs;
        self.verbs.clear();
        self.state = PipelineState::Idle;
        result
    }

    fn round_trip(&mut self, verbs: &[Verb]) -> TagCacheResult<()> {
        trace!(conn = self.conn.index(), commands = verbs.len(), bytes = self.batch.len(), "pipeline flush");
        self.conn.write_frame(&self.batch)?;
        self.conn.flush()?;
        for &verb in verbs {
            let line = self.conn.read_line()?;
            self.completed.push(PipelineResponse { verb, line });
        }
        Ok(())
    }
}

impl Drop for Pipeline<'_> {
    fn drop(&mut self) {
        if !self.verbs.is_empty() {
            debug!(discarded = self.verbs.len(), "pipeline dropped with unsent commands");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use tagcache_common::Key;

    use crate::config::ClientConfig;
    use crate::pool::ConnectionPool;

    /// Answers every GET with its own key, counting reads that return data.
    fn spawn_echo_server() -> (ClientConfig, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(AtomicUsize::new(0));
        let counter = commands.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let counter = counter.clone();
                thread::spawn(move || {
                    let mut writer = stream.try_clone().unwrap();
                    let reader = BufReader::new(stream);
                    for line in reader.lines() {
                        let Ok(line) = line else { break };
                        counter.fetch_add(1, Ordering::SeqCst);
                        let key = line.strip_prefix("GET\t").unwrap_or("?");
                        if writer.write_all(format!("VALUE\t{key}\n").as_bytes()).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        let config = ClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            pool_size: 1,
            timeout_ms: 1000,
            ..ClientConfig::default()
        };
        (config, commands)
    }

    fn get(key: &str) -> Command<'_> {
        Command::Get {
            key: Key::new(key).unwrap(),
        }
    }

    #[test]
    fn empty_execute_is_a_no_op() {
        let (config, commands) = spawn_echo_server();
        let pool = ConnectionPool::new(config);
        let mut pipeline = Pipeline::new(pool.acquire().unwrap(), 10);
        assert!(pipeline.execute().unwrap().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(commands.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn responses_follow_submission_order() {
        let (config, _) = spawn_echo_server();
        let pool = ConnectionPool::new(config);
        let mut pipeline = Pipeline::new(pool.acquire().unwrap(), 100);
        for key in ["a", "b", "c"] {
            pipeline.add(&get(key)).unwrap();
        }
        assert_eq!(pipeline.state(), PipelineState::Collecting);
        assert_eq!(pipeline.pending(), 3);

        let responses = pipeline.execute().unwrap();
        let lines: Vec<_> = responses.iter().map(|r| r.line().to_vec()).collect();
        assert_eq!(lines, vec![b"VALUE\ta".to_vec(), b"VALUE\tb".to_vec(), b"VALUE\tc".to_vec()]);
        assert_eq!(responses[0].reply().unwrap(), Reply::Value(b"a"));
        assert_eq!(pipeline.pending(), 0);
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn depth_triggers_implicit_execute() {
        let (config, _) = spawn_echo_server();
        let pool = ConnectionPool::new(config);
        let mut pipeline = Pipeline::new(pool.acquire().unwrap(), 2);
        pipeline.add(&get("k1")).unwrap();
        pipeline.add(&get("k2")).unwrap();
        assert_eq!(pipeline.pending(), 0);
        assert_eq!(pipeline.completed(), 2);
        pipeline.add(&get("k3")).unwrap();

        let responses = pipeline.end().unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[2].line(), b"VALUE\tk3");
    }

    #[test]
    fn buffer_overflow_triggers_implicit_execute() {
        let (config, _) = spawn_echo_server();
        let pool = ConnectionPool::new(config);
        // Each frame is 10 bytes; the third one does not fit in 24.
        let mut pipeline = Pipeline::with_capacity(pool.acquire().unwrap(), 100, 24);
        for key in ["key01", "key02", "key03"] {
            pipeline.add(&get(key)).unwrap();
        }
        assert_eq!(pipeline.completed(), 2);
        assert_eq!(pipeline.pending(), 1);

        let responses = pipeline.execute().unwrap();
        let keys: Vec<_> = responses.iter().map(|r| r.line().to_vec()).collect();
        assert_eq!(
            keys,
            vec![b"VALUE\tkey01".to_vec(), b"VALUE\tkey02".to_vec(), b"VALUE\tkey03".to_vec()]
        );
    }

    #[test]
    fn failed_round_trip_resets_the_batch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            // Accept, read a little, then hang up without replying.
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            let _ = reader.read_line(&mut line);
        });
        let pool = ConnectionPool::new(ClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            pool_size: 1,
            timeout_ms: 1000,
            ..ClientConfig::default()
        });
        let mut pipeline = Pipeline::new(pool.acquire().unwrap(), 10);
        pipeline.add(&get("a")).unwrap();
        pipeline.add(&get("b")).unwrap();

        let (responses, err) = pipeline.execute_partial();
        assert!(responses.is_empty());
        assert!(err.unwrap().poisons_connection());
        assert_eq!(pipeline.pending(), 0);
        assert_eq!(pipeline.state(), PipelineState::Idle);
        drop(pipeline);
        assert_eq!(pool.status().healthy(), 0);
    }

    #[test]
    fn execute_after_failed_execute_does_not_reuse_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread::spawn(move || {
                    let mut writer = stream.try_clone().unwrap();
                    for line in BufReader::new(stream).lines() {
                        let Ok(line) = line else { break };
                        let key = line.strip_prefix("GET\t").unwrap_or("?").to_string();
                        if key == "slow" {
                            thread::sleep(Duration::from_millis(400));
                        }
                        if writer.write_all(format!("VALUE\t{key}\n").as_bytes()).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        let pool = ConnectionPool::new(ClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            pool_size: 1,
            timeout_ms: 100,
            ..ClientConfig::default()
        });

        {
            let mut pipeline = Pipeline::new(pool.acquire().unwrap(), 10);
            pipeline.add(&get("slow")).unwrap();
            assert!(pipeline.execute().unwrap_err().poisons_connection());

            // The late reply to "slow" must never be handed back for "fast".
            pipeline.add(&get("fast")).unwrap();
            let err = pipeline.execute().unwrap_err();
            assert!(matches!(err, TagCacheError::Io(ref e) if e.kind() == std::io::ErrorKind::NotConnected));
            assert_eq!(pipeline.completed(), 0);
            assert_eq!(pipeline.state(), PipelineState::Idle);
        }

        let mut pipeline = Pipeline::new(pool.acquire().unwrap(), 10);
        pipeline.add(&get("fast")).unwrap();
        let responses = pipeline.end().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].line(), b"VALUE\tfast");
    }
}
