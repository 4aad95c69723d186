//! # Client Facade
//!
//! Purpose: Expose the cache operations (values, tags, invalidation, bulk
//! and stats) as a blocking API over the pooled line protocol.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `TagCacheClient` hides pooling, framing and value
//!    encoding behind one method per operation.
//! 2. **Validate Before I/O**: keys, tags and values are checked before a
//!    connection is leased; empty lists return without touching the network.
//! 3. **Strict Reads, Lenient Counts**: a GET that does not answer `VALUE`
//!    or `NF` is a protocol error; counting commands degrade to zero.
//! 4. **Client-Side Set Logic**: tag intersection and union are computed
//!    from `KEYS_BY_TAG` replies.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use tagcache_common::{
    keys, tags, Command, Key, Reply, StatsReply, Tag, TagCacheError, TagCacheResult, Value, ValueSerializer,
    Verb,
};

use crate::config::ClientConfig;
#[cfg(unix)]
use crate::dispatch::AsyncBatch;
use crate::pipeline::{Pipeline, PipelineResponse};
use crate::pool::{ConnectionPool, PoolStatus};

/// Server counters plus the transport that produced them.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub invalidations: u64,
    pub hit_ratio: f64,
    pub transport: &'static str,
}

impl From<StatsReply> for Stats {
    fn from(reply: StatsReply) -> Self {
        Stats {
            hits: reply.hits,
            misses: reply.misses,
            puts: reply.puts,
            invalidations: reply.invalidations,
            hit_ratio: reply.hit_ratio,
            transport: TRANSPORT,
        }
    }
}

const TRANSPORT: &str = "tcp";

/// Blocking client with a fixed connection pool.
///
/// Each call leases a connection, runs one command and releases it. The
/// client is `Sync`; share it behind an `Arc` to use it from many threads.
pub struct TagCacheClient {
    pool: ConnectionPool,
    serializer: ValueSerializer,
}

impl TagCacheClient {
    /// Creates a client for `host:port` with default options.
    pub fn connect(host: impl Into<String>, port: u16) -> TagCacheResult<Self> {
        Self::with_config(ClientConfig {
            host: host.into(),
            port,
            ..ClientConfig::default()
        })
    }

    /// Validates `config`, builds the serializer and warms up the pool.
    ///
    /// An unreachable server is not an error here; operations report
    /// `Unavailable` until it comes up.
    pub fn with_config(config: ClientConfig) -> TagCacheResult<Self> {
        let config = config.validate()?;
        let serializer = ValueSerializer::new(config.serializer)?;
        let pool = ConnectionPool::new(config);
        Ok(TagCacheClient { pool, serializer })
    }

    pub fn config(&self) -> &ClientConfig {
        self.pool.config()
    }

    pub fn serializer(&self) -> &ValueSerializer {
        &self.serializer
    }

    /// Fetches a value. Returns `Ok(None)` on a miss.
    pub fn get(&self, key: &str) -> TagCacheResult<Option<Value>> {
        let key = Key::new(key)?;
        self.round_trip(&Command::Get { key }, |reply| match reply {
            Reply::Value(payload) => Some(self.serializer.decode(payload)),
            _ => None,
        })
    }

    /// Stores a value with optional tags and TTL. Returns true when the
    /// server acknowledged the write.
    ///
    /// A `ttl_ms` of `None` or zero stores without expiry.
    pub fn put(&self, key: &str, value: &Value, tag_names: &[&str], ttl_ms: Option<u64>) -> TagCacheResult<bool> {
        let key = Key::new(key)?;
        let tags = tags(tag_names)?;
        let payload = self.serializer.encode(value)?;
        let command = Command::Put {
            key,
            ttl_ms,
            tags,
            payload: &payload,
        };
        self.round_trip(&command, |reply| matches!(reply, Reply::Stored(true)))
    }

    /// Removes a key. Returns true when it existed.
    pub fn delete(&self, key: &str) -> TagCacheResult<bool> {
        let key = Key::new(key)?;
        self.round_trip(&Command::Del { key }, |reply| matches!(reply, Reply::Deleted(true)))
    }

    /// Removes every key carrying `tag`; returns how many were removed.
    pub fn invalidate_tag(&self, tag: &str) -> TagCacheResult<u64> {
        let tag = Tag::new(tag)?;
        self.count(&Command::InvalidateTag { tag })
    }

    /// Removes keys carrying any of `tag_names`.
    pub fn invalidate_tags_any(&self, tag_names: &[&str]) -> TagCacheResult<u64> {
        let tags = tags(tag_names)?;
        if tags.is_empty() {
            return Ok(0);
        }
        self.count(&Command::InvalidateTagsAny { tags })
    }

    /// Removes keys carrying all of `tag_names`.
    pub fn invalidate_tags_all(&self, tag_names: &[&str]) -> TagCacheResult<u64> {
        let tags = tags(tag_names)?;
        if tags.is_empty() {
            return Ok(0);
        }
        self.count(&Command::InvalidateTagsAll { tags })
    }

    /// Removes the listed keys in one command.
    pub fn invalidate_keys(&self, key_names: &[&str]) -> TagCacheResult<u64> {
        let keys = keys(key_names)?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.count(&Command::InvalidateKeys { keys })
    }

    /// Lists the keys carrying `tag`.
    pub fn keys_by_tag(&self, tag: &str) -> TagCacheResult<Vec<String>> {
        let tag = Tag::new(tag)?;
        self.round_trip(&Command::KeysByTag { tag }, |reply| match reply {
            Reply::Keys(keys) => keys.into_iter().map(str::to_string).collect(),
            _ => Vec::new(),
        })
    }

    /// Keys carrying at least one of `tag_names`, in first-seen order.
    pub fn search_any(&self, tag_names: &[&str]) -> TagCacheResult<Vec<String>> {
        let tags = tags(tag_names)?;
        let mut seen = HashSet::new();
        let mut union = Vec::new();
        for tag in tags {
            for key in self.keys_by_tag(tag.as_str())? {
                if seen.insert(key.clone()) {
                    union.push(key);
                }
            }
        }
        Ok(union)
    }

    /// Keys carrying every one of `tag_names`, in the order the first tag
    /// lists them.
    pub fn search_all(&self, tag_names: &[&str]) -> TagCacheResult<Vec<String>> {
        let tags = tags(tag_names)?;
        let Some((first, rest)) = tags.split_first() else {
            return Ok(Vec::new());
        };
        let mut candidates = self.keys_by_tag(first.as_str())?;
        for tag in rest {
            if candidates.is_empty() {
                break;
            }
            let members: HashSet<String> = self.keys_by_tag(tag.as_str())?.into_iter().collect();
            candidates.retain(|key| members.contains(key));
        }
        Ok(candidates)
    }

    /// Fetches many keys at once; misses are omitted.
    ///
    /// Best effort: when the connection fails partway, the values decoded so
    /// far are returned.
    pub fn bulk_get(&self, key_names: &[&str]) -> TagCacheResult<HashMap<String, Value>> {
        let keys = keys(key_names)?;
        let mut found = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(found);
        }

        let lines = if self.config().enable_pipelining {
            let mut pipeline = self.pipeline()?;
            let mut lines = Vec::with_capacity(keys.len());
            for &key in &keys {
                if let Err(err) = pipeline.add(&Command::Get { key }) {
                    warn!(error = %err, "bulk get pipeline failed");
                    break;
                }
            }
            let (responses, err) = pipeline.execute_partial();
            if let Some(err) = err {
                warn!(error = %err, "bulk get pipeline failed");
            }
            lines.extend(responses.into_iter().map(PipelineResponse::into_line));
            lines
        } else {
            self.get_many(&keys)?
        };

        for (key, line) in keys.iter().zip(lines.iter()) {
            match Reply::decode(Verb::Get, line) {
                Ok(Reply::Value(payload)) => {
                    found.insert(key.as_str().to_string(), self.serializer.decode(payload));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "bulk get stopped on malformed reply");
                    break;
                }
            }
        }
        debug!(requested = keys.len(), found = found.len(), "bulk get");
        Ok(found)
    }

    /// Writes every GET before reading, on one connection.
    fn get_many(&self, keys: &[Key<'_>]) -> TagCacheResult<Vec<Bytes>> {
        let mut conn = self.pool.acquire()?;
        let mut lines = Vec::with_capacity(keys.len());
        for &key in keys {
            if let Err(err) = conn.queue(&Command::Get { key }) {
                warn!(error = %err, "bulk get write failed");
                return Ok(lines);
            }
        }
        if let Err(err) = conn.flush() {
            warn!(error = %err, "bulk get write failed");
            return Ok(lines);
        }
        for _ in keys {
            match conn.read_line() {
                Ok(line) => lines.push(line),
                Err(err) => {
                    warn!(error = %err, read = lines.len(), "bulk get read failed");
                    break;
                }
            }
        }
        Ok(lines)
    }

    /// Stores many values with no tags; returns how many were acknowledged.
    ///
    /// Items whose value cannot be encoded are skipped. A connection
    /// failure stops the batch and returns the count so far.
    pub fn bulk_put<K: AsRef<str>>(&self, items: &[(K, Value)], ttl_ms: Option<u64>) -> TagCacheResult<usize> {
        let mut encoded = Vec::with_capacity(items.len());
        for (key, value) in items {
            let key = Key::new(key.as_ref())?;
            match self.serializer.encode(value) {
                Ok(payload) => encoded.push((key, payload)),
                Err(err) => warn!(key = %key, error = %err, "bulk put skipped unencodable value"),
            }
        }
        if encoded.is_empty() {
            return Ok(0);
        }

        let stored = if self.config().enable_pipelining {
            let mut pipeline = self.pipeline()?;
            for (key, payload) in &encoded {
                if let Err(err) = pipeline.add(&untagged_put(*key, payload, ttl_ms)) {
                    warn!(error = %err, "bulk put pipeline failed");
                    break;
                }
            }
            let (responses, err) = pipeline.execute_partial();
            if let Some(err) = err {
                warn!(error = %err, "bulk put pipeline failed");
            }
            count_stored(&responses)
        } else {
            let mut conn = self.pool.acquire()?;
            let mut stored = 0;
            for (key, payload) in &encoded {
                match conn.execute(&untagged_put(*key, payload, ttl_ms)) {
                    Ok(line) if matches!(Reply::decode(Verb::Put, &line), Ok(Reply::Stored(true))) => stored += 1,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, stored, "bulk put stopped");
                        break;
                    }
                }
            }
            stored
        };
        debug!(requested = items.len(), stored, "bulk put");
        Ok(stored)
    }

    /// Reads server counters. A reply that cannot be parsed yields zeros.
    pub fn stats(&self) -> TagCacheResult<Stats> {
        self.round_trip(&Command::Stats, |reply| match reply {
            Reply::Stats(Some(stats)) => Stats::from(stats),
            _ => {
                warn!("unparseable STATS reply; reporting zeros");
                Stats {
                    transport: TRANSPORT,
                    ..Stats::default()
                }
            }
        })
    }

    /// Clears the whole cache; returns how many keys were removed.
    pub fn flush(&self) -> TagCacheResult<u64> {
        self.count(&Command::Flush)
    }

    /// Leases a connection for batching commands.
    pub fn pipeline(&self) -> TagCacheResult<Pipeline<'_>> {
        let conn = self.pool.acquire()?;
        Ok(Pipeline::new(conn, self.config().pipeline_depth))
    }

    /// Starts an async GET batch.
    ///
    /// # Errors
    /// `Config` unless `enable_async_io` is set.
    #[cfg(unix)]
    pub fn async_batch(&self) -> TagCacheResult<AsyncBatch<'_>> {
        if !self.config().enable_async_io {
            return Err(TagCacheError::Config("async I/O is disabled; set enable_async_io".to_string()));
        }
        AsyncBatch::new(&self.pool, &self.serializer)
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Closes every connection. Later operations fail with `Closed`.
    pub fn close(&self) {
        self.pool.close();
    }

    fn count(&self, command: &Command<'_>) -> TagCacheResult<u64> {
        self.round_trip(command, |reply| match reply {
            Reply::Count(n) => n,
            _ => 0,
        })
    }

    fn round_trip<T>(&self, command: &Command<'_>, map: impl FnOnce(Reply<'_>) -> T) -> TagCacheResult<T> {
        let mut conn = self.pool.acquire()?;
        let line = conn.execute(command)?;
        match Reply::decode(command.verb(), &line) {
            Ok(reply) => Ok(map(reply)),
            Err(err) => {
                conn.mark_unhealthy(&err.to_string());
                Err(err.into())
            }
        }
    }
}

fn untagged_put<'a>(key: Key<'a>, payload: &'a [u8], ttl_ms: Option<u64>) -> Command<'a> {
    Command::Put {
        key,
        ttl_ms,
        tags: Vec::new(),
        payload,
    }
}

fn count_stored(responses: &[PipelineResponse]) -> usize {
    responses
        .iter()
        .filter(|r| matches!(r.reply(), Ok(Reply::Stored(true))))
        .count()
}
