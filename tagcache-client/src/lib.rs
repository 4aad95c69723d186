//! # TagCache Client
//!
//! Purpose: Blocking client for the TagCache server's tab/newline protocol,
//! with pooled connections, pipelining and readiness-driven GET batches.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: a fixed set of connections is dialed up front
//!    and revived lazily when they die.
//! 2. **Poison On Failure**: a connection that saw an I/O or framing error is
//!    never reused until redialed.
//! 3. **Minimal Allocation**: encode and read buffers live on the connection.
//! 4. **Facade**: `TagCacheClient` is the only type most callers need.
//!
//! ```no_run
//! use tagcache_client::{TagCacheClient, Value};
//!
//! let client = TagCacheClient::connect("127.0.0.1", 1984)?;
//! client.put("user:1", &Value::from("alice"), &["users"], Some(60_000))?;
//! assert_eq!(client.get("user:1")?, Some(Value::from("alice")));
//! client.invalidate_tag("users")?;
//! # Ok::<(), tagcache_client::TagCacheError>(())
//! ```

mod client;
mod config;
mod connection;
#[cfg(unix)]
mod dispatch;
mod pipeline;
mod pool;
mod transport;

pub use client::{Stats, TagCacheClient};
pub use config::{ClientConfig, Mode, MIN_LINE_BYTES};
#[cfg(unix)]
pub use dispatch::{AsyncBatch, AsyncResult};
pub use pipeline::{Pipeline, PipelineResponse, PipelineState, PIPELINE_BUFFER_BYTES};
pub use pool::{ConnectionStatus, PoolStatus};

pub use tagcache_common::{
    Command, Format, Key, ProtocolError, Reply, Tag, TagCacheError, TagCacheResult, Value, Verb,
};
