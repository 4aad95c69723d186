//! # Client Configuration
//!
//! Purpose: Hold every knob of the client in one immutable value that the
//! binding layer can build programmatically or deserialize from a map.
//!
//! ## Design Principles
//! 1. **Serde Defaults**: every field has a default, so partial option maps work.
//! 2. **Validate Once**: `validate` runs at client construction; afterwards the
//!    config is read-only.
//! 3. **Milliseconds On The Outside**: the option names match the binding
//!    layer (`timeout_ms`, ...); `Duration` accessors are provided for I/O code.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use tagcache_common::{Format, TagCacheError, TagCacheResult};

/// Transport mode. Only TCP is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Tcp,
    Http,
    Auto,
}

/// Configuration for the client and its connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Read/write timeout for established sockets; `0` disables it.
    pub timeout_ms: u64,
    /// Timeout for a single dial attempt.
    pub connect_timeout_ms: u64,
    /// Number of pooled connections, fixed for the client's lifetime.
    pub pool_size: usize,
    /// Format used for structured values.
    pub serializer: Format,
    /// Route bulk operations through the pipeline executor.
    pub enable_pipelining: bool,
    /// Maximum commands queued before a pipeline executes implicitly.
    pub pipeline_depth: usize,
    /// Allow `Client::async_batch`.
    pub enable_async_io: bool,
    /// Enable TCP keep-alive probes on every socket.
    pub enable_keep_alive: bool,
    /// Idle seconds before the first keep-alive probe.
    pub keep_alive_idle: u64,
    /// Seconds between keep-alive probes.
    pub keep_alive_interval: u64,
    /// Failed probes before the kernel drops the connection.
    pub keep_alive_count: u32,
    /// Longest response line accepted before reporting a protocol error.
    pub max_line_bytes: usize,
    /// Requested transport mode.
    pub mode: Mode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 1984,
            timeout_ms: 5000,
            connect_timeout_ms: 3000,
            pool_size: 8,
            serializer: Format::Php,
            enable_pipelining: false,
            pipeline_depth: 10,
            enable_async_io: false,
            enable_keep_alive: true,
            keep_alive_idle: 60,
            keep_alive_interval: 10,
            keep_alive_count: 3,
            max_line_bytes: 1024 * 1024,
            mode: Mode::Tcp,
        }
    }
}

impl ClientConfig {
    /// Builds a config from a JSON object of options; missing keys keep defaults.
    ///
    /// # Errors
    /// Returns `TagCacheError::Config` when an option has the wrong type or an
    /// unknown enum value.
    pub fn from_json(options: &serde_json::Value) -> TagCacheResult<Self> {
        ClientConfig::deserialize(options).map_err(|e| TagCacheError::Config(e.to_string()))
    }

    /// Checks the config and resolves the transport mode.
    ///
    /// Non-TCP modes are not implemented; they are logged and replaced by TCP.
    pub fn validate(mut self) -> TagCacheResult<Self> {
        if self.host.trim().is_empty() {
            return Err(TagCacheError::Config("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(TagCacheError::Config("port must be non-zero".to_string()));
        }
        if self.pool_size == 0 {
            return Err(TagCacheError::Config("pool_size must be at least 1".to_string()));
        }
        if self.pipeline_depth == 0 {
            return Err(TagCacheError::Config("pipeline_depth must be at least 1".to_string()));
        }
        if self.max_line_bytes < MIN_LINE_BYTES {
            return Err(TagCacheError::Config(format!(
                "max_line_bytes must be at least {MIN_LINE_BYTES}"
            )));
        }
        if self.mode != Mode::Tcp {
            warn!(mode = ?self.mode, "transport mode not implemented; falling back to tcp");
            self.mode = Mode::Tcp;
        }
        if self.timeout_ms == 0 {
            warn!("timeout_ms = 0: socket reads and writes may block indefinitely");
        }
        Ok(self)
    }

    /// `host:port` string used for dialing and logs.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read/write timeout, `None` when disabled.
    pub fn io_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Poll timeout for the async dispatcher; falls back to the connect timeout
    /// when operation timeouts are disabled.
    pub fn poll_timeout(&self) -> Duration {
        self.io_timeout().unwrap_or_else(|| self.connect_timeout())
    }
}

/// Lower bound for `max_line_bytes`; one read buffer chunk.
pub const MIN_LINE_BYTES: usize = 8 * 1024;
