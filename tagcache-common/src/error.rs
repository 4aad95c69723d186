//! # Error Taxonomy
//!
//! Purpose: One error type shared by the codec, the serializer and the
//! client, so every layer reports failures in the same vocabulary.
//!
//! ## Design Principles
//! 1. **Miss Is Not An Error**: a cache miss is `Ok(None)`, never a variant here.
//! 2. **Health-Aware**: `Io` and `Protocol` are the variants that poison a
//!    connection; the client marks it unhealthy before surfacing them.
//! 3. **Typed Framing Failures**: protocol problems keep their own enum so tests
//!    can match on the exact cause.

use std::io;

use thiserror::Error;

/// Result type used across the tag-cache crates.
pub type TagCacheResult<T> = Result<T, TagCacheError>;

/// Errors surfaced by the tag-cache client stack.
#[derive(Debug, Error)]
pub enum TagCacheError {
    /// Dialing the server failed or timed out.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// Send/recv failure or unexpected EOF on an established connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Response or command did not match the wire contract.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// A structured value could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// No healthy connection could be obtained, even after a reconnect.
    #[error("no healthy connection available")]
    Unavailable,
    /// Key, tag or value cannot be represented on the wire.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Client configuration is malformed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The client has been closed.
    #[error("client is closed")]
    Closed,
}

impl TagCacheError {
    /// Returns true when the error leaves the connection in an unknown framing state.
    pub fn poisons_connection(&self) -> bool {
        matches!(self, TagCacheError::Io(_) | TagCacheError::Protocol(_))
    }
}

/// Framing and shape violations of the line protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A full read buffer contained no line terminator.
    #[error("line exceeds {capacity} byte buffer")]
    LineTooLong { capacity: usize },
    /// The server answered with a line that the command does not allow.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    /// A command verb that the codec does not know.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// A command line is missing a required field.
    #[error("missing field")]
    MissingField,
    /// A field that must be text was not UTF-8.
    #[error("invalid utf-8")]
    InvalidUtf8,
    /// A numeric field could not be parsed.
    #[error("invalid number")]
    InvalidNumber,
}

impl ProtocolError {
    pub(crate) fn unexpected(line: &[u8]) -> Self {
        ProtocolError::UnexpectedResponse(String::from_utf8_lossy(line).into_owned())
    }
}
