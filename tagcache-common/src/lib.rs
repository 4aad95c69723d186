// tagcache-common - Shared types, wire codec and value serializer for TagCache
//
// Everything in this crate is pure: no sockets, no threads.

pub mod error;
pub mod protocol;
pub mod types;
pub mod value;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
pub use value::*;
