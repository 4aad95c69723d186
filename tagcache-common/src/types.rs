//! # Key and Tag Types
//!
//! Validated wrappers for the identifiers that travel inside wire commands.
//!
//! ## Design Principles
//!
//! 1. **Reject At The Boundary**: the line protocol has no escaping, so a key
//!    or tag containing a field or line separator would desynchronize framing.
//!    Construction fails instead of corrupting the stream.
//! 2. **Borrowed**: validation never copies; the wrappers borrow caller strings.
//! 3. **List-Aware**: keys and tags that end up in comma-joined lists must not
//!    contain a comma either.

use std::fmt;

use crate::error::{TagCacheError, TagCacheResult};

/// Field separator inside a command line.
pub const FIELD_SEPARATOR: u8 = b'\t';

/// Line terminator for commands and responses.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Separator used for tag and key lists.
pub const LIST_SEPARATOR: u8 = b',';

/// Returns true when `bytes` contains a byte that would break line framing.
#[inline]
pub fn has_framing_bytes(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .any(|&b| b == FIELD_SEPARATOR || b == LINE_TERMINATOR || b == b'\r')
}

fn validate_identifier(kind: &str, value: &str) -> TagCacheResult<()> {
    if value.is_empty() {
        return Err(TagCacheError::InvalidInput(format!("{kind} must not be empty")));
    }
    if has_framing_bytes(value.as_bytes()) {
        return Err(TagCacheError::InvalidInput(format!(
            "{kind} {value:?} contains a tab or line break"
        )));
    }
    if value.as_bytes().contains(&LIST_SEPARATOR) {
        return Err(TagCacheError::InvalidInput(format!(
            "{kind} {value:?} contains a comma"
        )));
    }
    Ok(())
}

/// A cache key that is safe to place in any command field or key list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key<'a>(&'a str);

impl<'a> Key<'a> {
    /// Validates a key.
    ///
    /// # Errors
    /// Returns `TagCacheError::InvalidInput` for empty keys or keys containing
    /// tab, CR, LF or comma.
    ///
    /// # Examples
    /// ```rust
    /// use tagcache_common::Key;
    ///
    /// assert_eq!(Key::new("user:42").unwrap().as_str(), "user:42");
    /// assert!(Key::new("bad\tkey").is_err());
    /// ```
    pub fn new(value: &'a str) -> TagCacheResult<Self> {
        validate_identifier("key", value)?;
        Ok(Key(value))
    }

    /// Wraps a field already split off a wire line by the codec.
    pub(crate) fn from_wire(value: &'a str) -> Self {
        Key(value)
    }

    /// Returns the key text.
    #[inline]
    pub fn as_str(&self) -> &'a str {
        self.0
    }
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A tag label that is safe to place in a command field or tag list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag<'a>(&'a str);

impl<'a> Tag<'a> {
    /// Validates a tag with the same rules as [`Key::new`].
    ///
    /// A lone `-` is also rejected: it is the wire placeholder for "no tags".
    pub fn new(value: &'a str) -> TagCacheResult<Self> {
        validate_identifier("tag", value)?;
        if value == "-" {
            return Err(TagCacheError::InvalidInput("tag \"-\" is reserved".to_string()));
        }
        Ok(Tag(value))
    }

    pub(crate) fn from_wire(value: &'a str) -> Self {
        Tag(value)
    }

    /// Returns the tag text.
    #[inline]
    pub fn as_str(&self) -> &'a str {
        self.0
    }
}

impl fmt::Display for Tag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Validates every entry of a key list.
pub fn keys<'a, S: AsRef<str>>(values: &'a [S]) -> TagCacheResult<Vec<Key<'a>>> {
    values.iter().map(|v| Key::new(v.as_ref())).collect()
}

/// Validates every entry of a tag list.
pub fn tags<'a, S: AsRef<str>>(values: &'a [S]) -> TagCacheResult<Vec<Tag<'a>>> {
    values.iter().map(|v| Tag::new(v.as_ref())).collect()
}
