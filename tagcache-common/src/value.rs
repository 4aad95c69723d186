//! # Value Serializer
//!
//! Purpose: Turn application values into the opaque text payloads stored by
//! the server, and classify payloads back into values.
//!
//! ## Design Principles
//! 1. **Scalar Fast Path**: strings, integers, floats, booleans and null are
//!    written as bare text or fixed markers, independent of the configured
//!    binary format.
//! 2. **Marker Envelope**: structured values are encoded by a binary codec,
//!    base64-wrapped and prefixed with a literal marker. The markers are the
//!    wire contract; they are decoded into [`Payload`] before anything else.
//! 3. **Capability Registry**: codecs live in a [`CodecRegistry`]. Choosing a
//!    format whose codec is not registered fails at construction time.
//! 4. **Best-Effort Decode**: a marked payload that fails to decode comes back
//!    as the raw text instead of failing the read.
//!
//! ## Classification Order
//!
//! ```text
//! ""                      -> Str("")
//! __TC_NULL__ / __TC_TRUE__ / __TC_FALSE__ (exact)
//! __TC_IGBINARY__<b64>, __TC_MSGPACK__<b64>   (prefix)
//! __TC_SERIALIZED__<b64>                      (prefix)
//! [+-]digits[.digits][e[+-]digits]            -> Int, then Float
//! anything else                               -> Str
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{TagCacheError, TagCacheResult};
use crate::types::has_framing_bytes;

pub const NULL_MARKER: &str = "__TC_NULL__";
pub const TRUE_MARKER: &str = "__TC_TRUE__";
pub const FALSE_MARKER: &str = "__TC_FALSE__";
pub const IGBINARY_MARKER: &str = "__TC_IGBINARY__";
pub const MSGPACK_MARKER: &str = "__TC_MSGPACK__";
pub const SERIALIZED_MARKER: &str = "__TC_SERIALIZED__";

/// An application value that can be cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns true for the scalar kinds that use the text fast path.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Map(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the string content for `Value::Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Serializer format selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Generic structured serialization (`__TC_SERIALIZED__`).
    #[default]
    Php,
    /// igbinary (`__TC_IGBINARY__`).
    Igbinary,
    /// MessagePack (`__TC_MSGPACK__`).
    Msgpack,
    /// Scalars only; structured values are rejected.
    Native,
}

impl Format {
    /// Marker used for structured payloads of this format.
    pub fn marker(self) -> Option<&'static str> {
        match self {
            Format::Php => Some(SERIALIZED_MARKER),
            Format::Igbinary => Some(IGBINARY_MARKER),
            Format::Msgpack => Some(MSGPACK_MARKER),
            Format::Native => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Format::Php => "php",
            Format::Igbinary => "igbinary",
            Format::Msgpack => "msgpack",
            Format::Native => "native",
        }
    }
}

impl FromStr for Format {
    type Err = TagCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "php" => Ok(Format::Php),
            "igbinary" => Ok(Format::Igbinary),
            "msgpack" => Ok(Format::Msgpack),
            "native" => Ok(Format::Native),
            other => Err(TagCacheError::Config(format!("unknown serializer {other:?}"))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload classified by its literal prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Null,
    True,
    False,
    /// Marker-prefixed payload; `data` is the base64 text after the marker.
    Encoded { format: Format, data: &'a [u8] },
    /// Text that parses as a number.
    Numeric(&'a str),
    /// Anything else, including the empty payload.
    Text(&'a [u8]),
}

impl<'a> Payload<'a> {
    /// Classifies wire bytes using the fixed marker priority.
    pub fn classify(bytes: &'a [u8]) -> Payload<'a> {
        match bytes {
            b"" => return Payload::Text(bytes),
            b"__TC_NULL__" => return Payload::Null,
            b"__TC_TRUE__" => return Payload::True,
            b"__TC_FALSE__" => return Payload::False,
            _ => {}
        }
        for format in [Format::Igbinary, Format::Msgpack, Format::Php] {
            let Some(marker) = format.marker() else {
                continue;
            };
            if let Some(data) = bytes.strip_prefix(marker.as_bytes()) {
                return Payload::Encoded { format, data };
            }
        }
        match std::str::from_utf8(bytes) {
            Ok(text) if looks_numeric(text) => Payload::Numeric(text),
            _ => Payload::Text(bytes),
        }
    }
}

/// `[+-]digits[.digits][(e|E)[+-]digits]`, also accepting `.5` and `5.`.
fn looks_numeric(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut idx = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        idx += 1;
    }
    let int_start = idx;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        idx += 1;
    }
    let mut digits = idx - int_start;
    if idx < bytes.len() && bytes[idx] == b'.' {
        idx += 1;
        let frac_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        digits += idx - frac_start;
    }
    if digits == 0 {
        return false;
    }
    if idx < bytes.len() && (bytes[idx] == b'e' || bytes[idx] == b'E') {
        idx += 1;
        if matches!(bytes.get(idx), Some(b'+') | Some(b'-')) {
            idx += 1;
        }
        let exp_start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if idx == exp_start {
            return false;
        }
    }
    idx == bytes.len()
}

/// A binary encoding for structured values.
pub trait BinaryCodec: Send + Sync + fmt::Debug {
    /// Short codec name for logs.
    fn name(&self) -> &'static str;

    /// Encodes a value into codec bytes.
    fn encode(&self, value: &Value) -> TagCacheResult<Vec<u8>>;

    /// Decodes codec bytes into a value.
    fn decode(&self, bytes: &[u8]) -> TagCacheResult<Value>;
}

/// Generic structured serialization, carried as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl BinaryCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> TagCacheResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| TagCacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> TagCacheResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| TagCacheError::Serialization(e.to_string()))
    }
}

/// MessagePack codec.
#[cfg(feature = "msgpack")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

#[cfg(feature = "msgpack")]
impl BinaryCodec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> TagCacheResult<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| TagCacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> TagCacheResult<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| TagCacheError::Serialization(e.to_string()))
    }
}

/// Codecs available to this build, keyed by format.
#[derive(Debug)]
pub struct CodecRegistry {
    codecs: HashMap<Format, Box<dyn BinaryCodec>>,
}

impl CodecRegistry {
    /// An empty registry; only `Format::Native` is usable with it.
    pub fn empty() -> Self {
        CodecRegistry {
            codecs: HashMap::new(),
        }
    }

    /// Registers (or replaces) the codec for a format.
    pub fn register(&mut self, format: Format, codec: Box<dyn BinaryCodec>) {
        self.codecs.insert(format, codec);
    }

    pub fn get(&self, format: Format) -> Option<&dyn BinaryCodec> {
        self.codecs.get(&format).map(|c| c.as_ref())
    }

    /// Returns true when values can be written in `format`.
    pub fn supports(&self, format: Format) -> bool {
        format == Format::Native || self.codecs.contains_key(&format)
    }
}

impl Default for CodecRegistry {
    /// Registers every codec compiled into this build. igbinary is a PHP
    /// engine format and has no implementation here.
    fn default() -> Self {
        let mut registry = CodecRegistry::empty();
        registry.register(Format::Php, Box::new(JsonCodec));
        #[cfg(feature = "msgpack")]
        registry.register(Format::Msgpack, Box::new(MsgPackCodec));
        registry
    }
}

/// Encodes and decodes cache payloads for one configured format.
#[derive(Debug)]
pub struct ValueSerializer {
    format: Format,
    registry: CodecRegistry,
}

impl ValueSerializer {
    /// Creates a serializer using the default registry.
    ///
    /// A format without a registered codec falls back to the generic
    /// (`php`) envelope.
    pub fn new(format: Format) -> TagCacheResult<Self> {
        Self::with_registry(format, CodecRegistry::default())
    }

    /// # Errors
    /// Returns `TagCacheError::Config` when neither `format` nor the generic
    /// fallback is registered.
    pub fn with_registry(format: Format, registry: CodecRegistry) -> TagCacheResult<Self> {
        if registry.supports(format) {
            return Ok(ValueSerializer { format, registry });
        }
        if !registry.supports(Format::Php) {
            return Err(TagCacheError::Config(format!(
                "serializer {format} is not available in this build"
            )));
        }
        warn!(requested = %format, "serializer codec not available; using the generic format");
        Ok(ValueSerializer {
            format: Format::Php,
            registry,
        })
    }

    /// Format used for structured values, after any fallback.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Appends the wire payload for `value` to `out`.
    ///
    /// # Errors
    /// - `Serialization` for non-finite floats or codec failures.
    /// - `Serialization` for structured values in native mode.
    /// - `InvalidInput` for strings with tabs or line breaks in native mode,
    ///   or strings that would decode as a number or marker.
    pub fn encode_into(&self, value: &Value, out: &mut Vec<u8>) -> TagCacheResult<()> {
        match value {
            Value::Null => out.extend_from_slice(NULL_MARKER.as_bytes()),
            Value::Bool(true) => out.extend_from_slice(TRUE_MARKER.as_bytes()),
            Value::Bool(false) => out.extend_from_slice(FALSE_MARKER.as_bytes()),
            Value::Int(i) => out.extend_from_slice(i.to_string().as_bytes()),
            Value::Float(f) => {
                if !f.is_finite() {
                    return Err(TagCacheError::Serialization(format!(
                        "non-finite float {f} has no wire form"
                    )));
                }
                // Debug keeps a fractional part ("1.0"), so floats never decode as ints.
                out.extend_from_slice(format!("{f:?}").as_bytes());
            }
            Value::Str(s) => {
                let unsafe_bytes = has_framing_bytes(s.as_bytes());
                let ambiguous = !matches!(Payload::classify(s.as_bytes()), Payload::Text(_));
                match self.format {
                    Format::Native if unsafe_bytes => {
                        return Err(TagCacheError::InvalidInput(
                            "native serializer cannot carry tabs or line breaks".to_string(),
                        ));
                    }
                    Format::Native if ambiguous => {
                        return Err(TagCacheError::InvalidInput(format!(
                            "native serializer cannot carry {s:?}; it would read back as another type"
                        )));
                    }
                    Format::Native => out.extend_from_slice(s.as_bytes()),
                    _ if unsafe_bytes || ambiguous => self.encode_enveloped(value, out)?,
                    _ => out.extend_from_slice(s.as_bytes()),
                }
            }
            Value::List(_) | Value::Map(_) => {
                if self.format == Format::Native {
                    return Err(TagCacheError::Serialization(
                        "native serializer only accepts scalar values".to_string(),
                    ));
                }
                self.encode_enveloped(value, out)?;
            }
        }
        Ok(())
    }

    /// Returns the wire payload for `value` as a new buffer.
    pub fn encode(&self, value: &Value) -> TagCacheResult<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(value, &mut out)?;
        Ok(out)
    }

    fn encode_enveloped(&self, value: &Value, out: &mut Vec<u8>) -> TagCacheResult<()> {
        let (Some(marker), Some(codec)) = (self.format.marker(), self.registry.get(self.format)) else {
            return Err(TagCacheError::Serialization(format!(
                "no codec registered for {}",
                self.format
            )));
        };
        let encoded = codec.encode(value)?;
        out.extend_from_slice(marker.as_bytes());
        out.extend_from_slice(BASE64.encode(encoded).as_bytes());
        Ok(())
    }

    /// Decodes a wire payload. Never fails: payloads that cannot be decoded are
    /// returned verbatim as strings.
    pub fn decode(&self, bytes: &[u8]) -> Value {
        match Payload::classify(bytes) {
            Payload::Null => Value::Null,
            Payload::True => Value::Bool(true),
            Payload::False => Value::Bool(false),
            Payload::Encoded { format, data } => match self.decode_enveloped(format, data) {
                Ok(value) => value,
                Err(err) => {
                    warn!(format = %format, error = %err, "payload decode failed; returning raw text");
                    raw_text(bytes)
                }
            },
            Payload::Numeric(text) => match text.parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => text.parse::<f64>().map(Value::Float).unwrap_or_else(|_| raw_text(bytes)),
            },
            Payload::Text(bytes) => raw_text(bytes),
        }
    }

    fn decode_enveloped(&self, format: Format, data: &[u8]) -> TagCacheResult<Value> {
        let codec = self.registry.get(format).ok_or_else(|| {
            TagCacheError::Serialization(format!("no codec registered for {format}"))
        })?;
        let raw = BASE64
            .decode(data)
            .map_err(|e| TagCacheError::Serialization(format!("invalid base64: {e}")))?;
        codec.decode(&raw)
    }
}

fn raw_text(bytes: &[u8]) -> Value {
    Value::Str(String::from_utf8_lossy(bytes).into_owned())
}
