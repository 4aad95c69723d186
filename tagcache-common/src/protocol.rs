//! # Tag-Cache Line Protocol
//!
//! Purpose: Render client commands into the tab-delimited, newline-terminated
//! wire format and classify server response lines. No I/O happens here.
//!
//! ## Design Principles
//! 1. **Prefix Classification**: responses are recognised by comparing a fixed
//!    literal prefix (`VALUE\t`, `KEYS\t`, ...), never by general parsing.
//! 2. **Buffer Reuse**: encoders append into a caller-owned buffer so a
//!    connection can keep one scratch buffer for its whole life.
//! 3. **Symmetric Codec**: commands can be decoded as well as encoded, which
//!    keeps framing testable without a server.
//! 4. **Lenient Counters**: count-style responses fall back to `0` when the
//!    line is not what was expected; the caller never sees a partial number.
//!
//! ## Wire Format
//!
//! ```text
//! GET\t<key>\n                                  -> VALUE\t<payload>\n | NF\n
//! PUT\t<key>\t<ttl_ms|->\t<tag,tag|->\t<payload>\n -> OK\n
//! DEL\t<key>\n                                  -> DEL ok\n | DEL nf\n
//! INV_TAG\t<tag>\n                              -> INV_TAG\t<count>\n
//! INV_TAGS_ANY\t<csv>\n                         -> INV_TAGS_ANY\t<count>\n
//! INV_TAGS_ALL\t<csv>\n                         -> INV_TAGS_ALL\t<count>\n
//! INV_KEYS\t<csv>\n                             -> INV_KEYS\t<count>\n
//! KEYS_BY_TAG\t<tag>\n                          -> KEYS\t<csv>\n
//! STATS\n                  -> STATS\t<hits>\t<misses>\t<puts>\t<inv>\t<ratio>\n
//! FLUSH\n                                       -> FLUSH\t<count>\n
//! ```

use crate::error::{ProtocolError, TagCacheError, TagCacheResult};
use crate::types::{has_framing_bytes, Key, Tag, FIELD_SEPARATOR, LINE_TERMINATOR, LIST_SEPARATOR};

/// Placeholder for an absent TTL or an empty tag list.
const NONE_FIELD: &[u8] = b"-";

const VALUE_PREFIX: &[u8] = b"VALUE\t";
const KEYS_PREFIX: &[u8] = b"KEYS\t";
const STATS_PREFIX: &[u8] = b"STATS\t";
const NOT_FOUND: &[u8] = b"NF";
const STORED: &[u8] = b"OK";

/// Command verbs understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Put,
    Del,
    InvalidateTag,
    InvalidateTagsAny,
    InvalidateTagsAll,
    InvalidateKeys,
    KeysByTag,
    Stats,
    Flush,
}

impl Verb {
    /// Wire spelling of the verb.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Verb::Get => b"GET",
            Verb::Put => b"PUT",
            Verb::Del => b"DEL",
            Verb::InvalidateTag => b"INV_TAG",
            Verb::InvalidateTagsAny => b"INV_TAGS_ANY",
            Verb::InvalidateTagsAll => b"INV_TAGS_ALL",
            Verb::InvalidateKeys => b"INV_KEYS",
            Verb::KeysByTag => b"KEYS_BY_TAG",
            Verb::Stats => b"STATS",
            Verb::Flush => b"FLUSH",
        }
    }

    fn from_bytes(data: &[u8]) -> Option<Verb> {
        let verb = match data {
            b"GET" => Verb::Get,
            b"PUT" => Verb::Put,
            b"DEL" => Verb::Del,
            b"INV_TAG" => Verb::InvalidateTag,
            b"INV_TAGS_ANY" => Verb::InvalidateTagsAny,
            b"INV_TAGS_ALL" => Verb::InvalidateTagsAll,
            b"INV_KEYS" => Verb::InvalidateKeys,
            b"KEYS_BY_TAG" => Verb::KeysByTag,
            b"STATS" => Verb::Stats,
            b"FLUSH" => Verb::Flush,
            _ => return None,
        };
        Some(verb)
    }

    /// Prefix of a count response (`INV_TAG\t`, `FLUSH\t`, ...), if the verb has one.
    fn count_prefix(self) -> Option<&'static [u8]> {
        match self {
            Verb::InvalidateTag => Some(b"INV_TAG\t"),
            Verb::InvalidateTagsAny => Some(b"INV_TAGS_ANY\t"),
            Verb::InvalidateTagsAll => Some(b"INV_TAGS_ALL\t"),
            Verb::InvalidateKeys => Some(b"INV_KEYS\t"),
            Verb::Flush => Some(b"FLUSH\t"),
            _ => None,
        }
    }
}

/// A single client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Get {
        key: Key<'a>,
    },
    Put {
        key: Key<'a>,
        /// `None` (or zero) means no expiry.
        ttl_ms: Option<u64>,
        tags: Vec<Tag<'a>>,
        payload: &'a [u8],
    },
    Del {
        key: Key<'a>,
    },
    InvalidateTag {
        tag: Tag<'a>,
    },
    InvalidateTagsAny {
        tags: Vec<Tag<'a>>,
    },
    InvalidateTagsAll {
        tags: Vec<Tag<'a>>,
    },
    InvalidateKeys {
        keys: Vec<Key<'a>>,
    },
    KeysByTag {
        tag: Tag<'a>,
    },
    Stats,
    Flush,
}

impl<'a> Command<'a> {
    /// Verb of this command.
    pub fn verb(&self) -> Verb {
        match self {
            Command::Get { .. } => Verb::Get,
            Command::Put { .. } => Verb::Put,
            Command::Del { .. } => Verb::Del,
            Command::InvalidateTag { .. } => Verb::InvalidateTag,
            Command::InvalidateTagsAny { .. } => Verb::InvalidateTagsAny,
            Command::InvalidateTagsAll { .. } => Verb::InvalidateTagsAll,
            Command::InvalidateKeys { .. } => Verb::InvalidateKeys,
            Command::KeysByTag { .. } => Verb::KeysByTag,
            Command::Stats => Verb::Stats,
            Command::Flush => Verb::Flush,
        }
    }

    /// Appends the wire form of the command, including the trailing `\n`.
    ///
    /// # Errors
    /// Returns `TagCacheError::InvalidInput` when a PUT payload contains a tab
    /// or line break; nothing is appended in that case.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> TagCacheResult<()> {
        if let Command::Put { payload, .. } = self {
            if has_framing_bytes(payload) {
                return Err(TagCacheError::InvalidInput(
                    "payload contains a tab or line break".to_string(),
                ));
            }
        }

        out.extend_from_slice(self.verb().as_bytes());
        match self {
            Command::Get { key } | Command::Del { key } => {
                out.push(FIELD_SEPARATOR);
                out.extend_from_slice(key.as_str().as_bytes());
            }
            Command::Put {
                key,
                ttl_ms,
                tags,
                payload,
            } => {
                out.push(FIELD_SEPARATOR);
                out.extend_from_slice(key.as_str().as_bytes());
                out.push(FIELD_SEPARATOR);
                match ttl_ms {
                    Some(ttl) if *ttl > 0 => push_u64(out, *ttl),
                    _ => out.extend_from_slice(NONE_FIELD),
                }
                out.push(FIELD_SEPARATOR);
                if tags.is_empty() {
                    out.extend_from_slice(NONE_FIELD);
                } else {
                    push_list(out, tags.iter().map(|t| t.as_str()));
                }
                out.push(FIELD_SEPARATOR);
                out.extend_from_slice(payload);
            }
            Command::InvalidateTag { tag } | Command::KeysByTag { tag } => {
                out.push(FIELD_SEPARATOR);
                out.extend_from_slice(tag.as_str().as_bytes());
            }
            Command::InvalidateTagsAny { tags } | Command::InvalidateTagsAll { tags } => {
                out.push(FIELD_SEPARATOR);
                push_list(out, tags.iter().map(|t| t.as_str()));
            }
            Command::InvalidateKeys { keys } => {
                out.push(FIELD_SEPARATOR);
                push_list(out, keys.iter().map(|k| k.as_str()));
            }
            Command::Stats | Command::Flush => {}
        }
        out.push(LINE_TERMINATOR);
        Ok(())
    }

    /// Convenience wrapper returning a freshly allocated frame.
    pub fn to_bytes(&self) -> TagCacheResult<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Parses one command line (without its `\n`) back into a command.
    ///
    /// This is the server-side view of the framing; the client uses it in
    /// tests and diagnostics to prove that encoded fields survive intact.
    pub fn decode(line: &'a [u8]) -> Result<Command<'a>, ProtocolError> {
        let mut fields = line.splitn(5, |&b| b == FIELD_SEPARATOR);
        let verb_bytes = fields.next().unwrap_or_default();
        let verb = Verb::from_bytes(verb_bytes)
            .ok_or_else(|| ProtocolError::UnknownCommand(String::from_utf8_lossy(verb_bytes).into_owned()))?;

        let command = match verb {
            Verb::Get => Command::Get {
                key: Key::from_wire(text(fields.next())?),
            },
            Verb::Del => Command::Del {
                key: Key::from_wire(text(fields.next())?),
            },
            Verb::Put => {
                let key = Key::from_wire(text(fields.next())?);
                let ttl_field = fields.next().ok_or(ProtocolError::MissingField)?;
                let ttl_ms = if ttl_field == NONE_FIELD || ttl_field.is_empty() {
                    None
                } else {
                    Some(parse_u64(ttl_field)?)
                };
                let tag_field = fields.next().ok_or(ProtocolError::MissingField)?;
                let tags = if tag_field == NONE_FIELD {
                    Vec::new()
                } else {
                    split_list(tag_field)?.into_iter().map(Tag::from_wire).collect()
                };
                let payload = fields.next().unwrap_or_default();
                Command::Put {
                    key,
                    ttl_ms,
                    tags,
                    payload,
                }
            }
            Verb::InvalidateTag => Command::InvalidateTag {
                tag: Tag::from_wire(text(fields.next())?),
            },
            Verb::KeysByTag => Command::KeysByTag {
                tag: Tag::from_wire(text(fields.next())?),
            },
            Verb::InvalidateTagsAny => Command::InvalidateTagsAny {
                tags: list_field(fields.next())?.into_iter().map(Tag::from_wire).collect(),
            },
            Verb::InvalidateTagsAll => Command::InvalidateTagsAll {
                tags: list_field(fields.next())?.into_iter().map(Tag::from_wire).collect(),
            },
            Verb::InvalidateKeys => Command::InvalidateKeys {
                keys: list_field(fields.next())?.into_iter().map(Key::from_wire).collect(),
            },
            Verb::Stats => Command::Stats,
            Verb::Flush => Command::Flush,
        };
        Ok(command)
    }
}

/// Counters reported by the STATS command.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatsReply {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub invalidations: u64,
    pub hit_ratio: f64,
}

/// A classified response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<'a> {
    /// GET hit with its raw payload.
    Value(&'a [u8]),
    /// GET miss.
    NotFound,
    /// PUT outcome.
    Stored(bool),
    /// DEL outcome.
    Deleted(bool),
    /// Invalidation or flush count.
    Count(u64),
    /// KEYS_BY_TAG result.
    Keys(Vec<&'a str>),
    /// STATS result; `None` when the line did not carry the expected shape.
    Stats(Option<StatsReply>),
}

impl<'a> Reply<'a> {
    /// Classifies the response line for a command of the given verb.
    ///
    /// Only GET is strict: anything except `VALUE\t...` or `NF` is a protocol
    /// violation. Other verbs degrade to their empty result.
    pub fn decode(verb: Verb, line: &'a [u8]) -> Result<Reply<'a>, ProtocolError> {
        let reply = match verb {
            Verb::Get => {
                if let Some(payload) = line.strip_prefix(VALUE_PREFIX) {
                    Reply::Value(payload)
                } else if line == NOT_FOUND {
                    Reply::NotFound
                } else {
                    return Err(ProtocolError::unexpected(line));
                }
            }
            Verb::Put => Reply::Stored(line == STORED),
            Verb::Del => Reply::Deleted(line.windows(2).any(|w| w == b"ok")),
            Verb::KeysByTag => match line.strip_prefix(KEYS_PREFIX) {
                Some(list) => Reply::Keys(split_list(list)?),
                None => Reply::Keys(Vec::new()),
            },
            Verb::Stats => Reply::Stats(line.strip_prefix(STATS_PREFIX).and_then(parse_stats)),
            Verb::InvalidateTag
            | Verb::InvalidateTagsAny
            | Verb::InvalidateTagsAll
            | Verb::InvalidateKeys
            | Verb::Flush => {
                let count = verb
                    .count_prefix()
                    .and_then(|prefix| line.strip_prefix(prefix))
                    .map(parse_leading_u64)
                    .unwrap_or(0);
                Reply::Count(count)
            }
        };
        Ok(reply)
    }
}

fn parse_stats(fields: &[u8]) -> Option<StatsReply> {
    let mut parts = fields.split(|&b| b == FIELD_SEPARATOR);
    let hits = parse_u64(parts.next()?).ok()?;
    let misses = parse_u64(parts.next()?).ok()?;
    let puts = parse_u64(parts.next()?).ok()?;
    let invalidations = parse_u64(parts.next()?).ok()?;
    let hit_ratio = std::str::from_utf8(parts.next()?).ok()?.trim().parse().ok()?;
    Some(StatsReply {
        hits,
        misses,
        puts,
        invalidations,
        hit_ratio,
    })
}

fn text(field: Option<&[u8]>) -> Result<&str, ProtocolError> {
    let field = field.ok_or(ProtocolError::MissingField)?;
    if field.is_empty() {
        return Err(ProtocolError::MissingField);
    }
    std::str::from_utf8(field).map_err(|_| ProtocolError::InvalidUtf8)
}

fn list_field(field: Option<&[u8]>) -> Result<Vec<&str>, ProtocolError> {
    split_list(field.ok_or(ProtocolError::MissingField)?)
}

/// Tokenizes a comma-joined list in place; empty entries are skipped.
fn split_list(list: &[u8]) -> Result<Vec<&str>, ProtocolError> {
    list.split(|&b| b == LIST_SEPARATOR)
        .filter(|entry| !entry.is_empty())
        .map(|entry| std::str::from_utf8(entry).map_err(|_| ProtocolError::InvalidUtf8))
        .collect()
}

fn push_list<'s>(out: &mut Vec<u8>, items: impl Iterator<Item = &'s str>) {
    for (idx, item) in items.enumerate() {
        if idx > 0 {
            out.push(LIST_SEPARATOR);
        }
        out.extend_from_slice(item.as_bytes());
    }
}

fn parse_u64(data: &[u8]) -> Result<u64, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::InvalidNumber);
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidNumber);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or(ProtocolError::InvalidNumber)?;
    }
    Ok(value)
}

/// Reads the leading decimal digits of `data`, stopping at the first non-digit.
fn parse_leading_u64(data: &[u8]) -> u64 {
    let mut value: u64 = 0;
    for &b in data.iter().take_while(|b| b.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    value
}

fn push_u64(out: &mut Vec<u8>, mut value: u64) {
    // Digits go through a stack buffer so numbers never allocate.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(s: &str) -> Key<'_> {
        Key::new(s).unwrap()
    }

    fn tag(s: &str) -> Tag<'_> {
        Tag::new(s).unwrap()
    }

    #[test]
    fn encodes_get() {
        let bytes = Command::Get { key: key("k1") }.to_bytes().unwrap();
        assert_eq!(bytes, b"GET\tk1\n");
    }

    #[test]
    fn encodes_put_with_ttl_and_tags() {
        let cmd = Command::Put {
            key: key("k1"),
            ttl_ms: Some(1000),
            tags: vec![tag("a"), tag("b")],
            payload: b"hello",
        };
        assert_eq!(cmd.to_bytes().unwrap(), b"PUT\tk1\t1000\ta,b\thello\n");
    }

    #[test]
    fn encodes_put_without_ttl_or_tags() {
        let cmd = Command::Put {
            key: key("k1"),
            ttl_ms: Some(0),
            tags: Vec::new(),
            payload: b"v",
        };
        assert_eq!(cmd.to_bytes().unwrap(), b"PUT\tk1\t-\t-\tv\n");
    }

    #[test]
    fn rejects_payload_with_framing_bytes() {
        let cmd = Command::Put {
            key: key("k"),
            ttl_ms: None,
            tags: Vec::new(),
            payload: b"a\nb",
        };
        let mut out = b"keep".to_vec();
        assert!(matches!(cmd.encode_into(&mut out), Err(TagCacheError::InvalidInput(_))));
        assert_eq!(out, b"keep");
    }

    #[test]
    fn encodes_list_commands() {
        let any = Command::InvalidateTagsAny {
            tags: vec![tag("x"), tag("y")],
        };
        assert_eq!(any.to_bytes().unwrap(), b"INV_TAGS_ANY\tx,y\n");
        let keys = Command::InvalidateKeys {
            keys: vec![key("k1"), key("k2")],
        };
        assert_eq!(keys.to_bytes().unwrap(), b"INV_KEYS\tk1,k2\n");
        assert_eq!(Command::Stats.to_bytes().unwrap(), b"STATS\n");
        assert_eq!(Command::Flush.to_bytes().unwrap(), b"FLUSH\n");
    }

    #[test]
    fn decodes_get_replies() {
        assert_eq!(Reply::decode(Verb::Get, b"VALUE\thello").unwrap(), Reply::Value(b"hello"));
        assert_eq!(Reply::decode(Verb::Get, b"VALUE\t").unwrap(), Reply::Value(b""));
        assert_eq!(Reply::decode(Verb::Get, b"NF").unwrap(), Reply::NotFound);
        assert!(matches!(
            Reply::decode(Verb::Get, b"ERR missing_key"),
            Err(ProtocolError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn decodes_put_and_del() {
        assert_eq!(Reply::decode(Verb::Put, b"OK").unwrap(), Reply::Stored(true));
        assert_eq!(Reply::decode(Verb::Put, b"ERR missing_key").unwrap(), Reply::Stored(false));
        assert_eq!(Reply::decode(Verb::Del, b"DEL ok").unwrap(), Reply::Deleted(true));
        assert_eq!(Reply::decode(Verb::Del, b"DEL nf").unwrap(), Reply::Deleted(false));
    }

    #[test]
    fn decodes_counts() {
        assert_eq!(Reply::decode(Verb::InvalidateTag, b"INV_TAG\t2").unwrap(), Reply::Count(2));
        assert_eq!(
            Reply::decode(Verb::InvalidateTagsAll, b"INV_TAGS_ALL\t7").unwrap(),
            Reply::Count(7)
        );
        assert_eq!(Reply::decode(Verb::Flush, b"FLUSH\t10").unwrap(), Reply::Count(10));
        // Wrong prefix or garbage degrades to zero.
        assert_eq!(Reply::decode(Verb::InvalidateKeys, b"INV_TAG\t3").unwrap(), Reply::Count(0));
        assert_eq!(Reply::decode(Verb::InvalidateTag, b"INV_TAG\tabc").unwrap(), Reply::Count(0));
    }

    #[test]
    fn decodes_keys() {
        assert_eq!(
            Reply::decode(Verb::KeysByTag, b"KEYS\tk1,k2").unwrap(),
            Reply::Keys(vec!["k1", "k2"])
        );
        assert_eq!(Reply::decode(Verb::KeysByTag, b"KEYS\t").unwrap(), Reply::Keys(Vec::new()));
        assert_eq!(Reply::decode(Verb::KeysByTag, b"ERR").unwrap(), Reply::Keys(Vec::new()));
    }

    #[test]
    fn decodes_stats() {
        let reply = Reply::decode(Verb::Stats, b"STATS\t10\t5\t20\t3\t0.666667").unwrap();
        let Reply::Stats(Some(stats)) = reply.clone() else {
            panic!("expected stats, got {reply:?}");
        };
        assert_eq!(stats.hits, 10);
        assert_eq!(stats.misses, 5);
        assert_eq!(stats.puts, 20);
        assert_eq!(stats.invalidations, 3);
        assert!((stats.hit_ratio - 0.666667).abs() < 1e-9);

        assert_eq!(Reply::decode(Verb::Stats, b"STATS\t1\t2").unwrap(), Reply::Stats(None));
    }

    #[test]
    fn decodes_put_command() {
        let cmd = Command::decode(b"PUT\tk1\t-\ta,b\tvalue with spaces").unwrap();
        assert_eq!(
            cmd,
            Command::Put {
                key: key("k1"),
                ttl_ms: None,
                tags: vec![tag("a"), tag("b")],
                payload: b"value with spaces",
            }
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(matches!(
            Command::decode(b"PING"),
            Err(ProtocolError::UnknownCommand(name)) if name == "PING"
        ));
        assert_eq!(Command::decode(b"GET"), Err(ProtocolError::MissingField));
    }

    fn ident() -> impl Strategy<Value = String> {
        "[A-Za-z0-9][A-Za-z0-9_:./ -]{0,23}"
    }

    proptest! {
        #[test]
        fn put_fields_survive_framing(
            k in ident(),
            ttl in proptest::option::of(1u64..u64::MAX),
            tag_list in proptest::collection::vec(ident(), 0..5),
            payload in "[^\t\r\n]{0,64}",
        ) {
            let tags: Vec<Tag<'_>> = tag_list.iter().map(|t| Tag::new(t).unwrap()).collect();
            let cmd = Command::Put { key: Key::new(&k).unwrap(), ttl_ms: ttl, tags, payload: payload.as_bytes() };
            let bytes = cmd.to_bytes().unwrap();
            prop_assert_eq!(bytes.last(), Some(&b'\n'));
            let decoded = Command::decode(&bytes[..bytes.len() - 1]).unwrap();
            prop_assert_eq!(decoded, cmd);
        }

        #[test]
        fn key_lists_survive_framing(list in proptest::collection::vec(ident(), 1..8)) {
            let keys: Vec<Key<'_>> = list.iter().map(|k| Key::new(k).unwrap()).collect();
            let cmd = Command::InvalidateKeys { keys };
            let bytes = cmd.to_bytes().unwrap();
            let decoded = Command::decode(&bytes[..bytes.len() - 1]).unwrap();
            prop_assert_eq!(decoded, cmd);
        }
    }
}
