//! The application view of a wire dictionary.

use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Status, Value};

/// Key whose value lists the keys to keep as raw bytes during decoding.
pub const UNENCODED: &str = "-unencoded";

/// A value inside a [`Message`].
///
/// Same tree as [`Value`], except that byte-strings which are meant as text
/// have already become [`Item::Str`] and dictionary keys are text.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Item>),
    Map(BTreeMap<String, Item>),
}

impl Item {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Convert a decoded wire value, turning byte-strings into text.
    ///
    /// `keep_raw` holds the keys named by the message's `-unencoded` list; a
    /// byte-string sitting directly under such a key stays raw. Byte-strings
    /// that are not valid UTF-8 also stay raw rather than being mangled.
    fn from_wire(value: Value, keep_raw: &BTreeSet<Vec<u8>>) -> Result<Self, MessageError> {
        Ok(match value {
            Value::Int(i) => Self::Int(i),
            Value::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Self::Str(text),
                Err(err) => Self::Bytes(err.into_bytes()),
            },
            Value::List(items) => Self::List(
                items
                    .into_iter()
                    .map(|item| Self::from_wire(item, keep_raw))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let item = match value {
                        Value::Bytes(bytes) if keep_raw.contains(&key) => Self::Bytes(bytes),
                        other => Self::from_wire(other, keep_raw)?,
                    };
                    let key = String::from_utf8(key)
                        .map_err(|err| MessageError::KeyNotUtf8(err.into_bytes()))?;
                    map.insert(key, item);
                }
                Self::Map(map)
            }
        })
    }

    fn into_wire(self) -> Value {
        match self {
            Self::Str(s) => Value::Bytes(s.into_bytes()),
            Self::Int(i) => Value::Int(i),
            Self::Bytes(b) => Value::Bytes(b),
            Self::List(items) => Value::List(items.into_iter().map(Self::into_wire).collect()),
            Self::Map(map) => Value::Dict(
                map.into_iter()
                    .map(|(k, v)| (k.into_bytes(), v.into_wire()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Item {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Item {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Item {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Vec<u8>> for Item {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<Item>> for Item {
    fn from(value: Vec<Item>) -> Self {
        Self::List(value)
    }
}

/// A conversion between [`Value`] and [`Message`] failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("Top-level value must be a dictionary")]
    NotADict,
    #[error("Dictionary key is not valid UTF-8: {0:02x?}")]
    KeyNotUtf8(Vec<u8>),
}

/// One protocol message: a map from text keys to [`Item`]s.
///
/// Requests carry at least `op`; responses echo `id` and `session` of the
/// request they answer. Construction is builder-flavored:
///
/// ```
/// use nrepl_types::{Message, Status};
///
/// let msg = Message::new()
///     .with("op", "clone")
///     .with("id", "1");
/// assert_eq!(msg.op(), Some("clone"));
///
/// let reply = msg.reply().with_status([Status::Done]);
/// assert_eq!(reply.get_str("id"), Some("1"));
/// assert!(reply.has_status("done"));
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    entries: BTreeMap<String, Item>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the application view of a top-level wire dictionary, honoring
    /// the message's own `-unencoded` list.
    pub fn from_wire(value: Value) -> Result<Self, MessageError> {
        let Value::Dict(ref entries) = value else {
            return Err(MessageError::NotADict);
        };

        let keep_raw: BTreeSet<Vec<u8>> = match entries.get(UNENCODED.as_bytes()) {
            Some(Value::List(keys)) => keys
                .iter()
                .filter_map(|k| k.as_bytes().map(<[u8]>::to_vec))
                .collect(),
            _ => BTreeSet::new(),
        };

        match Item::from_wire(value, &keep_raw)? {
            Item::Map(entries) => Ok(Self { entries }),
            _ => Err(MessageError::NotADict),
        }
    }

    /// Encode back into a wire value. Byte-strings need no marking on the
    /// way out; the codec emits them verbatim.
    pub fn into_wire(self) -> Value {
        Item::Map(self.entries).into_wire()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Item> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Item::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Item::as_int)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Item>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Item> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Item>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn with_status<I>(mut self, status: I) -> Self
    where
        I: IntoIterator<Item = Status>,
    {
        let tags = status
            .into_iter()
            .map(|tag| Item::Str(tag.as_str().to_string()))
            .collect();
        self.insert("status", Item::List(tags));
        self
    }

    /// A fresh message echoing this request's `id` and `session`.
    #[must_use]
    pub fn reply(&self) -> Self {
        let mut reply = Self::new();
        if let Some(id) = self.id() {
            reply.insert("id", id);
        }
        if let Some(session) = self.session() {
            reply.insert("session", session);
        }
        reply
    }

    // -- Conventional keys ------------------------------------------------

    pub fn op(&self) -> Option<&str> {
        self.get_str("op")
    }

    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    pub fn session(&self) -> Option<&str> {
        self.get_str("session")
    }

    pub fn code(&self) -> Option<&str> {
        self.get_str("code")
    }

    pub fn ns(&self) -> Option<&str> {
        self.get_str("ns")
    }

    pub fn status(&self) -> Vec<Status> {
        match self.get("status") {
            Some(Item::List(tags)) => tags
                .iter()
                .filter_map(Item::as_str)
                .map(Status::from)
                .collect(),
            Some(Item::Str(tag)) => vec![Status::from(tag.as_str())],
            _ => Vec::new(),
        }
    }

    pub fn has_status(&self, tag: &str) -> bool {
        self.status().iter().any(|status| status.as_str() == tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Item)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Item)> for Message {
    fn from_iter<I: IntoIterator<Item = (String, Item)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_dict(entries: Vec<(&[u8], Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.to_vec(), v)).collect())
    }

    #[test]
    fn test_from_wire_converts_text() {
        let msg = Message::from_wire(wire_dict(vec![
            (b"op", Value::from("eval")),
            (b"code", Value::from("(+ 1 2)")),
            (b"line", Value::Int(7)),
        ]))
        .unwrap();

        assert_eq!(msg.op(), Some("eval"));
        assert_eq!(msg.code(), Some("(+ 1 2)"));
        assert_eq!(msg.get_int("line"), Some(7));
    }

    #[test]
    fn test_from_wire_keeps_unencoded_keys_raw() {
        let png = vec![0x89, b'P', b'N', b'G'];
        let msg = Message::from_wire(wire_dict(vec![
            (b"op", Value::from("eval")),
            (b"data", Value::Bytes(png.clone())),
            (b"name", Value::from("image")),
            (b"-unencoded", Value::List(vec![Value::from("data")])),
        ]))
        .unwrap();

        assert_eq!(msg.get("data"), Some(&Item::Bytes(png)));
        assert_eq!(msg.get_str("name"), Some("image"));
    }

    #[test]
    fn test_from_wire_keeps_invalid_utf8_raw() {
        let msg = Message::from_wire(wire_dict(vec![(
            b"blob",
            Value::Bytes(vec![0xff, 0xfe]),
        )]))
        .unwrap();

        assert_eq!(msg.get("blob"), Some(&Item::Bytes(vec![0xff, 0xfe])));
    }

    #[test]
    fn test_from_wire_rejects_non_dict() {
        assert_eq!(
            Message::from_wire(Value::Int(1)),
            Err(MessageError::NotADict)
        );
    }

    #[test]
    fn test_wire_round_trip() {
        let wire = wire_dict(vec![
            (b"id", Value::from("i1")),
            (b"op", Value::from("eval")),
            (b"code", Value::from("(+ 1 2)")),
        ]);

        let msg = Message::from_wire(wire.clone()).unwrap();
        assert_eq!(msg.into_wire(), wire);
    }

    #[test]
    fn test_status_set() {
        let msg = Message::new().with_status([Status::Error, Status::UnknownOp, Status::Done]);

        assert!(msg.has_status("error"));
        assert!(msg.has_status("unknown-op"));
        assert!(msg.has_status("done"));
        assert!(!msg.has_status("interrupted"));
    }
}
