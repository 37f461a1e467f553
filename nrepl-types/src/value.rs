//! The bencode value tree.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A value as it appears on the wire.
///
/// Bencode knows four shapes. Byte-strings are opaque buffers: the codec
/// never assumes UTF-8, so binary payloads survive a round-trip untouched.
/// Dictionary keys are raw byte sequences held in a [`BTreeMap`], whose
/// ordering is exactly the unsigned-byte order bencode requires on encode.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
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

    /// The byte-string as text, if it is one and is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Bytes(value.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<Vec<u8>, Value>> for Value {
    fn from(value: BTreeMap<Vec<u8>, Value>) -> Self {
        Self::Dict(value)
    }
}

impl FromIterator<(Vec<u8>, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (Vec<u8>, Value)>>(iter: I) -> Self {
        Self::Dict(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(3).as_int(), Some(3));
        assert_eq!(Value::from("ham").as_str(), Some("ham"));
        assert_eq!(Value::from(vec![0xffu8, 0x00]).as_str(), None);
        assert_eq!(Value::from(vec![0xffu8, 0x00]).as_bytes(), Some([0xff, 0x00].as_ref()));
        assert_eq!(Value::Int(3).as_bytes(), None);
    }

    #[test]
    fn test_dict_key_order_is_unsigned_byte_order() {
        let dict: Value = [
            (b"ham".to_vec(), Value::from("eggs")),
            (b"cheese".to_vec(), Value::Int(42)),
            (vec![0xff], Value::Int(1)),
            (vec![0x01], Value::Int(2)),
        ]
        .into_iter()
        .collect();

        let keys: Vec<&[u8]> = dict.as_dict().unwrap().keys().map(|k| k.as_slice()).collect();
        assert_eq!(keys, vec![&[0x01][..], b"cheese", b"ham", &[0xff][..]]);
    }
}
