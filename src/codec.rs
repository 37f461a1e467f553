//! # Bencode serialization
//!
//! Everything on the wire is bencode. [`Decode`] turns a byte slice into a
//! [`Value`](nrepl_types::Value) plus the unparsed remainder; [`Encode`]
//! writes a value out. Byte-strings pass through both directions untouched,
//! so traces are not guaranteed to be UTF-8 — avoid
//! `std::str::from_utf8(...).unwrap()` on raw frames.
//!
//! ## Example
//!
//! ```
//! use nrepl_server::codec::{Decode, Encode};
//! use nrepl_types::Value;
//!
//! let value: Value = [
//!     (b"ham".to_vec(), Value::from("eggs")),
//!     (b"cheese".to_vec(), Value::Int(42)),
//! ]
//! .into_iter()
//! .collect();
//!
//! // Dictionary keys are emitted in unsigned-byte order.
//! let out = value.dump();
//! assert_eq!(out, b"d6:cheesei42e3:ham4:eggse");
//!
//! let (remainder, back) = Value::decode(&out).unwrap();
//! assert!(remainder.is_empty());
//! assert_eq!(back, value);
//! ```
//!
//! Netstrings (`<len>:<bytes>,`) are the same length-prefixed shape with a
//! trailing comma; [`netstring`] and [`encode_netstring`] exist for bootstrap
//! tooling that frames whole bencode payloads that way.

pub use decode::{netstring, Decode, DecodeError};
pub use encode::{encode_netstring, Encode};

mod decode;
mod encode;

#[cfg(test)]
mod tests {
    use nrepl_types::Value;

    use super::*;
    use crate::testing::{kat_inverse_value, known_answer_test_encode};

    #[test]
    fn test_kat_inverse_value_int() {
        kat_inverse_value(&[
            (b"i0e".as_ref(), b"".as_ref(), Value::Int(0)),
            (b"i42e", b"", Value::Int(42)),
            (b"i-42e", b"", Value::Int(-42)),
            (b"i9223372036854775807e", b"", Value::Int(i64::MAX)),
            (b"i-9223372036854775808e", b"", Value::Int(i64::MIN)),
            (b"i7e???", b"???", Value::Int(7)),
        ]);
    }

    #[test]
    fn test_kat_inverse_value_bytes() {
        kat_inverse_value(&[
            (b"0:".as_ref(), b"".as_ref(), Value::Bytes(vec![])),
            (b"4:spam", b"", Value::from("spam")),
            (b"4:spameggs", b"eggs", Value::from("spam")),
            // Binary-safe: the length counts bytes, the content is opaque.
            (
                b"4:\x89PNG",
                b"",
                Value::Bytes(vec![0x89, b'P', b'N', b'G']),
            ),
            (b"2:\xff\x00", b"", Value::Bytes(vec![0xff, 0x00])),
        ]);
    }

    #[test]
    fn test_kat_inverse_value_list() {
        kat_inverse_value(&[
            (b"le".as_ref(), b"".as_ref(), Value::List(vec![])),
            (
                b"l4:spami42ee",
                b"",
                Value::List(vec![Value::from("spam"), Value::Int(42)]),
            ),
            (
                b"ll1:aei0ee",
                b"",
                Value::List(vec![Value::List(vec![Value::from("a")]), Value::Int(0)]),
            ),
        ]);
    }

    #[test]
    fn test_kat_inverse_value_dict() {
        kat_inverse_value(&[
            (
                b"de".as_ref(),
                b"".as_ref(),
                Value::Dict(Default::default()),
            ),
            (
                b"d6:cheesei42e3:ham4:eggse",
                b"",
                [
                    (b"ham".to_vec(), Value::from("eggs")),
                    (b"cheese".to_vec(), Value::Int(42)),
                ]
                .into_iter()
                .collect(),
            ),
            (
                b"d2:id1:12:op5:clonee...",
                b"...",
                [
                    (b"op".to_vec(), Value::from("clone")),
                    (b"id".to_vec(), Value::from("1")),
                ]
                .into_iter()
                .collect(),
            ),
        ]);
    }

    #[test]
    fn test_encode_sorts_dict_keys() {
        known_answer_test_encode(
            &[
                (b"zz".to_vec(), Value::Int(1)),
                (b"a".to_vec(), Value::Int(2)),
                (vec![0xff], Value::Int(3)),
                (b"ab".to_vec(), Value::Int(4)),
            ]
            .into_iter()
            .collect::<Value>(),
            b"d1:ai2e2:abi4e2:zzi1e1:\xffi3ee",
        );
    }

    #[test]
    fn test_decode_incomplete_failed() {
        let tests = [
            // Incomplete
            (b"".as_ref(), Err(DecodeError::Incomplete)),
            (b"i", Err(DecodeError::Incomplete)),
            (b"i42", Err(DecodeError::Incomplete)),
            (b"4:spa", Err(DecodeError::Incomplete)),
            (b"4", Err(DecodeError::Incomplete)),
            (b"l4:spam", Err(DecodeError::Incomplete)),
            (b"d2:op", Err(DecodeError::Incomplete)),
            // Failed
            (b"ie", Err(DecodeError::Failed)),
            (b"i-e", Err(DecodeError::Failed)),
            (b"i-0e", Err(DecodeError::Failed)),
            (b"i03e", Err(DecodeError::Failed)),
            (b"i00e", Err(DecodeError::Failed)),
            (b"i4.2e", Err(DecodeError::Failed)),
            (b"i9223372036854775808e", Err(DecodeError::Failed)),
            (b"x", Err(DecodeError::Failed)),
            (b"d1:ae", Err(DecodeError::Failed)),
            (b"di1e1:ae", Err(DecodeError::Failed)),
        ];

        for (test, expected) in tests {
            let got = Value::decode(test);

            assert_eq!(expected, got, "input: {test:02x?}");
        }
    }

    #[test]
    fn test_binary_round_trip_preserves_every_byte() {
        let all_bytes: Vec<u8> = (0u8..=255).collect();
        let value = Value::Bytes(all_bytes.clone());

        let dumped = value.dump();
        let (rem, got) = Value::decode(&dumped).unwrap();

        assert!(rem.is_empty());
        assert_eq!(got.as_bytes(), Some(all_bytes.as_slice()));
    }

    #[test]
    fn test_netstring_kat() {
        let tests: &[(&[u8], &[u8], &[u8])] = &[
            (b"0:,", b"", b""),
            (b"5:hello,", b"", b"hello"),
            (b"5:hello,rest", b"rest", b"hello"),
            (b"2:\xff\x00,", b"", b"\xff\x00"),
        ];

        for (input, expected_remainder, expected) in tests {
            let (remainder, got) = netstring(input).unwrap();
            assert_eq!(remainder, *expected_remainder);
            assert_eq!(got, *expected);

            let mut out = Vec::new();
            encode_netstring(expected, &mut out).unwrap();
            assert_eq!(&out, &input[..input.len() - expected_remainder.len()]);
        }
    }

    #[test]
    fn test_netstring_missing_comma_fails() {
        assert!(netstring(b"5:hello!").is_err());
    }
}
