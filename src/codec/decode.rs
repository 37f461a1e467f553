use std::str::from_utf8;

use nom::{
    bytes::streaming::{tag, take},
    character::streaming::digit1,
    combinator::{opt, recognize},
    error::{make_error, ErrorKind},
    sequence::{pair, terminated},
    IResult, Needed,
};
use nrepl_types::{Message, Value};

/// Nesting depth beyond which a frame is rejected. Parsing recurses per
/// level, so untrusted input must not control the recursion depth.
const MAX_DEPTH: usize = 64;

pub trait Decode: Sized {
    /// Parse one value off the front of `input`, returning the remainder.
    fn decode(input: &[u8]) -> Result<(&[u8], Self), DecodeError>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// More data is needed.
    Incomplete,

    /// Decoding failed.
    Failed,
}

impl Decode for Value {
    fn decode(input: &[u8]) -> Result<(&[u8], Self), DecodeError> {
        match value(input) {
            Ok((rem, val)) => Ok((rem, val)),
            Err(nom::Err::Incomplete(_)) => Err(DecodeError::Incomplete),
            Err(nom::Err::Failure(_)) | Err(nom::Err::Error(_)) => Err(DecodeError::Failed),
        }
    }
}

impl Decode for Message {
    fn decode(input: &[u8]) -> Result<(&[u8], Self), DecodeError> {
        let (rem, val) = Value::decode(input)?;
        let msg = Message::from_wire(val).map_err(|_| DecodeError::Failed)?;
        Ok((rem, msg))
    }
}

// -------------------------------------------------------------------------------------------------

/// `value = integer / byte-string / list / dictionary`
///
/// Dispatches on the first byte; anything but `i`, `l`, `d`, or a digit is
/// malformed.
pub fn value(input: &[u8]) -> IResult<&[u8], Value> {
    value_at(input, 0)
}

fn value_at(input: &[u8], depth: usize) -> IResult<&[u8], Value> {
    if depth >= MAX_DEPTH {
        return Err(nom::Err::Failure(make_error(input, ErrorKind::TooLarge)));
    }

    match input.first().copied() {
        None => Err(nom::Err::Incomplete(Needed::new(1))),
        Some(b'i') => {
            let (rem, int) = integer(input)?;
            Ok((rem, Value::Int(int)))
        }
        Some(b'l') => list(input, depth),
        Some(b'd') => dict(input, depth),
        Some(b'0'..=b'9') => {
            let (rem, bytes) = byte_string(input)?;
            Ok((rem, Value::Bytes(bytes)))
        }
        Some(_) => Err(nom::Err::Error(make_error(input, ErrorKind::Alt))),
    }
}

/// `integer = "i" ["-"] 1*DIGIT "e"`
///
/// Leading zeros are forbidden except for `i0e` itself; `-0` is forbidden.
pub fn integer(input: &[u8]) -> IResult<&[u8], i64> {
    let (rem, digits) = terminated(
        recognize(pair(tag(b"i"), pair(opt(tag(b"-")), digit1))),
        tag(b"e"),
    )(input)?;

    // # Safety
    //
    // `unwrap` is safe because `["-"] 1*DIGIT` contains ASCII-only characters.
    let text = from_utf8(&digits[1..]).unwrap();

    let unsigned = text.strip_prefix('-').unwrap_or(text);
    if (unsigned.len() > 1 && unsigned.starts_with('0')) || text == "-0" {
        return Err(nom::Err::Failure(make_error(input, ErrorKind::Verify)));
    }

    match text.parse::<i64>() {
        Ok(int) => Ok((rem, int)),
        Err(_) => Err(nom::Err::Failure(make_error(input, ErrorKind::Verify))),
    }
}

/// `byte-string = 1*DIGIT ":" *OCTET`
///
/// The length prefix counts bytes, not characters, and the content is kept
/// as an opaque buffer.
pub fn byte_string(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (rem, bytes) = raw_byte_string(input)?;
    Ok((rem, bytes.to_vec()))
}

fn raw_byte_string(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (rem, len_digits) = terminated(digit1, tag(b":"))(input)?;

    // # Safety
    //
    // `unwrap` is safe because `1*DIGIT` contains ASCII-only characters.
    let len = from_utf8(len_digits)
        .unwrap()
        .parse::<u64>()
        .ok()
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| nom::Err::Failure(make_error(input, ErrorKind::Verify)))?;

    take(len)(rem)
}

/// `list = "l" *value "e"`
fn list(input: &[u8], depth: usize) -> IResult<&[u8], Value> {
    let (mut rem, _) = tag(b"l")(input)?;
    let mut items = Vec::new();

    loop {
        match rem.first().copied() {
            None => return Err(nom::Err::Incomplete(Needed::new(1))),
            Some(b'e') => return Ok((&rem[1..], Value::List(items))),
            Some(_) => {
                let (rest, item) = value_at(rem, depth + 1)?;
                items.push(item);
                rem = rest;
            }
        }
    }
}

/// `dictionary = "d" *(byte-string value) "e"`
///
/// Key order is not validated on read; duplicate keys keep the last value.
fn dict(input: &[u8], depth: usize) -> IResult<&[u8], Value> {
    let (mut rem, _) = tag(b"d")(input)?;
    let mut entries = std::collections::BTreeMap::new();

    loop {
        match rem.first().copied() {
            None => return Err(nom::Err::Incomplete(Needed::new(1))),
            Some(b'e') => return Ok((&rem[1..], Value::Dict(entries))),
            Some(_) => {
                let (rest, key) = byte_string(rem)?;
                let (rest, val) = value_at(rest, depth + 1)?;
                entries.insert(key, val);
                rem = rest;
            }
        }
    }
}

/// `netstring = 1*DIGIT ":" *OCTET ","`
///
/// A bencode byte-string with a trailing comma terminator. Used by bootstrap
/// tooling, not by the regular message stream.
pub fn netstring(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(raw_byte_string, tag(b","))(input)
}
