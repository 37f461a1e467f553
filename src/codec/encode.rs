use std::io::{self, Write};

use nrepl_types::{Item, Message, Value};

pub trait Encode {
    /// Write the bencode serialization of this message into `out`.
    fn encode(&self, out: &mut dyn Write) -> io::Result<()>;

    /// Serialize into a fresh buffer.
    fn dump(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out)
            .expect("writing to a Vec<u8> cannot fail");
        out
    }
}

fn encode_bytes(bytes: &[u8], out: &mut dyn Write) -> io::Result<()> {
    write!(out, "{}:", bytes.len())?;
    out.write_all(bytes)
}

impl Encode for Value {
    fn encode(&self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::Int(int) => write!(out, "i{int}e"),
            Self::Bytes(bytes) => encode_bytes(bytes, out),
            Self::List(items) => {
                out.write_all(b"l")?;
                for item in items {
                    item.encode(out)?;
                }
                out.write_all(b"e")
            }
            // `BTreeMap` iteration is ascending unsigned-byte key order,
            // exactly the order bencode requires.
            Self::Dict(entries) => {
                out.write_all(b"d")?;
                for (key, value) in entries {
                    encode_bytes(key, out)?;
                    value.encode(out)?;
                }
                out.write_all(b"e")
            }
        }
    }
}

impl Encode for Item {
    fn encode(&self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::Str(text) => encode_bytes(text.as_bytes(), out),
            Self::Int(int) => write!(out, "i{int}e"),
            Self::Bytes(bytes) => encode_bytes(bytes, out),
            Self::List(items) => {
                out.write_all(b"l")?;
                for item in items {
                    item.encode(out)?;
                }
                out.write_all(b"e")
            }
            // UTF-8 string order coincides with unsigned-byte order.
            Self::Map(entries) => {
                out.write_all(b"d")?;
                for (key, value) in entries {
                    encode_bytes(key.as_bytes(), out)?;
                    value.encode(out)?;
                }
                out.write_all(b"e")
            }
        }
    }
}

impl Encode for Message {
    fn encode(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(b"d")?;
        for (key, value) in self.iter() {
            encode_bytes(key.as_bytes(), out)?;
            value.encode(out)?;
        }
        out.write_all(b"e")
    }
}

/// Write `bytes` as a netstring (`<len>:<bytes>,`).
pub fn encode_netstring(bytes: &[u8], out: &mut dyn Write) -> io::Result<()> {
    encode_bytes(bytes, out)?;
    out.write_all(b",")
}
