#![deny(missing_debug_implementations)]

//! Data structures for the nREPL wire protocol.
//!
//! The wire carries bencode, so everything a peer can say is built from four
//! shapes: integers, byte-strings, lists, and dictionaries with byte-string
//! keys. [`Value`] models exactly that tree. One adapter layer up,
//! [`Message`] is the application view of a top-level dictionary: keys are
//! text, and byte-strings have been converted to UTF-8 text except where the
//! `-unencoded` convention keeps them raw.
//!
//! ```text
//! bytes ── codec ──> Value ── adapter ──> Message ──> middleware
//! ```
//!
//! This crate performs no I/O. The codec lives in the `nrepl-server` crate.

mod message;
mod status;
mod value;

pub use message::{Item, Message, MessageError};
pub use status::Status;
pub use value::Value;

/// Well-known operation names.
pub mod ops {
    pub const CLONE: &str = "clone";
    pub const CLOSE: &str = "close";
    pub const DESCRIBE: &str = "describe";
    pub const EVAL: &str = "eval";
    pub const INTERRUPT: &str = "interrupt";
    pub const LOAD_FILE: &str = "load-file";
    pub const LS_SESSIONS: &str = "ls-sessions";
    pub const STDIN: &str = "stdin";
}
