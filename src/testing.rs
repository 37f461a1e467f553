//! Shared test helpers.

use std::fmt::Debug;
use std::sync::Mutex;

use nrepl_types::{Message, Value};

use crate::codec::{Decode, Encode};
use crate::transport::{Outgoing, Responder};

/// Known-answer test: `input` must parse to `expected_object` leaving
/// `expected_remainder`, and encoding the object must reproduce the consumed
/// prefix of `input`.
pub fn kat_inverse_value(tests: &[(&[u8], &[u8], Value)]) {
    for (input, expected_remainder, expected_object) in tests {
        let (got_remainder, got_object) = Value::decode(input).unwrap();
        assert_eq!(expected_remainder, &got_remainder);
        assert_eq!(expected_object, &got_object);

        let encoded = got_object.dump();
        assert_eq!(&input[..input.len() - got_remainder.len()], encoded);
    }
}

pub fn known_answer_test_encode<O>(object: &O, expected: &[u8])
where
    O: Encode + Debug,
{
    let got = object.dump();
    assert_eq!(
        expected, got,
        "encoding {object:?} produced {got:02x?}, expected {expected:02x?}"
    );
}

/// A [`Responder`] that keeps everything it is asked to send. Unrendered
/// values fall back to their readable rendering, like the real terminal
/// sender.
#[derive(Debug, Default)]
pub struct Recorder(Mutex<Vec<Message>>);

impl Recorder {
    /// Take the recorded messages, oldest first.
    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut self.0.lock().expect("recorder poisoned"))
    }
}

impl Responder for Recorder {
    fn send(&self, out: Outgoing) {
        let Outgoing { mut msg, value } = out;
        if let Some(value) = value {
            msg.insert("value", value.readable());
        }
        self.0.lock().expect("recorder poisoned").push(msg);
    }
}
