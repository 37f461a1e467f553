//! `tokio_util::codec` integration.
//!
//! [`MessageCodec`] frames whole bencode dictionaries on a byte stream and
//! converts them to [`Message`]s at the boundary. Malformed input is fatal:
//! bencode carries no resynchronization points, so once a frame fails to
//! parse the connection is done.

use std::io::Error;

use bytes::{Buf, BytesMut};
use thiserror::Error;

use nrepl_types::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{Decode, DecodeError, Encode};

/// Frames larger than this are rejected by default (8 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl MessageCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// A connection-fatal wire failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] Error),
    #[error("Frame exceeds the maximum message size of {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("Malformed bencode frame")]
    Malformed,
}

impl PartialEq for ProtocolError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(error1), Self::Io(error2)) => error1.kind() == error2.kind(),
            (Self::FrameTooLarge { max: max1 }, Self::FrameTooLarge { max: max2 }) => {
                max1 == max2
            }
            (Self::Malformed, Self::Malformed) => true,
            _ => false,
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match Message::decode(src.as_ref()) {
            Ok((rem, msg)) => {
                let consumed = src.len() - rem.len();
                src.advance(consumed);
                Ok(Some(msg))
            }
            Err(DecodeError::Incomplete) => {
                if src.len() > self.max_frame_size {
                    Err(ProtocolError::FrameTooLarge {
                        max: self.max_frame_size,
                    })
                } else {
                    Ok(None)
                }
            }
            Err(DecodeError::Failed) => Err(ProtocolError::Malformed),
        }
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&msg.dump());
        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&msg.dump());
        Ok(())
    }
}
