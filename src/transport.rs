//! Message transports.
//!
//! A [`Transport`] is a bidirectional, message-framed channel. Two concrete
//! transports exist: [`BencodeTransport`] over any byte stream (normally a
//! TCP socket), and [`PairTransport`] — two in-memory queues crossed — for
//! tests and in-process embedding.
//!
//! On the server side, the write half of a connection is owned by a single
//! writer task and shared as an [`Outbound`] handle; anything that emits
//! responses does so through a [`Responder`], which middleware may wrap to
//! post-process outgoing messages.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use nrepl_types::Message;

use crate::framing::MessageCodec;
use crate::runtime::RuntimeValue;

/// Capacity of the inbound mailbox between the reader task and `recv`.
const MAILBOX_BOUND: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer sent bytes that do not parse. Fatal: every subsequent
    /// `recv` returns this again.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(String),
    /// `send` after the channel is gone.
    #[error("Transport closed")]
    Closed,
}

/// Outcome of a `recv` bounded by a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(Message),
    /// The channel is closed. Sticky: every later call reports it again.
    Eof,
    /// Nothing arrived in time. Does not poison the channel.
    TimedOut,
}

pub trait Transport: Send + Debug {
    /// Send one message. Safe to call from any number of producers; the
    /// transport serializes writes.
    fn send(&self, msg: Message) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Receive the next message; `Ok(None)` is EOF, and stays EOF.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Message>, TransportError>>;

    /// Receive with a timeout.
    fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Received, TransportError>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.recv()).await {
                Ok(Ok(Some(msg))) => Ok(Received::Message(msg)),
                Ok(Ok(None)) => Ok(Received::Eof),
                Ok(Err(err)) => Err(err),
                Err(_) => Ok(Received::TimedOut),
            }
        })
    }
}

// -------------------------------------------------------------------------------------------------

#[derive(Debug)]
enum Event {
    Message(Message),
    Failed(TransportError),
}

/// A bencode-framed transport over a byte stream.
///
/// A background reader task decodes one message at a time into a bounded
/// mailbox; stream end posts EOF, a decode failure poisons the channel. The
/// write side is serialized through a writer task, so `send` is safe from
/// any number of producers.
#[derive(Debug)]
pub struct BencodeTransport {
    outgoing: mpsc::UnboundedSender<Message>,
    incoming: mpsc::Receiver<Event>,
    poisoned: Option<TransportError>,
    eof: bool,
}

impl BencodeTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_codec(stream, MessageCodec::default())
    }

    pub fn with_codec<S>(stream: S, codec: MessageCodec) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut source) = Framed::new(stream, codec).split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (incoming_tx, incoming) = mpsc::channel(MAILBOX_BOUND);

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if let Err(err) = sink.send(msg).await {
                    warn!("transport write failed: {err}");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(msg)) => {
                        if incoming_tx.send(Event::Message(msg)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!("transport read failed: {err}");
                        let _ = incoming_tx
                            .send(Event::Failed(TransportError::Protocol(err.to_string())))
                            .await;
                        break;
                    }
                    // Stream end: dropping the sender is the EOF sentinel.
                    None => break,
                }
            }
        });

        Self {
            outgoing,
            incoming,
            poisoned: None,
            eof: false,
        }
    }

    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

impl Transport for BencodeTransport {
    fn send(&self, msg: Message) -> BoxFuture<'_, Result<(), TransportError>> {
        let result = self
            .outgoing
            .send(msg)
            .map_err(|_| TransportError::Closed);
        Box::pin(async move { result })
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Message>, TransportError>> {
        Box::pin(async move {
            if let Some(err) = &self.poisoned {
                return Err(err.clone());
            }
            if self.eof {
                return Ok(None);
            }
            match self.incoming.recv().await {
                Some(Event::Message(msg)) => Ok(Some(msg)),
                Some(Event::Failed(err)) => {
                    self.poisoned = Some(err.clone());
                    Err(err)
                }
                None => {
                    self.eof = true;
                    Ok(None)
                }
            }
        })
    }
}

// -------------------------------------------------------------------------------------------------

/// Two in-memory queues crossed.
#[derive(Debug)]
pub struct PairTransport {
    outgoing: mpsc::UnboundedSender<Message>,
    incoming: mpsc::UnboundedReceiver<Message>,
}

impl PairTransport {
    /// Create both ends of a connected pair.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        (
            Self {
                outgoing: tx_a,
                incoming: rx_b,
            },
            Self {
                outgoing: tx_b,
                incoming: rx_a,
            },
        )
    }
}

impl Transport for PairTransport {
    fn send(&self, msg: Message) -> BoxFuture<'_, Result<(), TransportError>> {
        let result = self
            .outgoing
            .send(msg)
            .map_err(|_| TransportError::Closed);
        Box::pin(async move { result })
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Message>, TransportError>> {
        // `recv` on a closed queue keeps returning `None`, which is exactly
        // the sticky EOF contract.
        Box::pin(async move { Ok(self.incoming.recv().await) })
    }
}

// -------------------------------------------------------------------------------------------------

/// An outgoing message, possibly still carrying the unrendered result value
/// of an evaluation. Rendering is the business of the `pr-values`
/// middleware; the terminal sender falls back to the readable rendering if
/// nothing rendered it earlier.
#[derive(Debug)]
pub struct Outgoing {
    pub msg: Message,
    pub value: Option<Arc<dyn RuntimeValue>>,
}

impl From<Message> for Outgoing {
    fn from(msg: Message) -> Self {
        Self { msg, value: None }
    }
}

/// Anything that can carry a response back to the peer.
///
/// Middleware may wrap the request's responder to post-process every
/// outgoing message (`pr-values` does). The chain always terminates in an
/// [`Outbound`].
pub trait Responder: Send + Sync {
    fn send(&self, out: Outgoing);
}

impl Debug for dyn Responder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Responder")
    }
}

/// The shared send handle of one server connection.
///
/// Cloneable and cheap; all clones funnel into the connection's single
/// writer task, which keeps concurrent producers well-framed. Sending to a
/// connection that died is deliberately silent: draining evaluations may
/// outlive their client.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// An outbound handle whose messages go nowhere. Used for sessions whose
    /// connection is already gone.
    pub fn sink() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

impl Responder for Outbound {
    fn send(&self, out: Outgoing) {
        let Outgoing { mut msg, value } = out;
        if let Some(value) = value {
            msg.insert("value", value.readable());
        }
        if self.tx.send(msg).is_err() {
            debug!("dropping response for a closed connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use nrepl_types::Status;

    use super::*;

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (client, mut server) = PairTransport::pair();

        client
            .send(Message::new().with("op", "describe"))
            .await
            .unwrap();

        let got = server.recv().await.unwrap().unwrap();
        assert_eq!(got.op(), Some("describe"));
    }

    #[tokio::test]
    async fn test_pair_eof_is_sticky() {
        let (client, mut server) = PairTransport::pair();
        drop(client);

        assert_eq!(server.recv().await.unwrap(), None);
        assert_eq!(server.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pair_recv_timeout() {
        let (client, mut server) = PairTransport::pair();

        assert_eq!(
            server.recv_timeout(Duration::from_millis(10)).await.unwrap(),
            Received::TimedOut
        );

        // A timeout does not poison the channel.
        client
            .send(Message::new().with("op", "describe"))
            .await
            .unwrap();
        let got = server.recv_timeout(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(got, Received::Message(_)));
    }

    #[tokio::test]
    async fn test_bencode_transport_round_trip() {
        let (near, far) = tokio::io::duplex(1024);
        let mut a = BencodeTransport::new(near);
        let mut b = BencodeTransport::new(far);

        a.send(Message::new().with("op", "clone").with("id", "1"))
            .await
            .unwrap();
        let got = b.recv().await.unwrap().unwrap();
        assert_eq!(got.op(), Some("clone"));

        b.send(got.reply().with("new-session", "s1").with_status([Status::Done]))
            .await
            .unwrap();
        let reply = a.recv().await.unwrap().unwrap();
        assert_eq!(reply.get_str("new-session"), Some("s1"));
        assert_eq!(reply.get_str("id"), Some("1"));
    }

    #[tokio::test]
    async fn test_bencode_transport_poisons_on_garbage() {
        let (near, far) = tokio::io::duplex(1024);
        let mut transport = BencodeTransport::new(near);

        use tokio::io::AsyncWriteExt;
        let (_read_half, mut write_half) = tokio::io::split(far);
        write_half.write_all(b"i-0e").await.unwrap();
        write_half.flush().await.unwrap();

        let first = transport.recv().await;
        assert!(matches!(first, Err(TransportError::Protocol(_))));

        // The failure is sticky.
        let second = transport.recv().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_bencode_transport_eof() {
        let (near, far) = tokio::io::duplex(1024);
        let mut transport = BencodeTransport::new(near);
        drop(far);

        assert_eq!(transport.recv().await.unwrap(), None);
        assert_eq!(transport.recv().await.unwrap(), None);
    }
}
