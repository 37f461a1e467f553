//! The server: accept loop, per-connection message pumps, and the default
//! middleware stack.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use nrepl_types::Message;

use crate::framing::{MessageCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::middleware::{
    describe::Describe, eval::InterruptibleEval, load_file::LoadFile, print::PrValues,
    session::SessionMiddleware, stdin::AddStdin, Middleware, Request, Stack, StackError,
};
use crate::runtime::Runtime;
use crate::session::Registry;
use crate::transport::{BencodeTransport, Outbound, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// When set, connect to `127.0.0.1:<ack_port>` after binding and
    /// announce the listening port. Used by tooling that starts servers and
    /// needs to learn where they ended up.
    pub ack_port: Option<u16>,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            ack_port: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    #[must_use]
    pub fn ack_port(mut self, port: u16) -> Self {
        self.ack_port = Some(port);
        self
    }

    #[must_use]
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }
}

/// The default middleware stack: sessions outermost, evaluation innermost.
pub fn default_stack(runtime: Arc<dyn Runtime>) -> Result<Stack, StackError> {
    Stack::new(vec![
        SessionMiddleware::new(runtime.base_namespace()) as Arc<dyn Middleware>,
        PrValues::new(),
        LoadFile::new(),
        AddStdin::new(),
        Describe::new(Arc::clone(&runtime)),
        InterruptibleEval::new(runtime),
    ])
}

/// A running server.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Bind, send the ack if asked to, and start accepting connections with
    /// the default middleware stack.
    pub async fn bind(config: ServerConfig, runtime: Arc<dyn Runtime>) -> Result<Self, ServerError> {
        let stack = default_stack(runtime)?;
        Self::bind_with_stack(config, stack).await
    }

    pub async fn bind_with_stack(config: ServerConfig, stack: Stack) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {local_addr}");

        if let Some(ack_port) = config.ack_port {
            if let Err(err) = send_ack(local_addr.port(), ack_port).await {
                warn!("could not ack to port {ack_port}: {err}");
            }
        }

        let stack = Arc::new(stack);
        let registry = Arc::new(Registry::default());
        let shutdown = CancellationToken::new();

        let accept_task = {
            let shutdown = shutdown.clone();
            let max_frame_size = config.max_frame_size;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!("connection from {peer}");
                                tokio::spawn(handle_connection(
                                    stream,
                                    max_frame_size,
                                    Arc::clone(&stack),
                                    Arc::clone(&registry),
                                    shutdown.child_token(),
                                ));
                            }
                            Err(err) => warn!("accept failed: {err}"),
                        },
                    }
                }
            })
        };

        Ok(Self {
            local_addr,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and tear down connection read loops. Evaluations
    /// already running drain on their own.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.accept_task.await;
    }
}

async fn handle_connection<S>(
    stream: S,
    max_frame_size: usize,
    stack: Arc<Stack>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = Framed::new(stream, MessageCodec::new(max_frame_size)).split();

    // All producers funnel into one writer task, which keeps concurrent
    // senders well-framed. It ends when the last Outbound clone drops,
    // letting queued tail responses flush first.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(err) = sink.send(msg).await {
                debug!("connection write failed: {err}");
                break;
            }
        }
    });
    let outbound = Arc::new(Outbound::new(tx));

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            next = source.next() => match next {
                Some(Ok(msg)) => {
                    let req = Request::new(
                        msg,
                        Arc::clone(&outbound) as Arc<dyn crate::transport::Responder>,
                        Arc::clone(&registry),
                    );
                    // Handlers finish fast: evaluations are queued onto the
                    // session's executor, not run here. Dispatching inline
                    // keeps admission in arrival order.
                    if let Err(err) = stack.dispatch(req).await {
                        // The request is dropped; the connection lives.
                        warn!("handler failed: {err}");
                    }
                }
                Some(Err(err)) => {
                    warn!("protocol error, closing connection: {err}");
                    break;
                }
                None => {
                    debug!("peer disconnected");
                    break;
                }
            },
        }
    }
}

/// Announce a freshly bound server to waiting tooling.
pub async fn send_ack(my_port: u16, ack_port: u16) -> Result<(), ServerError> {
    let transport = BencodeTransport::connect(&format!("127.0.0.1:{ack_port}")).await?;
    transport
        .send(
            Message::new()
                .with("op", "ack")
                .with("port", i64::from(my_port)),
        )
        .await?;
    Ok(())
}
