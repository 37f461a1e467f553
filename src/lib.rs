#![deny(missing_debug_implementations)]

//! Server framework for the nREPL protocol.
//!
//! nREPL is a message-oriented protocol for driving an embedded language
//! runtime from remote tooling: editors, build tools, scripts. Clients send
//! bencode-framed request maps; the server answers each request with a
//! stream of response maps that ends in a `done` status. This crate
//! provides the protocol core:
//!
//! - [`codec`] — strict bencode reading and writing, binary-safe;
//! - [`framing`] — `tokio_util::codec` integration for framed streams;
//! - [`transport`] — message channels with timeouts and sticky EOF;
//! - [`middleware`] — the composable request pipeline, linearized from
//!   declared dependencies;
//! - [`session`] — persistent per-client evaluation state and stream
//!   routing;
//! - [`eval`] — the per-session FIFO executor and the interruptible
//!   evaluation task;
//! - [`runtime`] — the trait the embedded language implements, plus a small
//!   reference lisp;
//! - [`server`] — the accept loop tying it all together.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nrepl_server::runtime::lisp::Lisp;
//! use nrepl_server::server::{Server, ServerConfig};
//! use nrepl_server::transport::{BencodeTransport, Transport};
//! use nrepl_types::Message;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::new(), Arc::new(Lisp::new())).await?;
//!
//!     let mut conn =
//!         BencodeTransport::connect(&format!("127.0.0.1:{}", server.port())).await?;
//!     conn.send(Message::new().with("op", "clone")).await?;
//!     let reply = conn.recv().await?.expect("server hung up");
//!     println!("new session: {:?}", reply.get_str("new-session"));
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod eval;
pub mod framing;
pub mod middleware;
pub mod runtime;
pub mod server;
pub mod session;
pub mod testing;
pub mod transport;

pub use nrepl_types;
pub use nrepl_types as types;
