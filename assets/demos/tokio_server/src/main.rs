use std::sync::Arc;

use anyhow::{Context, Error};
use nrepl_server::runtime::lisp::Lisp;
use nrepl_server::server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .context("USAGE: tokio_server <host>:<port> [ack-port]")?;

    let mut config = ServerConfig::new().bind(&addr);
    if let Some(ack_port) = std::env::args().nth(2) {
        config = config.ack_port(
            ack_port
                .parse()
                .context("ack-port must be a port number")?,
        );
    }

    let server = Server::bind(config, Arc::new(Lisp::new()))
        .await
        .context(format!("Could not bind to `{addr}`"))?;
    println!("nREPL server listening on {}", server.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Could not install the shutdown signal")?;
    server.shutdown().await;

    Ok(())
}
