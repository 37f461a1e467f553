use anyhow::{bail, Context, Error};
use nrepl_server::transport::{BencodeTransport, Transport};
use nrepl_types::Message;
use tokio::io::{AsyncBufReadExt, BufReader};

// Poor human's REPL client: one session, one eval per line of stdin.
#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .context("USAGE: tokio_client <host>:<port>")?;

    let mut conn = BencodeTransport::connect(&addr)
        .await
        .context(format!("Could not connect to `{addr}`"))?;

    conn.send(Message::new().with("op", "clone")).await?;
    let session = loop {
        let Some(reply) = conn.recv().await? else {
            bail!("Connection closed before the session was cloned");
        };
        if let Some(session) = reply.get_str("new-session") {
            break session.to_string();
        }
    };
    println!("session {session}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut counter = 0u64;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        counter += 1;
        let id = format!("eval-{counter}");
        conn.send(
            Message::new()
                .with("op", "eval")
                .with("code", line.as_str())
                .with("session", session.as_str())
                .with("id", id.as_str()),
        )
        .await?;

        loop {
            let Some(reply) = conn.recv().await? else {
                bail!("Server hung up mid-response");
            };
            if let Some(out) = reply.get_str("out") {
                print!("{out}");
            }
            if let Some(err) = reply.get_str("err") {
                eprint!("{err}");
            }
            if let Some(value) = reply.get_str("value") {
                println!("{value}");
            }
            if reply.has_status("need-input") {
                println!("(server is waiting for stdin; send it with the stdin op)");
            }
            if reply.get_str("id") == Some(id.as_str()) && reply.has_status("done") {
                break;
            }
        }
    }

    Ok(())
}
