//! Whole-protocol conversations against a live server over TCP, with the
//! reference lisp as the embedded runtime.

use std::sync::Arc;
use std::time::Duration;

use nrepl_server::runtime::lisp::Lisp;
use nrepl_server::server::{Server, ServerConfig};
use nrepl_server::transport::{BencodeTransport, Received, Transport};
use nrepl_types::{Item, Message};

async fn start() -> (Server, BencodeTransport) {
    let server = Server::bind(ServerConfig::new(), Arc::new(Lisp::new()))
        .await
        .expect("server should bind an ephemeral port");
    let conn = BencodeTransport::connect(&format!("127.0.0.1:{}", server.port()))
        .await
        .expect("client should connect");
    (server, conn)
}

async fn recv(conn: &mut BencodeTransport) -> Message {
    match conn.recv_timeout(Duration::from_secs(10)).await.unwrap() {
        Received::Message(msg) => msg,
        other => panic!("expected a message, got {other:?}"),
    }
}

async fn clone_session(conn: &mut BencodeTransport) -> String {
    conn.send(Message::new().with("op", "clone")).await.unwrap();
    loop {
        let reply = recv(conn).await;
        if let Some(session) = reply.get_str("new-session") {
            return session.to_string();
        }
    }
}

/// Receive until the `done` response for `id`, returning everything seen on
/// the way (including untagged messages such as `need-input`).
async fn collect(conn: &mut BencodeTransport, id: &str) -> Vec<Message> {
    let mut replies = Vec::new();
    loop {
        let msg = recv(conn).await;
        let done = msg.get_str("id") == Some(id) && msg.has_status("done");
        replies.push(msg);
        if done {
            return replies;
        }
    }
}

fn eval_msg(session: &str, id: &str, code: &str) -> Message {
    Message::new()
        .with("op", "eval")
        .with("session", session)
        .with("id", id)
        .with("code", code)
}

#[tokio::test]
async fn test_simple_eval() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(&session, "i1", "(+ 1 2)")).await.unwrap();
    let replies = collect(&mut conn, "i1").await;

    let value = replies
        .iter()
        .find(|msg| msg.get_str("value").is_some())
        .expect("one response should carry the value");
    assert_eq!(value.get_str("value"), Some("3"));
    assert_eq!(value.get_str("ns"), Some("user"));
    assert_eq!(value.get_str("id"), Some("i1"));
    assert_eq!(value.session(), Some(session.as_str()));

    let done = replies.last().unwrap();
    assert!(done.has_status("done"));
    assert_eq!(done.session(), Some(session.as_str()));
}

#[tokio::test]
async fn test_eval_streams_output_before_done() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(&session, "p1", "(println \"hello\" 42)"))
        .await
        .unwrap();
    let replies = collect(&mut conn, "p1").await;

    let out_at = replies
        .iter()
        .position(|msg| msg.get_str("out").is_some())
        .expect("output should be streamed");
    assert_eq!(replies[out_at].get_str("out"), Some("hello 42\n"));
    assert_eq!(replies[out_at].get_str("id"), Some("p1"));

    let value_at = replies
        .iter()
        .position(|msg| msg.get_str("value").is_some())
        .unwrap();
    assert!(out_at < value_at, "output should precede the value");
    assert_eq!(replies[value_at].get_str("value"), Some("nil"));
}

#[tokio::test]
async fn test_eval_error_reports_and_keeps_session() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(&session, "x1", "(/ 1 0)")).await.unwrap();
    let replies = collect(&mut conn, "x1").await;

    let failure = replies
        .iter()
        .find(|msg| msg.has_status("eval-error"))
        .expect("the failure should be tagged eval-error");
    assert_eq!(failure.get_str("ex"), Some("arithmetic-error"));
    assert_eq!(failure.get_str("root-ex"), Some("arithmetic-error"));

    let diagnostic = replies
        .iter()
        .find(|msg| msg.get_str("err").is_some())
        .expect("the diagnostic should reach the error stream");
    assert!(diagnostic.get_str("err").unwrap().contains("divide by zero"));

    // The session survives and *e holds the failure.
    conn.send(eval_msg(&session, "x2", "*e")).await.unwrap();
    let replies = collect(&mut conn, "x2").await;
    let value = replies
        .iter()
        .find_map(|msg| msg.get_str("value"))
        .unwrap();
    assert!(value.contains("divide by zero"));
}

#[tokio::test]
async fn test_interrupt_orders_tags_before_done() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    // The println synchronizes: once its output arrives, the eval is
    // definitely the one running.
    conn.send(eval_msg(
        &session,
        "L",
        "(do (println \"spinning\") (loop [] (recur)))",
    ))
    .await
    .unwrap();
    loop {
        if recv(&mut conn).await.get_str("out").is_some() {
            break;
        }
    }

    conn.send(
        Message::new()
            .with("op", "interrupt")
            .with("session", session.as_str())
            .with("interrupt-id", "L")
            .with("id", "K"),
    )
    .await
    .unwrap();

    // Sequence: interrupted(L) -> done(K) -> done(L).
    let mut order = Vec::new();
    while order.len() < 3 {
        let msg = recv(&mut conn).await;
        if msg.has_status("interrupted") {
            assert_eq!(msg.get_str("id"), Some("L"));
            order.push("interrupted");
        } else if msg.has_status("done") {
            order.push(if msg.get_str("id") == Some("K") {
                "done-k"
            } else {
                "done-l"
            });
        }
    }
    assert_eq!(order, vec!["interrupted", "done-k", "done-l"]);
}

#[tokio::test]
async fn test_interrupt_idle_session() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(
        Message::new()
            .with("op", "interrupt")
            .with("session", session.as_str())
            .with("id", "k1"),
    )
    .await
    .unwrap();
    let replies = collect(&mut conn, "k1").await;

    assert!(replies.last().unwrap().has_status("session-idle"));
}

#[tokio::test]
async fn test_interrupt_id_mismatch() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(
        &session,
        "slow",
        "(do (println \"running\") (sleep 60000))",
    ))
    .await
    .unwrap();
    loop {
        if recv(&mut conn).await.get_str("out").is_some() {
            break;
        }
    }

    conn.send(
        Message::new()
            .with("op", "interrupt")
            .with("session", session.as_str())
            .with("interrupt-id", "someone-else")
            .with("id", "k1"),
    )
    .await
    .unwrap();
    let replies = collect(&mut conn, "k1").await;
    let last = replies.last().unwrap();
    assert!(last.has_status("error"));
    assert!(last.has_status("interrupt-id-mismatch"));

    // Clean up: a matching interrupt stops the sleeper.
    conn.send(
        Message::new()
            .with("op", "interrupt")
            .with("session", session.as_str())
            .with("id", "k2"),
    )
    .await
    .unwrap();
    collect(&mut conn, "slow").await;
}

#[tokio::test]
async fn test_stdin_round_trip() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(&session, "r1", "(read-line)")).await.unwrap();

    // The blocked read announces need-input first.
    loop {
        let msg = recv(&mut conn).await;
        if msg.has_status("need-input") {
            assert_eq!(msg.session(), Some(session.as_str()));
            break;
        }
    }

    conn.send(
        Message::new()
            .with("op", "stdin")
            .with("session", session.as_str())
            .with("stdin", "hello\n")
            .with("id", "s1"),
    )
    .await
    .unwrap();

    let mut saw_stdin_done = false;
    let mut saw_eval_done = false;
    let mut value = None;
    while !(saw_stdin_done && saw_eval_done) {
        let msg = recv(&mut conn).await;
        if msg.get_str("id") == Some("s1") && msg.has_status("done") {
            saw_stdin_done = true;
        }
        if let Some(got) = msg.get_str("value") {
            value = Some(got.to_string());
        }
        if msg.get_str("id") == Some("r1") && msg.has_status("done") {
            saw_eval_done = true;
        }
    }
    assert_eq!(value.as_deref(), Some("\"hello\""));
}

#[tokio::test]
async fn test_ls_sessions_and_close() {
    let (_server, mut conn) = start().await;
    let s1 = clone_session(&mut conn).await;
    let s2 = clone_session(&mut conn).await;

    conn.send(Message::new().with("op", "ls-sessions").with("id", "ls1"))
        .await
        .unwrap();
    let replies = collect(&mut conn, "ls1").await;
    let mut listed: Vec<&str> = replies
        .last()
        .unwrap()
        .get("sessions")
        .unwrap()
        .as_list()
        .unwrap()
        .iter()
        .filter_map(Item::as_str)
        .collect();
    listed.sort_unstable();
    let mut expected = vec![s1.as_str(), s2.as_str()];
    expected.sort_unstable();
    assert_eq!(listed, expected);

    conn.send(
        Message::new()
            .with("op", "close")
            .with("session", s1.as_str())
            .with("id", "c1"),
    )
    .await
    .unwrap();
    let replies = collect(&mut conn, "c1").await;
    assert!(replies.last().unwrap().has_status("session-closed"));

    conn.send(Message::new().with("op", "ls-sessions").with("id", "ls2"))
        .await
        .unwrap();
    let replies = collect(&mut conn, "ls2").await;
    let listed: Vec<&str> = replies
        .last()
        .unwrap()
        .get("sessions")
        .unwrap()
        .as_list()
        .unwrap()
        .iter()
        .filter_map(Item::as_str)
        .collect();
    assert_eq!(listed, vec![s2.as_str()]);
}

#[tokio::test]
async fn test_unknown_op_falls_through() {
    let (_server, mut conn) = start().await;

    conn.send(Message::new().with("op", "launch-missiles").with("id", "u1"))
        .await
        .unwrap();
    let replies = collect(&mut conn, "u1").await;

    let last = replies.last().unwrap();
    assert!(last.has_status("error"));
    assert!(last.has_status("unknown-op"));
    assert_eq!(last.get_str("op"), Some("launch-missiles"));
}

#[tokio::test]
async fn test_unknown_session_is_reported() {
    let (_server, mut conn) = start().await;

    conn.send(
        Message::new()
            .with("op", "eval")
            .with("session", "no-such-session")
            .with("code", "1")
            .with("id", "u2"),
    )
    .await
    .unwrap();
    let replies = collect(&mut conn, "u2").await;

    assert!(replies.last().unwrap().has_status("unknown-session"));
}

#[tokio::test]
async fn test_eval_without_code() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(
        Message::new()
            .with("op", "eval")
            .with("session", session.as_str())
            .with("id", "n1"),
    )
    .await
    .unwrap();
    let replies = collect(&mut conn, "n1").await;

    let last = replies.last().unwrap();
    assert!(last.has_status("error"));
    assert!(last.has_status("no-code"));
}

#[tokio::test]
async fn test_eval_in_missing_namespace() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(&session, "ns1", "1").with("ns", "no-such-ns"))
        .await
        .unwrap();
    let replies = collect(&mut conn, "ns1").await;

    assert!(replies.last().unwrap().has_status("namespace-not-found"));
}

#[tokio::test]
async fn test_describe_lists_ops_and_versions() {
    let (_server, mut conn) = start().await;

    conn.send(Message::new().with("op", "describe").with("id", "d1"))
        .await
        .unwrap();
    let replies = collect(&mut conn, "d1").await;
    let reply = replies.last().unwrap();

    let Some(Item::Map(ops)) = reply.get("ops") else {
        panic!("describe should return an ops map");
    };
    for op in ["clone", "close", "describe", "eval", "interrupt", "load-file", "ls-sessions", "stdin"] {
        assert!(ops.contains_key(op), "missing op {op}");
    }

    let Some(Item::Map(versions)) = reply.get("versions") else {
        panic!("describe should return versions");
    };
    let Some(Item::Map(server_version)) = versions.get("nrepl-server") else {
        panic!("versions should include the server");
    };
    assert!(server_version.contains_key("version-string"));
    assert!(versions.contains_key("mini-lisp"));
}

#[tokio::test]
async fn test_describe_verbose_includes_docs() {
    let (_server, mut conn) = start().await;

    conn.send(
        Message::new()
            .with("op", "describe")
            .with("verbose?", "true")
            .with("id", "d2"),
    )
    .await
    .unwrap();
    let replies = collect(&mut conn, "d2").await;

    let Some(Item::Map(ops)) = replies.last().unwrap().get("ops") else {
        panic!("describe should return an ops map");
    };
    let Some(Item::Map(eval_info)) = ops.get("eval") else {
        panic!("eval should be described");
    };
    assert!(matches!(eval_info.get("doc"), Some(Item::Str(doc)) if !doc.is_empty()));
}

#[tokio::test]
async fn test_load_file_behaves_like_eval() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(
        Message::new()
            .with("op", "load-file")
            .with("session", session.as_str())
            .with("file", "(def fortytwo 42) (* fortytwo 2)")
            .with("file-name", "fortytwo.l")
            .with("id", "f1"),
    )
    .await
    .unwrap();
    let replies = collect(&mut conn, "f1").await;

    let values: Vec<&str> = replies
        .iter()
        .filter_map(|msg| msg.get_str("value"))
        .collect();
    assert_eq!(values, vec!["fortytwo", "84"]);
    assert!(replies.last().unwrap().has_status("done"));
}

#[tokio::test]
async fn test_evals_in_one_session_are_fifo() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(&session, "a", "(do (sleep 100) 1)"))
        .await
        .unwrap();
    conn.send(eval_msg(&session, "b", "2")).await.unwrap();

    let mut done_order = Vec::new();
    while done_order.len() < 2 {
        let msg = recv(&mut conn).await;
        if msg.has_status("done") {
            done_order.push(msg.get_str("id").unwrap().to_string());
        }
    }
    assert_eq!(done_order, vec!["a", "b"]);
}

#[tokio::test]
async fn test_session_state_persists_between_requests() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(&session, "s1", "(def x 21)")).await.unwrap();
    collect(&mut conn, "s1").await;

    conn.send(eval_msg(&session, "s2", "(* x 2)")).await.unwrap();
    let replies = collect(&mut conn, "s2").await;
    assert_eq!(
        replies.iter().find_map(|msg| msg.get_str("value")),
        Some("42")
    );

    // Result slots rotate across requests.
    conn.send(eval_msg(&session, "s3", "(+ *1 *1)")).await.unwrap();
    let replies = collect(&mut conn, "s3").await;
    assert_eq!(
        replies.iter().find_map(|msg| msg.get_str("value")),
        Some("84")
    );
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (_server, mut conn) = start().await;
    let s1 = clone_session(&mut conn).await;

    conn.send(eval_msg(&s1, "p1", "7")).await.unwrap();
    collect(&mut conn, "p1").await;

    // Cloning from s1 snapshots its result slots; mutating the child does
    // not touch the parent.
    conn.send(
        Message::new()
            .with("op", "clone")
            .with("session", s1.as_str())
            .with("id", "c2"),
    )
    .await
    .unwrap();
    let replies = collect(&mut conn, "c2").await;
    let s2 = replies
        .iter()
        .find_map(|msg| msg.get_str("new-session"))
        .unwrap()
        .to_string();

    conn.send(eval_msg(&s2, "p2", "100")).await.unwrap();
    collect(&mut conn, "p2").await;

    conn.send(eval_msg(&s2, "p3", "*1")).await.unwrap();
    let replies = collect(&mut conn, "p3").await;
    assert_eq!(
        replies.iter().find_map(|msg| msg.get_str("value")),
        Some("100")
    );

    conn.send(eval_msg(&s1, "p4", "*1")).await.unwrap();
    let replies = collect(&mut conn, "p4").await;
    assert_eq!(
        replies.iter().find_map(|msg| msg.get_str("value")),
        Some("7")
    );
}

#[tokio::test]
async fn test_namespace_switch_is_sticky() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(&session, "n1", "(in-ns 'scratch)"))
        .await
        .unwrap();
    collect(&mut conn, "n1").await;

    conn.send(eval_msg(&session, "n2", "1")).await.unwrap();
    let replies = collect(&mut conn, "n2").await;
    let value = replies
        .iter()
        .find(|msg| msg.get_str("value").is_some())
        .unwrap();
    assert_eq!(value.get_str("ns"), Some("scratch"));
}

#[tokio::test]
async fn test_eval_without_session_is_ephemeral() {
    let (_server, mut conn) = start().await;

    conn.send(
        Message::new()
            .with("op", "eval")
            .with("code", "(+ 20 22)")
            .with("id", "e1"),
    )
    .await
    .unwrap();
    let replies = collect(&mut conn, "e1").await;

    let value = replies
        .iter()
        .find(|msg| msg.get_str("value").is_some())
        .unwrap();
    assert_eq!(value.get_str("value"), Some("42"));
    let ephemeral = value.session().unwrap().to_string();

    // The throwaway session was never registered.
    conn.send(Message::new().with("op", "ls-sessions").with("id", "ls"))
        .await
        .unwrap();
    let replies = collect(&mut conn, "ls").await;
    let listed = replies.last().unwrap();
    let ids: Vec<&str> = listed
        .get("sessions")
        .unwrap()
        .as_list()
        .unwrap()
        .iter()
        .filter_map(Item::as_str)
        .collect();
    assert!(!ids.contains(&ephemeral.as_str()));
}

#[tokio::test]
async fn test_ack_announces_listening_port() {
    let ack_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ack_port = ack_listener.local_addr().unwrap().port();
    let ack = tokio::spawn(async move {
        let (stream, _) = ack_listener.accept().await.unwrap();
        let mut transport = BencodeTransport::new(stream);
        transport.recv().await.unwrap().unwrap()
    });

    let server = Server::bind(
        ServerConfig::new().ack_port(ack_port),
        Arc::new(Lisp::new()),
    )
    .await
    .unwrap();

    let msg = ack.await.unwrap();
    assert_eq!(msg.op(), Some("ack"));
    assert_eq!(msg.get_int("port"), Some(i64::from(server.port())));
}

#[tokio::test]
async fn test_interrupt_wakes_blocked_stdin_read() {
    let (_server, mut conn) = start().await;
    let session = clone_session(&mut conn).await;

    conn.send(eval_msg(&session, "r1", "(read-line)")).await.unwrap();
    loop {
        if recv(&mut conn).await.has_status("need-input") {
            break;
        }
    }

    conn.send(
        Message::new()
            .with("op", "interrupt")
            .with("session", session.as_str())
            .with("id", "k1"),
    )
    .await
    .unwrap();

    let mut order = Vec::new();
    while order.len() < 3 {
        let msg = recv(&mut conn).await;
        if msg.has_status("interrupted") {
            order.push("interrupted");
        } else if msg.has_status("done") {
            order.push(if msg.get_str("id") == Some("k1") {
                "done-interrupt"
            } else {
                "done-eval"
            });
        }
    }
    assert_eq!(order, vec!["interrupted", "done-interrupt", "done-eval"]);
}
