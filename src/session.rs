//! Sessions: named, persistent evaluation state.
//!
//! A session owns a snapshot of dynamic bindings (current namespace, the
//! last three results, the last exception, the output buffer limit) plus the
//! stream adapters that tie the runtime's standard I/O back to the protocol.
//! Sessions live in a [`Registry`] keyed by UUID; `clone` puts them there,
//! `close` takes them out, and a request without a `session` key gets an
//! ephemeral session that is never registered at all.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use nrepl_types::{Message, Status};

use crate::eval::Executor;
use crate::runtime::{Exception, InterruptFlag, LineSource, RuntimeValue};
use crate::transport::Responder;

/// Baseline output buffer limit, in bytes.
pub const DEFAULT_OUT_LIMIT: usize = 1024;

/// The dynamic bindings of a session, snapshotted into each evaluation and
/// merged back when it completes.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    pub ns: String,
    /// `*1`, `*2`, `*3`: most recent first.
    pub results: [Option<Arc<dyn RuntimeValue>>; 3],
    /// `*e`.
    pub last_exception: Option<Exception>,
    pub out_limit: usize,
}

impl Bindings {
    pub fn baseline(ns: &str) -> Self {
        Self {
            ns: ns.to_string(),
            results: Default::default(),
            last_exception: None,
            out_limit: DEFAULT_OUT_LIMIT,
        }
    }

    /// Rotate the result slots: `*2 → *3`, `*1 → *2`, `value → *1`.
    pub fn rotate_results(&mut self, value: Arc<dyn RuntimeValue>) {
        self.results[2] = self.results[1].take();
        self.results[1] = self.results[0].take();
        self.results[0] = Some(value);
    }
}

/// The eval currently running in a session, if any.
#[derive(Debug, Clone)]
pub struct CurrentEval {
    /// The `id` of the `eval` request being executed.
    pub msg_id: Option<String>,
    pub interrupt: Arc<InterruptFlag>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    bindings: Mutex<Bindings>,
    stdout: OutputSink,
    stderr: OutputSink,
    stdin: StdinPipe,
    current: Mutex<Option<CurrentEval>>,
    executor: Arc<Executor>,
}

impl Session {
    /// Create a session, snapshotting `parent`'s bindings when given and the
    /// baseline otherwise. The stream adapters bind to `responder` and the
    /// fresh id.
    pub fn create(
        parent: Option<&Session>,
        base_ns: &str,
        responder: Arc<dyn Responder>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let bindings = match parent {
            Some(parent) => parent.snapshot(),
            None => Bindings::baseline(base_ns),
        };
        let out_limit = bindings.out_limit;

        Arc::new(Self {
            stdout: OutputSink::new(&id, "out", out_limit, Arc::clone(&responder)),
            stderr: OutputSink::new(&id, "err", out_limit, Arc::clone(&responder)),
            stdin: StdinPipe::new(&id, responder),
            id: id.clone(),
            bindings: Mutex::new(bindings),
            current: Mutex::new(None),
            executor: Arc::new(Executor::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn executor(&self) -> Arc<Executor> {
        Arc::clone(&self.executor)
    }

    pub fn snapshot(&self) -> Bindings {
        self.bindings.lock().expect("bindings poisoned").clone()
    }

    /// Merge an evaluation's mutated bindings back into the session.
    pub fn store(&self, bindings: Bindings) {
        *self.bindings.lock().expect("bindings poisoned") = bindings;
    }

    pub fn stdout(&self) -> &OutputSink {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputSink {
        &self.stderr
    }

    pub fn stdin(&self) -> &StdinPipe {
        &self.stdin
    }

    /// Mark an eval as running: record its message id, hand out a fresh
    /// interrupt flag, and point the stream adapters at the new request.
    pub fn begin_eval(&self, msg_id: Option<String>) -> Arc<InterruptFlag> {
        let interrupt = Arc::new(InterruptFlag::default());
        self.stdout.set_request(msg_id.clone());
        self.stderr.set_request(msg_id.clone());
        *self.current.lock().expect("current poisoned") = Some(CurrentEval {
            msg_id,
            interrupt: Arc::clone(&interrupt),
        });
        interrupt
    }

    /// Clear the running mark. The stream adapters keep the finished eval's
    /// id until the next one begins: output produced afterwards (say, from a
    /// thread the eval spawned) still gets attributed to it.
    pub fn end_eval(&self) {
        *self.current.lock().expect("current poisoned") = None;
    }

    pub fn current_eval(&self) -> Option<CurrentEval> {
        self.current.lock().expect("current poisoned").clone()
    }
}

/// Process-wide map of registered sessions.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry poisoned")
            .get(id)
            .cloned()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .expect("registry poisoned")
            .insert(session.id().to_string(), session);
    }

    /// Drop the record. Outstanding evaluations keep their handle and
    /// drain; only the registry forgets the id.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().expect("registry poisoned").remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expect("registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

// -------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct SinkState {
    buf: Vec<u8>,
    request_id: Option<String>,
}

/// A buffered writer for one standard stream of one session.
///
/// Bytes accumulate until `flush`, or until the buffer crosses the session's
/// `out-limit`; a drain sends `{session, out|err, id?}` through the
/// session's responder, tagged with the request currently evaluating.
#[derive(Debug)]
pub struct OutputSink {
    session_id: String,
    kind: &'static str,
    limit: usize,
    responder: Arc<dyn Responder>,
    state: Mutex<SinkState>,
}

impl OutputSink {
    fn new(
        session_id: &str,
        kind: &'static str,
        limit: usize,
        responder: Arc<dyn Responder>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            limit,
            responder,
            state: Mutex::new(SinkState {
                buf: Vec::new(),
                request_id: None,
            }),
        }
    }

    fn set_request(&self, request_id: Option<String>) {
        self.state.lock().expect("sink poisoned").request_id = request_id;
    }

    /// Drain the buffer and ship it, atomically.
    pub fn flush(&self) {
        let (text, request_id) = {
            let mut state = self.state.lock().expect("sink poisoned");
            if state.buf.is_empty() {
                return;
            }
            let drained = std::mem::take(&mut state.buf);
            (
                String::from_utf8_lossy(&drained).into_owned(),
                state.request_id.clone(),
            )
        };

        let mut msg = Message::new()
            .with("session", self.session_id.as_str())
            .with(self.kind, text);
        if let Some(id) = request_id {
            msg.insert("id", id);
        }
        self.responder.send(msg.into());
    }

    /// A [`Write`] view over this sink, for handing to the runtime.
    pub fn writer(&self) -> SinkWriter<'_> {
        SinkWriter(self)
    }
}

#[derive(Debug)]
pub struct SinkWriter<'a>(&'a OutputSink);

impl Write for SinkWriter<'_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let over_limit = {
            let mut state = self.0.state.lock().expect("sink poisoned");
            state.buf.extend_from_slice(bytes);
            state.buf.len() >= self.0.limit
        };
        if over_limit {
            self.0.flush();
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush();
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// The fed standard-input pipe of a session.
///
/// The `stdin` op appends text on the async side; the runtime reads lines on
/// its worker thread. A read that would block first announces
/// `{session, status: need-input}` so the client knows to send some.
pub struct StdinPipe {
    session_id: String,
    responder: Arc<dyn Responder>,
    tx: mpsc::UnboundedSender<()>,
    rx: Mutex<mpsc::UnboundedReceiver<()>>,
    pending: Mutex<VecDeque<u8>>,
}

impl std::fmt::Debug for StdinPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinPipe")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl StdinPipe {
    fn new(session_id: &str, responder: Arc<dyn Responder>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.to_string(),
            responder,
            tx,
            rx: Mutex::new(rx),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Append input text. Called by the `stdin` op handler.
    pub fn feed(&self, text: &str) {
        self.pending
            .lock()
            .expect("stdin poisoned")
            .extend(text.as_bytes());
        let _ = self.tx.send(());
    }

    /// Wake a read blocked in [`StdinReader::read_line`] so the evaluation
    /// can observe its interrupt flag.
    pub fn notify_interrupt(&self) {
        let _ = self.tx.send(());
    }

    /// A [`LineSource`] view over this pipe, for handing to the runtime.
    /// Reads abort with [`io::ErrorKind::Interrupted`] once `interrupt` is
    /// tripped.
    pub fn reader(&self, interrupt: Arc<InterruptFlag>) -> StdinReader<'_> {
        StdinReader {
            pipe: self,
            interrupt,
        }
    }

    fn pop_line(&self) -> Option<String> {
        let mut pending = self.pending.lock().expect("stdin poisoned");
        let newline = pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = pending.drain(..=newline).collect();
        line.pop();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn announce_need_input(&self) {
        self.responder.send(
            Message::new()
                .with("session", self.session_id.as_str())
                .with_status([Status::NeedInput])
                .into(),
        );
    }
}

#[derive(Debug)]
pub struct StdinReader<'a> {
    pipe: &'a StdinPipe,
    interrupt: Arc<InterruptFlag>,
}

impl LineSource for StdinReader<'_> {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let interrupted = || io::Error::new(io::ErrorKind::Interrupted, "evaluation interrupted");

        if self.interrupt.is_interrupted() {
            return Err(interrupted());
        }
        if let Some(line) = self.pipe.pop_line() {
            return Ok(Some(line));
        }

        self.pipe.announce_need_input();

        // Block until fed or interrupted. Wake-ups whose line was consumed
        // in between are treated as spurious and block again.
        let mut rx = self.pipe.rx.lock().expect("stdin poisoned");
        loop {
            match rx.blocking_recv() {
                Some(()) => {
                    if self.interrupt.is_interrupted() {
                        return Err(interrupted());
                    }
                    if let Some(line) = self.pipe.pop_line() {
                        return Ok(Some(line));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}
