//! The interruptible evaluator.
//!
//! Each session owns an [`Executor`]: a FIFO queue with a single running
//! slot. Admission and completion both take the queue lock; whichever task
//! finishes dispatches the queue head, so there is no dispatcher thread and
//! no per-session worker. Evaluation bodies run on the shared blocking pool
//! via `spawn_blocking`.
//!
//! [`run_eval`] is the evaluation task itself: it installs the session's
//! binding snapshot, walks the submitted forms one at a time, rotates the
//! result slots, streams `value`/`out`/`err` messages tagged with the
//! request, and always ends with `{status: done}` — whatever happened in
//! between.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::io::Write;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use log::warn;

use nrepl_types::{Message, Status};

use crate::runtime::{EvalEnv, EvalIo, EvalStop, InterruptFlag, Runtime, SourceRef};
use crate::session::Session;
use crate::transport::{Outgoing, Responder};

type Job = BoxFuture<'static, ()>;

struct ExecState {
    queue: VecDeque<Job>,
    running: bool,
}

/// Per-session serial executor: strict FIFO, at most one job in flight.
#[derive(Default)]
pub struct Executor {
    state: Mutex<ExecState>,
}

impl Default for ExecState {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            running: false,
        }
    }
}

impl Debug for Executor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("executor poisoned");
        f.debug_struct("Executor")
            .field("queued", &state.queue.len())
            .field("running", &state.running)
            .finish()
    }
}

impl Executor {
    /// Admit a job. If the slot is free the submitter dispatches it;
    /// otherwise it waits its turn in the queue.
    pub fn submit(self: Arc<Self>, job: Job) {
        let run_now = {
            let mut state = self.state.lock().expect("executor poisoned");
            if state.running {
                state.queue.push_back(job);
                None
            } else {
                state.running = true;
                Some(job)
            }
        };

        if let Some(job) = run_now {
            self.dispatch(job);
        }
    }

    fn dispatch(self: Arc<Self>, job: Job) {
        let executor = self;
        tokio::spawn(async move {
            let mut job = Some(job);
            while let Some(current) = job.take() {
                current.await;

                // The finishing task pops the next one, atomically with the
                // running flag.
                let mut state = executor.state.lock().expect("executor poisoned");
                match state.queue.pop_front() {
                    Some(next) => job = Some(next),
                    None => state.running = false,
                }
            }
        });
    }
}

// -------------------------------------------------------------------------------------------------

/// Run one `eval` request to completion.
///
/// Assumes the caller already verified a `code` field exists. Runs the
/// blocking evaluation on the shared blocking pool; the surrounding future
/// is what sits in the session's executor queue.
pub async fn run_eval(
    runtime: Arc<dyn Runtime>,
    session: Arc<Session>,
    responder: Arc<dyn Responder>,
    msg: Message,
) {
    let interrupt = session.begin_eval(msg.id().map(String::from));

    let result = tokio::task::spawn_blocking(move || {
        evaluate(&*runtime, &session, &*responder, &msg, &interrupt);
    })
    .await;

    if let Err(err) = result {
        // A panicking runtime takes down its eval, not the server.
        warn!("evaluation task panicked: {err}");
    }
}

fn reply_to(msg: &Message, session: &Session) -> Message {
    let mut reply = Message::new().with("session", session.id());
    if let Some(id) = msg.id() {
        reply.insert("id", id);
    }
    reply
}

fn evaluate(
    runtime: &dyn Runtime,
    session: &Arc<Session>,
    responder: &dyn Responder,
    msg: &Message,
    interrupt: &Arc<InterruptFlag>,
) {
    let flush_streams = || {
        session.stdout().flush();
        session.stderr().flush();
    };

    let finish = |interrupted: bool, env: Option<EvalEnv>| {
        flush_streams();
        if let (false, Some(env)) = (interrupted, env) {
            let mut bindings = session.snapshot();
            bindings.ns = env.ns;
            bindings.results = env.results;
            bindings.last_exception = env.last_exception;
            session.store(bindings);
        }
        session.end_eval();
        responder.send(reply_to(msg, session).with_status([Status::Done]).into());
    };

    let bindings = session.snapshot();
    let mut env = EvalEnv {
        ns: bindings.ns.clone(),
        results: bindings.results.clone(),
        last_exception: bindings.last_exception.clone(),
    };

    // An explicit `ns` binds the namespace for this one eval.
    if let Some(ns) = msg.ns() {
        if !runtime.has_namespace(ns) {
            flush_streams();
            session.end_eval();
            responder.send(
                reply_to(msg, session)
                    .with_status([Status::Error, Status::NamespaceNotFound, Status::Done])
                    .into(),
            );
            return;
        }
        env.ns = ns.to_string();
    }

    let source = SourceRef {
        file: msg.get_str("file").map(String::from),
        line: msg.get_int("line"),
        column: msg.get_int("column"),
    };

    let code = msg.code().unwrap_or_default();
    let forms = match runtime.read(code) {
        Ok(forms) => forms,
        Err(exception) => {
            env.last_exception = Some(exception.clone());
            responder.send(
                reply_to(msg, session)
                    .with("ex", exception.kind.as_str())
                    .with("root-ex", exception.root.as_str())
                    .with_status([Status::EvalError])
                    .into(),
            );
            let _ = writeln!(
                session.stderr().writer(),
                "{}: {}",
                exception.kind,
                exception.detail
            );
            finish(false, Some(env));
            return;
        }
    };

    for form in &forms {
        let mut stdout = session.stdout().writer();
        let mut stderr = session.stderr().writer();
        let mut stdin = session.stdin().reader(Arc::clone(interrupt));
        let mut io = EvalIo {
            stdout: &mut stdout,
            stderr: &mut stderr,
            stdin: &mut stdin,
            interrupt: interrupt.as_ref(),
            source: &source,
        };

        match runtime.eval(form, &mut env, &mut io) {
            Ok(value) => {
                rotate(&mut env, Arc::clone(&value));
                flush_streams();
                responder.send(Outgoing {
                    msg: reply_to(msg, session).with("ns", env.ns.as_str()),
                    value: Some(value),
                });
            }
            Err(EvalStop::Exception(exception)) => {
                env.last_exception = Some(exception.clone());
                flush_streams();
                responder.send(
                    reply_to(msg, session)
                        .with("ex", exception.kind.as_str())
                        .with("root-ex", exception.root.as_str())
                        .with_status([Status::EvalError])
                        .into(),
                );
                let _ = writeln!(
                    session.stderr().writer(),
                    "{}: {}",
                    exception.kind,
                    exception.detail
                );
                // The remaining forms of this request are abandoned.
                finish(false, Some(env));
                return;
            }
            Err(EvalStop::Interrupted) => {
                // No slot rotation; the `interrupted` tag already went out
                // on the interrupt path.
                finish(true, None);
                return;
            }
        }
    }

    finish(false, Some(env));
}

fn rotate(env: &mut EvalEnv, value: Arc<dyn crate::runtime::RuntimeValue>) {
    env.results[2] = env.results[1].take();
    env.results[1] = env.results[0].take();
    env.results[0] = Some(value);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn job(tag: usize, log: Arc<Mutex<Vec<usize>>>, millis: u64) -> Job {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            log.lock().unwrap().push(tag);
        })
    }

    #[tokio::test]
    async fn test_executor_runs_fifo() {
        let executor = Arc::new(Executor::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        // The first job is slow; later ones would overtake it if anything
        // ran concurrently.
        Arc::clone(&executor).submit(job(1, log.clone(), 50));
        Arc::clone(&executor).submit(job(2, log.clone(), 10));
        Arc::clone(&executor).submit(job(3, log.clone(), 0));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_executor_idles_and_restarts() {
        let executor = Arc::new(Executor::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        Arc::clone(&executor).submit(job(1, log.clone(), 0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec![1]);

        Arc::clone(&executor).submit(job(2, log.clone(), 0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }
}
