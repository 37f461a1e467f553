//! `eval` and `interrupt`.
//!
//! Evaluations are admitted to the session's serial executor and run one at
//! a time in submission order. `interrupt` trips the running eval's
//! cooperative flag; the `interrupted` tag goes out before the eval's own
//! `done` because both travel through the same connection writer, in order.

use std::sync::Arc;

use futures::future::BoxFuture;

use nrepl_types::{ops, Message, Status};

use crate::eval::run_eval;
use crate::middleware::{
    Descriptor, HandlerError, Middleware, Next, OpInfo, Request, Selector,
};
use crate::runtime::Runtime;

pub struct InterruptibleEval {
    descriptor: Descriptor,
    runtime: Arc<dyn Runtime>,
}

impl std::fmt::Debug for InterruptibleEval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptibleEval")
            .field("runtime", &self.runtime.name())
            .finish_non_exhaustive()
    }
}

impl InterruptibleEval {
    pub fn new(runtime: Arc<dyn Runtime>) -> Arc<Self> {
        let descriptor = Descriptor::new("interruptible-eval")
            .requires(Selector::op("clone"))
            .requires(Selector::op("close"))
            .handles(
                OpInfo::new("eval", "Evaluates code, streaming any results and output.")
                    .require("code", "The code to be evaluated.")
                    .require("session", "The session within which to evaluate the code.")
                    .optional("id", "An opaque message id that will be echoed in all responses.")
                    .optional("ns", "The namespace in which to perform the evaluation.")
                    .returns("values", "The values yielded by the evaluation, one response each.")
                    .returns("ns", "The namespace in which the form was evaluated."),
            )
            .handles(
                OpInfo::new("interrupt", "Attempts to interrupt some running evaluation.")
                    .require("session", "The session holding the evaluation to interrupt.")
                    .optional(
                        "interrupt-id",
                        "The id of the particular eval to interrupt.",
                    ),
            );

        Arc::new(Self {
            descriptor,
            runtime,
        })
    }

    fn eval(&self, req: &Request) {
        let Some(session) = req.session.clone() else {
            req.respond(
                req.reply()
                    .with_status([Status::Error, Status::UnknownSession, Status::Done]),
            );
            return;
        };

        if req.msg.code().is_none() {
            req.respond(
                req.reply()
                    .with_status([Status::Error, Status::NoCode, Status::Done]),
            );
            return;
        }

        let job = Box::pin(run_eval(
            Arc::clone(&self.runtime),
            Arc::clone(&session),
            Arc::clone(&req.responder),
            req.msg.clone(),
        ));
        session.executor().submit(job);
    }

    fn interrupt(&self, req: &Request) {
        let Some(session) = req.session.as_deref() else {
            req.respond(
                req.reply()
                    .with_status([Status::Error, Status::UnknownSession, Status::Done]),
            );
            return;
        };

        let Some(current) = session.current_eval() else {
            req.respond(req.reply().with_status([Status::Done, Status::SessionIdle]));
            return;
        };

        let requested = req.msg.get_str("interrupt-id");
        if requested.is_some() && requested != current.msg_id.as_deref() {
            req.respond(
                req.reply()
                    .with_status([Status::Error, Status::InterruptIdMismatch, Status::Done]),
            );
            return;
        }

        // The interrupted tag must reach the wire before the eval's own
        // done, so it is sent before the flag is tripped.
        let mut interrupted = Message::new()
            .with("session", session.id())
            .with_status([Status::Interrupted]);
        if let Some(eval_id) = &current.msg_id {
            interrupted.insert("id", eval_id.as_str());
        }
        req.respond(interrupted);

        current.interrupt.interrupt();
        session.stdin().notify_interrupt();

        req.respond(req.reply().with_status([Status::Done]));
    }
}

impl Middleware for InterruptibleEval {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn handle<'a>(
        &'a self,
        req: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let op = req.msg.op().map(str::to_string);
            match op.as_deref() {
                Some(ops::EVAL) => {
                    self.eval(&req);
                    Ok(())
                }
                Some(ops::INTERRUPT) => {
                    self.interrupt(&req);
                    Ok(())
                }
                _ => next.run(req).await,
            }
        })
    }
}
