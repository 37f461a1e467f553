//! The `stdin` op: feed a session's standard input across requests.

use std::sync::Arc;

use futures::future::BoxFuture;

use nrepl_types::{ops, Status};

use crate::middleware::{
    Descriptor, HandlerError, Middleware, Next, OpInfo, Request, Selector,
};

#[derive(Debug)]
pub struct AddStdin {
    descriptor: Descriptor,
}

impl AddStdin {
    pub fn new() -> Arc<Self> {
        let descriptor = Descriptor::new("add-stdin")
            .requires(Selector::op("clone"))
            .expects(Selector::op("eval"))
            .handles(
                OpInfo::new("stdin", "Add content from the value of \"stdin\" to the session's standard input.")
                    .require("stdin", "Content to add to the session's standard input.")
                    .require("session", "The session to whose input the content is added."),
            );

        Arc::new(Self { descriptor })
    }
}

impl Middleware for AddStdin {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn handle<'a>(
        &'a self,
        req: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if req.msg.op() != Some(ops::STDIN) {
                return next.run(req).await;
            }

            match &req.session {
                Some(session) => {
                    if let Some(text) = req.msg.get_str("stdin") {
                        session.stdin().feed(text);
                    }
                    req.respond(req.reply().with_status([Status::Done]));
                }
                None => req.respond(
                    req.reply()
                        .with_status([Status::Error, Status::UnknownSession, Status::Done]),
                ),
            }
            Ok(())
        })
    }
}
