//! The `load-file` op: rewrite a whole-file submission into an `eval`.

use std::sync::Arc;

use futures::future::BoxFuture;

use nrepl_types::{ops, Message, Status};

use crate::middleware::{
    Descriptor, HandlerError, Middleware, Next, OpInfo, Request, Selector,
};

#[derive(Debug)]
pub struct LoadFile {
    descriptor: Descriptor,
}

impl LoadFile {
    pub fn new() -> Arc<Self> {
        let descriptor = Descriptor::new("load-file")
            .requires(Selector::op("clone"))
            .expects(Selector::op("eval"))
            .handles(
                OpInfo::new("load-file", "Loads a body of code, using supplied path and filename info to set source file and line number metadata.")
                    .require("file", "Full contents of a file of code.")
                    .optional("file-name", "Name of the source file, e.g. io.clj")
                    .optional("file-path", "Source-path-relative path of the source file, e.g. clojure/java/io.clj"),
            );

        Arc::new(Self { descriptor })
    }
}

impl Middleware for LoadFile {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn handle<'a>(
        &'a self,
        req: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if req.msg.op() != Some(ops::LOAD_FILE) {
                return next.run(req).await;
            }

            let Some(contents) = req.msg.get_str("file") else {
                req.respond(
                    req.reply()
                        .with_status([Status::Error, Status::NoCode, Status::Done]),
                );
                return Ok(());
            };

            // Rewrite into an eval of the file's contents; the rest of the
            // chain treats it like any other eval.
            let mut derived = Message::new()
                .with("op", ops::EVAL)
                .with("code", contents);
            if let Some(id) = req.msg.id() {
                derived.insert("id", id);
            }
            if let Some(session) = req.msg.session() {
                derived.insert("session", session);
            }
            if let Some(path) = req
                .msg
                .get_str("file-path")
                .or_else(|| req.msg.get_str("file-name"))
            {
                derived.insert("file", path);
            }

            next.run(Request {
                msg: derived,
                ..req
            })
            .await
        })
    }
}
