//! Session ops (`clone`, `close`, `ls-sessions`) and the default wrap that
//! attaches a session to every other request.

use std::sync::Arc;

use futures::future::BoxFuture;

use nrepl_types::{ops, Item, Message, Status};

use crate::middleware::{Descriptor, HandlerError, Middleware, Next, OpInfo, Request};
use crate::session::Session;

#[derive(Debug)]
pub struct SessionMiddleware {
    descriptor: Descriptor,
    base_ns: String,
}

impl SessionMiddleware {
    pub fn new(base_ns: &str) -> Arc<Self> {
        let descriptor = Descriptor::new("session")
            .handles(
                OpInfo::new("clone", "Clones the current session, returning the newly created session's id.")
                    .optional("session", "The id of the session to clone; a fresh baseline session otherwise.")
                    .returns("new-session", "The id of the new session."),
            )
            .handles(
                OpInfo::new("close", "Closes the specified session.")
                    .require("session", "The id of the session to close."),
            )
            .handles(
                OpInfo::new("ls-sessions", "Lists the ids of all active sessions.")
                    .returns("sessions", "A list of all active session ids."),
            );

        Arc::new(Self {
            descriptor,
            base_ns: base_ns.to_string(),
        })
    }

    fn clone_session(&self, req: &Request) {
        let parent = req
            .msg
            .session()
            .and_then(|id| req.registry.get(id));
        let session = Session::create(
            parent.as_deref(),
            &self.base_ns,
            Arc::clone(&req.responder),
        );
        req.registry.insert(Arc::clone(&session));

        req.respond(
            req.reply()
                .with("new-session", session.id())
                .with_status([Status::Done]),
        );
    }

    fn close_session(&self, req: &Request) {
        match req.msg.session().and_then(|id| req.registry.remove(id)) {
            // The record is gone; a draining evaluation keeps its own
            // handle and finishes on its own terms.
            Some(_) => req.respond(
                req.reply()
                    .with_status([Status::Done, Status::SessionClosed]),
            ),
            None => req.respond(unknown_session(&req.msg)),
        }
    }

    fn ls_sessions(&self, req: &Request) {
        let sessions: Vec<Item> = req
            .registry
            .ids()
            .into_iter()
            .map(Item::Str)
            .collect();
        req.respond(
            req.reply()
                .with("sessions", sessions)
                .with_status([Status::Done]),
        );
    }
}

fn unknown_session(msg: &Message) -> Message {
    msg.reply()
        .with_status([Status::Error, Status::UnknownSession, Status::Done])
}

impl Middleware for SessionMiddleware {
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
                Some(ops::CLONE) => self.clone_session(&req),
                Some(ops::CLOSE) => self.close_session(&req),
                Some(ops::LS_SESSIONS) => self.ls_sessions(&req),
                _ => {
                    // Attach the named session, or a throwaway one for the
                    // lifetime of this message.
                    let session = match req.msg.session() {
                        Some(id) => match req.registry.get(id) {
                            Some(session) => session,
                            None => {
                                req.respond(unknown_session(&req.msg));
                                return Ok(());
                            }
                        },
                        None => Session::create(
                            None,
                            &self.base_ns,
                            Arc::clone(&req.responder),
                        ),
                    };

                    let derived = Request {
                        session: Some(session),
                        ..req
                    };
                    return next.run(derived).await;
                }
            }
            Ok(())
        })
    }
}
