//! `pr-values`: render result values into printable strings.
//!
//! Evaluations hand their results down the responder chain unrendered; this
//! middleware wraps the request's responder so every outgoing message
//! carrying a value gets its `value` slot filled with the readable
//! rendering. Stacks built without it still produce output — the terminal
//! sender falls back to the same rendering — but this is the seam where a
//! different print policy would go.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::middleware::{Descriptor, HandlerError, Middleware, Next, Request, Selector};
use crate::transport::{Outgoing, Responder};

#[derive(Debug)]
pub struct PrValues {
    descriptor: Descriptor,
}

impl PrValues {
    pub fn new() -> Arc<Self> {
        let descriptor = Descriptor::new("pr-values").expects(Selector::op("eval"));
        Arc::new(Self { descriptor })
    }
}

struct RenderValues {
    inner: Arc<dyn Responder>,
}

impl Responder for RenderValues {
    fn send(&self, out: Outgoing) {
        let Outgoing { mut msg, value } = out;
        if let Some(value) = value {
            msg.insert("value", value.readable());
        }
        self.inner.send(Outgoing { msg, value: None });
    }
}

impl Middleware for PrValues {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn handle<'a>(
        &'a self,
        req: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        let derived = Request {
            responder: Arc::new(RenderValues {
                inner: Arc::clone(&req.responder),
            }),
            ..req
        };
        Box::pin(next.run(derived))
    }
}
