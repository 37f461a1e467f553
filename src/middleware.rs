//! The middleware pipeline.
//!
//! A handler is a [`Middleware`]: it looks at a [`Request`] and either
//! answers it, enriches it and passes it on, or just passes it on. Each one
//! carries a [`Descriptor`] declaring the ops it handles and where it must
//! sit relative to others. [`Stack::new`] resolves those declarations into a
//! single linear chain — a topological sort over the declared edges, stable
//! by insertion order — and fails fast on ambiguity, dangling references,
//! and cycles.
//!
//! The innermost handler is implicit: anything that falls off the end of
//! the chain is answered with `{status: {error, unknown-op, done}}`.

pub mod describe;
pub mod eval;
pub mod load_file;
pub mod print;
pub mod session;
pub mod stdin;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use nrepl_types::{Message, Status};

use crate::session::{Registry, Session};
use crate::transport::{Outgoing, Responder};

/// A reference to another point of the pipeline: either an op name, which
/// resolves to the middleware whose descriptor handles that op, or a
/// middleware by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Op(String),
    Middleware(String),
}

impl Selector {
    pub fn op(name: &str) -> Self {
        Self::Op(name.to_string())
    }

    pub fn middleware(name: &str) -> Self {
        Self::Middleware(name.to_string())
    }
}

/// `describe` metadata for one op.
#[derive(Debug, Clone, Default)]
pub struct OpInfo {
    pub op: String,
    pub doc: String,
    /// Required argument name → doc.
    pub requires: Vec<(String, String)>,
    /// Optional argument name → doc.
    pub optional: Vec<(String, String)>,
    /// Response slot name → doc.
    pub returns: Vec<(String, String)>,
}

impl OpInfo {
    pub fn new(op: &str, doc: &str) -> Self {
        Self {
            op: op.to_string(),
            doc: doc.to_string(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn require(mut self, arg: &str, doc: &str) -> Self {
        self.requires.push((arg.to_string(), doc.to_string()));
        self
    }

    #[must_use]
    pub fn optional(mut self, arg: &str, doc: &str) -> Self {
        self.optional.push((arg.to_string(), doc.to_string()));
        self
    }

    #[must_use]
    pub fn returns(mut self, slot: &str, doc: &str) -> Self {
        self.returns.push((slot.to_string(), doc.to_string()));
        self
    }
}

/// Position and surface of one middleware.
#[derive(Debug, Clone, Default)]
pub struct Descriptor {
    pub name: String,
    /// Must come before this middleware in the chain.
    pub requires: Vec<Selector>,
    /// Must come after this middleware in the chain.
    pub expects: Vec<Selector>,
    pub handles: Vec<OpInfo>,
}

impl Descriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn requires(mut self, selector: Selector) -> Self {
        self.requires.push(selector);
        self
    }

    #[must_use]
    pub fn expects(mut self, selector: Selector) -> Self {
        self.expects.push(selector);
        self
    }

    #[must_use]
    pub fn handles(mut self, info: OpInfo) -> Self {
        self.handles.push(info);
        self
    }
}

/// Aggregated op metadata of a whole stack, keyed by op name.
pub type OpsIndex = BTreeMap<String, OpInfo>;

/// One in-flight request.
///
/// Handlers never mutate the incoming message: they respond through the
/// responder, or forward a derived request down the chain.
#[derive(Debug, Clone)]
pub struct Request {
    pub msg: Message,
    pub responder: Arc<dyn Responder>,
    pub registry: Arc<Registry>,
    /// Attached by the session middleware before inner handlers run.
    pub session: Option<Arc<Session>>,
    /// Aggregated op metadata, filled in by [`Stack::dispatch`].
    pub ops: Arc<OpsIndex>,
}

impl Request {
    pub fn new(msg: Message, responder: Arc<dyn Responder>, registry: Arc<Registry>) -> Self {
        Self {
            msg,
            responder,
            registry,
            session: None,
            ops: Arc::new(OpsIndex::new()),
        }
    }

    /// Send a response for this request.
    pub fn respond(&self, msg: Message) {
        self.responder.send(Outgoing::from(msg));
    }

    /// A reply skeleton echoing `id` and the attached session's id.
    pub fn reply(&self) -> Message {
        let mut reply = Message::new();
        if let Some(id) = self.msg.id() {
            reply.insert("id", id);
        }
        match &self.session {
            Some(session) => reply.insert("session", session.id()),
            None => {
                if let Some(session) = self.msg.session() {
                    reply.insert("session", session);
                }
            }
        }
        reply
    }
}

/// A middleware failure that escaped the handler. The request is dropped
/// and logged; the connection lives on.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

pub trait Middleware: Send + Sync {
    fn descriptor(&self) -> &Descriptor;

    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// The rest of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").field("depth", &self.chain.len()).finish()
    }
}

impl Next<'_> {
    /// Hand the request to the next handler, or to the terminal unknown-op
    /// answer if the chain is exhausted.
    pub async fn run(self, req: Request) -> Result<(), HandlerError> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(req, Next { chain: rest }).await,
            None => {
                let mut reply = req.reply().with_status([
                    Status::Error,
                    Status::UnknownOp,
                    Status::Done,
                ]);
                if let Some(op) = req.msg.op() {
                    reply.insert("op", op);
                }
                req.respond(reply);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("Two middlewares both claim to handle `{0}`")]
    AmbiguousOp(String),
    #[error("Two middlewares share the name `{0}`")]
    DuplicateName(String),
    #[error("`{0}` does not resolve to any middleware in the stack")]
    Unresolved(String),
    #[error("Middleware dependencies form a cycle through `{0}`")]
    Cycle(String),
}

/// A linearized middleware chain, outermost handler first.
pub struct Stack {
    chain: Vec<Arc<dyn Middleware>>,
    ops: Arc<OpsIndex>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("chain", &self.names())
            .finish()
    }
}

impl Stack {
    /// Linearize a set of middlewares into a chain respecting every
    /// `requires`/`expects` edge.
    pub fn new(middleware: Vec<Arc<dyn Middleware>>) -> Result<Self, StackError> {
        let chain = linearize(middleware)?;

        let mut ops = OpsIndex::new();
        for mw in &chain {
            for info in &mw.descriptor().handles {
                ops.insert(info.op.clone(), info.clone());
            }
        }

        Ok(Self {
            chain,
            ops: Arc::new(ops),
        })
    }

    /// The linearized middleware names, outermost first.
    pub fn names(&self) -> Vec<&str> {
        self.chain
            .iter()
            .map(|mw| mw.descriptor().name.as_str())
            .collect()
    }

    pub fn ops(&self) -> &Arc<OpsIndex> {
        &self.ops
    }

    pub async fn dispatch(&self, mut req: Request) -> Result<(), HandlerError> {
        req.ops = Arc::clone(&self.ops);
        Next { chain: &self.chain }.run(req).await
    }
}

fn linearize(
    middleware: Vec<Arc<dyn Middleware>>,
) -> Result<Vec<Arc<dyn Middleware>>, StackError> {
    let count = middleware.len();

    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut by_op: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, mw) in middleware.iter().enumerate() {
        let descriptor = mw.descriptor();
        if by_name.insert(descriptor.name.clone(), index).is_some() {
            return Err(StackError::DuplicateName(descriptor.name.clone()));
        }
        for info in &descriptor.handles {
            by_op.entry(info.op.clone()).or_default().push(index);
        }
    }

    let resolve = |selector: &Selector| -> Result<usize, StackError> {
        match selector {
            Selector::Middleware(name) => by_name
                .get(name)
                .copied()
                .ok_or_else(|| StackError::Unresolved(name.clone())),
            Selector::Op(op) => match by_op.get(op).map(Vec::as_slice) {
                Some([index]) => Ok(*index),
                Some(_) => Err(StackError::AmbiguousOp(op.clone())),
                None => Err(StackError::Unresolved(op.clone())),
            },
        }
    };

    // requires r of H: r precedes H; expects e of H: e follows H.
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut indegree = vec![0usize; count];
    let mut add_edge = |from: usize, to: usize, successors: &mut Vec<Vec<usize>>| {
        if from != to && !successors[from].contains(&to) {
            successors[from].push(to);
            indegree[to] += 1;
        }
    };
    for (index, mw) in middleware.iter().enumerate() {
        let descriptor = mw.descriptor();
        for selector in &descriptor.requires {
            add_edge(resolve(selector)?, index, &mut successors);
        }
        for selector in &descriptor.expects {
            add_edge(index, resolve(selector)?, &mut successors);
        }
    }

    // Kahn's algorithm; ties broken by insertion order for a stable chain.
    let mut placed = vec![false; count];
    let mut chain = Vec::with_capacity(count);
    for _ in 0..count {
        let next = (0..count).find(|&index| !placed[index] && indegree[index] == 0);
        let Some(next) = next else {
            let stuck = (0..count).find(|&index| !placed[index]).unwrap_or(0);
            return Err(StackError::Cycle(
                middleware[stuck].descriptor().name.clone(),
            ));
        };
        placed[next] = true;
        for &successor in &successors[next] {
            indegree[successor] -= 1;
        }
        chain.push(next);
    }

    let mut ordered: Vec<Option<Arc<dyn Middleware>>> =
        middleware.into_iter().map(Some).collect();
    Ok(chain
        .into_iter()
        .map(|index| ordered[index].take().expect("index placed twice"))
        .collect())
}
