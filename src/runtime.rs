//! The seam between the protocol machinery and the embedded language
//! runtime.
//!
//! The server cares about exactly four things: splitting submitted source
//! into top-level forms, evaluating one form against a session's mutable
//! environment, rendering result values, and honoring the cooperative
//! interrupt flag. Everything else — syntax, data model, namespaces — is the
//! runtime's own business behind [`Runtime`].
//!
//! [`lisp`] ships a deliberately small reference runtime so the framework is
//! runnable and testable end to end.

pub mod lisp;

use std::any::Any;
use std::fmt::Debug;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A value produced by the runtime.
///
/// The protocol only ever needs the two renderings: `display` is what
/// `print` would show, `readable` is what the runtime's reader would accept
/// back (strings quoted, etc.). The `value` slot of an `eval` response
/// carries the readable rendering.
pub trait RuntimeValue: Debug + Send + Sync {
    fn display(&self) -> String;
    fn readable(&self) -> String;
    /// Escape hatch for runtimes that want their concrete value back from a
    /// result slot.
    fn as_any(&self) -> &dyn Any;
}

/// A runtime-level error: type name, root-cause type name, and a diagnostic
/// rendering for the error stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub kind: String,
    pub root: String,
    pub detail: String,
}

impl Exception {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            root: kind.clone(),
            kind,
            detail: detail.into(),
        }
    }
}

/// Why an evaluation stopped before producing a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalStop {
    Exception(Exception),
    /// The interrupt flag was honored. Not an error: the eval ends with
    /// plain `done` after the `interrupted` tag already went out.
    Interrupted,
}

/// Cooperative cancellation.
///
/// Rust offers no forced thread abort, so interruption is a contract: the
/// runtime checks the flag at step boundaries (loop iterations, blocking
/// reads) and returns [`EvalStop::Interrupted`] when it is set.
#[derive(Debug, Default)]
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where the submitted code came from, when the client said.
#[derive(Debug, Clone, Default)]
pub struct SourceRef {
    pub file: Option<String>,
    pub line: Option<i64>,
    pub column: Option<i64>,
}

/// The mutable slice of a session the runtime sees during one form.
///
/// `results` are the last three values (`*1`, `*2`, `*3`), most recent
/// first; `last_exception` is `*e`. Rotation is the evaluator's job, not the
/// runtime's.
#[derive(Debug, Default)]
pub struct EvalEnv {
    pub ns: String,
    pub results: [Option<Arc<dyn RuntimeValue>>; 3],
    pub last_exception: Option<Exception>,
}

/// Blocking line input, fed across requests by the `stdin` op.
pub trait LineSource: Send {
    /// Block until a line is available. `Ok(None)` is end of input; an
    /// [`std::io::ErrorKind::Interrupted`] error means the evaluation was
    /// cancelled while blocked.
    fn read_line(&mut self) -> std::io::Result<Option<String>>;
}

/// The I/O and control surface of one running form.
pub struct EvalIo<'a> {
    pub stdout: &'a mut dyn Write,
    pub stderr: &'a mut dyn Write,
    pub stdin: &'a mut dyn LineSource,
    pub interrupt: &'a InterruptFlag,
    pub source: &'a SourceRef,
}

impl Debug for EvalIo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalIo")
            .field("interrupt", &self.interrupt)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// An embedded language runtime.
pub trait Runtime: Send + Sync + 'static {
    /// Name advertised in `describe`'s version map.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// The namespace fresh sessions start in.
    fn base_namespace(&self) -> &str {
        "user"
    }

    fn has_namespace(&self, ns: &str) -> bool;

    /// Split source into top-level forms, each re-rendered as its own
    /// source string.
    fn read(&self, code: &str) -> Result<Vec<String>, Exception>;

    /// Evaluate a single form.
    fn eval(
        &self,
        form: &str,
        env: &mut EvalEnv,
        io: &mut EvalIo<'_>,
    ) -> Result<Arc<dyn RuntimeValue>, EvalStop>;
}
