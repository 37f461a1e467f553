//! Status tags carried in response `status` sets.

use std::fmt::{Display, Formatter};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A single tag of a response's status set.
///
/// A response carries a *set* of tags, encoded as a list of strings. `done`
/// marks the final message of a request; `error` marks any failure outcome
/// and is accompanied by a tag naming the failure.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Done,
    Error,
    EvalError,
    Interrupted,
    SessionClosed,
    SessionIdle,
    InterruptIdMismatch,
    NeedInput,
    NamespaceNotFound,
    UnknownOp,
    UnknownSession,
    NoCode,
    /// A tag this crate does not know. Kept verbatim so peers can extend the
    /// protocol without breaking round-trips.
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Done => "done",
            Self::Error => "error",
            Self::EvalError => "eval-error",
            Self::Interrupted => "interrupted",
            Self::SessionClosed => "session-closed",
            Self::SessionIdle => "session-idle",
            Self::InterruptIdMismatch => "interrupt-id-mismatch",
            Self::NeedInput => "need-input",
            Self::NamespaceNotFound => "namespace-not-found",
            Self::UnknownOp => "unknown-op",
            Self::UnknownSession => "unknown-session",
            Self::NoCode => "no-code",
            Self::Other(tag) => tag,
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Status {
    fn from(tag: &str) -> Self {
        match tag {
            "done" => Self::Done,
            "error" => Self::Error,
            "eval-error" => Self::EvalError,
            "interrupted" => Self::Interrupted,
            "session-closed" => Self::SessionClosed,
            "session-idle" => Self::SessionIdle,
            "interrupt-id-mismatch" => Self::InterruptIdMismatch,
            "need-input" => Self::NeedInput,
            "namespace-not-found" => Self::NamespaceNotFound,
            "unknown-op" => Self::UnknownOp,
            "unknown-session" => Self::UnknownSession,
            "no-code" => Self::NoCode,
            other => Self::Other(other.to_string()),
        }
    }
}
