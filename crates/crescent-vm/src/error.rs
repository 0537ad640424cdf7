use thiserror::Error;

use crate::value::LuaValue;

/// Control signal that unwinds the frame chain.
///
/// Both failure modes of a running chunk travel through `Result<_, Signal>`:
/// raised errors until a protected-call boundary catches them, and coroutine
/// yields until the resume boundary consumes them.  Host-language panics are
/// never used for script-visible control flow.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Signal {
    /// A raised error carrying its error value (any Lua value is legal,
    /// strings are merely the common case).
    #[error("runtime error: {0}")]
    Error(LuaValue),

    /// A yield in flight, carrying the yielded values.  Consumed by the
    /// nearest resume boundary; reaching the host through an unprotected
    /// call means the chunk yielded where it must not.
    #[error("attempt to yield across an unsupported boundary")]
    Yield(Vec<LuaValue>),
}

impl Signal {
    /// Raise with a plain string message (no position prefix).
    pub fn error_str(msg: impl Into<String>) -> Signal {
        Signal::Error(LuaValue::Str(msg.into().into()))
    }
}

/// Outcome of a protected call, reported instead of propagating the raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Status {
    /// The call completed; its results are on the stack.
    Ok,
    /// The called code raised; the (possibly handler-transformed) error
    /// value sits on the stack in place of results.
    RuntimeError,
    /// The message handler itself raised while handling an error.
    HandlerError,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}
