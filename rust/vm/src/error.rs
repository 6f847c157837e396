//! Machine errors.

use cesk_types::{AstError, BundleError, EntityId};

use crate::machine::BackendKind;
use crate::value::{ParkedId, StreamId};

/// Errors raised by loading, stepping, parking and transporting.
///
/// A failed step leaves the machine as it was before the step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Malformed program, raised before execution begins.
    #[error("malformed program: {0}")]
    Malformed(#[from] AstError),

    #[error("unbound variable `{name}`")]
    UnboundVariable { name: String },

    /// Wrong argument count at a call site.
    #[error("`{callee}` expects {expected} argument(s), got {actual}")]
    Arity {
        callee: String,
        expected: usize,
        actual: usize,
    },

    /// Operand of the wrong shape. Never coerced.
    #[error("`{op}` expects {expected}, got {found}")]
    TypeMismatch {
        op: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("arithmetic fault in `{op}`: {reason}")]
    Arithmetic { op: String, reason: &'static str },

    #[error("cannot apply a {found}")]
    NotCallable { found: &'static str },

    /// Resume of an id that was never issued, or was already resumed.
    #[error("unknown or consumed continuation {id}")]
    UnknownContinuation { id: ParkedId },

    #[error("stream {stream} is full")]
    StreamFull { stream: StreamId },

    #[error("stream {stream} not in store")]
    UnknownStream { stream: StreamId },

    #[error("cursor {cursor} not open on stream {stream}")]
    UnknownCursor { stream: StreamId, cursor: u64 },

    #[error("import failed: {0}")]
    Import(#[from] BundleError),

    #[error("continuation captured on {found} backend cannot run on {expected}")]
    BackendMismatch {
        expected: BackendKind,
        found: BackendKind,
    },

    #[error("continuation refers to slot {slot} outside its bundle")]
    BadSlot { slot: EntityId },

    #[error("no program loaded")]
    NoProgram,

    #[error("step budget of {limit} exhausted")]
    StepBudgetExhausted { limit: u64 },

    /// Broken machine invariant, e.g. stack underflow in compiled code.
    #[error("machine invariant violated: {0}")]
    Internal(String),
}

impl VmError {
    pub(crate) fn type_mismatch(op: &str, expected: &'static str, found: &crate::value::Value) -> Self {
        VmError::TypeMismatch {
            op: op.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        VmError::Internal(msg.into())
    }
}

/// Error loading a [`crate::config::VMConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
}
