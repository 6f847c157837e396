//! Runtime values shared by every backend.

use cesk_types::{EntityId, Literal};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::env::Env;
use crate::error::VmError;
use crate::primitives::Primitive;

/// Store key of a stream.
pub type StreamId = u64;
/// Per-store cursor key.
pub type CursorId = u64;
/// Key of a parked continuation in a machine's registry.
pub type ParkedId = u64;

/// A user closure. The body is an entity of the machine's fact set, so the
/// same closure value runs on any backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub params: Vec<String>,
    pub body: EntityId,
    pub env: Env,
}

impl Closure {
    pub fn check_arity(&self, actual: usize) -> Result<(), VmError> {
        if actual == self.params.len() {
            return Ok(());
        }
        Err(VmError::Arity {
            callee: "lambda".to_string(),
            expected: self.params.len(),
            actual,
        })
    }
}

/// A first-class value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Keyword(String),
    Closure(Closure),
    Primitive(Primitive),
    /// Stream reference; equality is identity.
    Stream(StreamId),
    Cursor { stream: StreamId, cursor: CursorId },
    /// Handle returned when a computation parks.
    Parked(ParkedId),
    /// Read from an exhausted cursor, or put into a full stream under the
    /// blocking policy. Not an error: the caller retries.
    Blocked,
}

impl Value {
    #[must_use]
    pub fn keyword(k: impl Into<String>) -> Self {
        Value::Keyword(k.into())
    }

    /// `false` and `nil` are false; everything else is true.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Bool(false) | Value::Nil)
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Value::Blocked)
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Keyword(_) => "keyword",
            Value::Closure(_) => "closure",
            Value::Primitive(_) => "primitive",
            Value::Stream(_) => "stream",
            Value::Cursor { .. } => "cursor",
            Value::Parked(_) => "parked",
            Value::Blocked => "blocked",
        }
    }
}

impl From<&Literal> for Value {
    fn from(lit: &Literal) -> Self {
        match lit {
            Literal::Nil => Value::Nil,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(n) => Value::Int(*n),
            Literal::Str(s) => Value::Str(s.clone()),
            Literal::Keyword(k) => Value::Keyword(k.clone()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Keyword(k) => write!(f, ":{k}"),
            Value::Closure(c) => write!(f, "#<closure ({}) #{}>", c.params.join(" "), c.body),
            Value::Primitive(p) => write!(f, "#<primitive {}>", p.name()),
            Value::Stream(id) => write!(f, "#<stream {id}>"),
            Value::Cursor { stream, cursor } => write!(f, "#<cursor {stream}/{cursor}>"),
            Value::Parked(id) => write!(f, "#<parked {id}>"),
            Value::Blocked => write!(f, "#<blocked>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Blocked.is_truthy());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::keyword("first").to_string(), ":first");
        assert_eq!(Value::Cursor { stream: 2, cursor: 5 }.to_string(), "#<cursor 2/5>");
    }
}
