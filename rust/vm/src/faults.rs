//! Stable fault taxonomy and machine-readable mapping helpers.

use serde::{Deserialize, Serialize};

use crate::error::VmError;

/// Stable fault taxonomy. Every backend raises the same class for the same
/// program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// Program failed validation before it ran.
    Malformed,
    /// Variable lookup failed.
    Unbound,
    /// Wrong argument count.
    Arity,
    /// Operand of the wrong shape.
    Type,
    /// Overflow or division by zero.
    Arithmetic,
    /// Application of a non-function.
    NotCallable,
    /// Unknown or consumed parked id.
    Continuation,
    /// Stream capacity or reference failure.
    Stream,
    /// Bundle validation or transport failure.
    Import,
    /// Step budget exhausted.
    Budget,
    /// Machine used out of order or internally inconsistent.
    Machine,
}

#[must_use]
pub fn classify(err: &VmError) -> FaultClass {
    match err {
        VmError::Malformed(_) => FaultClass::Malformed,
        VmError::UnboundVariable { .. } => FaultClass::Unbound,
        VmError::Arity { .. } => FaultClass::Arity,
        VmError::TypeMismatch { .. } => FaultClass::Type,
        VmError::Arithmetic { .. } => FaultClass::Arithmetic,
        VmError::NotCallable { .. } => FaultClass::NotCallable,
        VmError::UnknownContinuation { .. } => FaultClass::Continuation,
        VmError::StreamFull { .. } | VmError::UnknownStream { .. } | VmError::UnknownCursor { .. } => {
            FaultClass::Stream
        }
        VmError::Import(_) | VmError::BackendMismatch { .. } | VmError::BadSlot { .. } => FaultClass::Import,
        VmError::StepBudgetExhausted { .. } => FaultClass::Budget,
        VmError::NoProgram | VmError::Internal(_) => FaultClass::Machine,
    }
}

#[must_use]
pub fn fault_code(class: FaultClass) -> &'static str {
    match class {
        FaultClass::Malformed => "vm.fault.malformed",
        FaultClass::Unbound => "vm.fault.unbound",
        FaultClass::Arity => "vm.fault.arity",
        FaultClass::Type => "vm.fault.type",
        FaultClass::Arithmetic => "vm.fault.arithmetic",
        FaultClass::NotCallable => "vm.fault.not_callable",
        FaultClass::Continuation => "vm.fault.continuation",
        FaultClass::Stream => "vm.fault.stream",
        FaultClass::Import => "vm.fault.import",
        FaultClass::Budget => "vm.fault.budget",
        FaultClass::Machine => "vm.fault.machine",
    }
}

/// Stable machine-readable code for a concrete error.
#[must_use]
pub fn fault_code_of(err: &VmError) -> &'static str {
    fault_code(classify(err))
}
