//! Every backend raises the same fault class for the same program.

#[allow(dead_code, unreachable_pub)]
mod helpers;

use assert_matches::assert_matches;
use cesk_types::{schema, Atom, Datom, Node};
use cesk_vm::{fault_code, BackendKind, FaultClass, Machine, ProgramImage, Value, VmError};

use helpers::{agreed, agreed_with, bounded_machine, kw, machine};

fn lambda_x() -> Node {
    Node::lambda(["x"], Node::var("x"))
}

// ============================================================================
// Fault Classes
// ============================================================================

#[test]
fn test_unbound_variable() {
    assert_eq!(agreed(&Node::var("nowhere")), Err(FaultClass::Unbound));
}

#[test]
fn test_closure_arity() {
    let program = Node::apply(lambda_x(), [Node::int(1), Node::int(2)]);
    assert_eq!(agreed(&program), Err(FaultClass::Arity));
    for kind in BackendKind::ALL {
        assert_matches!(
            helpers::eval(kind, &program),
            Err(VmError::Arity { callee, expected: 1, actual: 2 }) if callee == "lambda"
        );
    }
}

#[test]
fn test_primitive_arity() {
    assert_eq!(agreed(&Node::call("+", [Node::int(1)])), Err(FaultClass::Arity));
    assert_eq!(agreed(&Node::call("not", [])), Err(FaultClass::Arity));
}

#[test]
fn test_type_mismatch() {
    assert_eq!(agreed(&Node::call("+", [Node::int(1), kw("one")])), Err(FaultClass::Type));
    assert_eq!(agreed(&Node::call("<", [Node::nil(), Node::int(0)])), Err(FaultClass::Type));
    assert_eq!(agreed(&Node::call("=", [lambda_x(), lambda_x()])), Err(FaultClass::Type));
}

#[test]
fn test_arithmetic() {
    assert_eq!(agreed(&Node::call("/", [Node::int(1), Node::int(0)])), Err(FaultClass::Arithmetic));
    assert_eq!(
        agreed(&Node::call("+", [Node::int(i64::MAX), Node::int(1)])),
        Err(FaultClass::Arithmetic)
    );
    assert_eq!(
        agreed(&Node::call("/", [Node::int(i64::MIN), Node::int(-1)])),
        Err(FaultClass::Arithmetic)
    );
}

#[test]
fn test_not_callable() {
    assert_eq!(agreed(&Node::apply(Node::int(3), [])), Err(FaultClass::NotCallable));
    assert_eq!(agreed(&Node::apply(kw("f"), [Node::int(1)])), Err(FaultClass::NotCallable));
}

#[test]
fn test_resume_of_a_non_handle() {
    assert_eq!(agreed(&Node::resume(Node::int(1), Node::nil())), Err(FaultClass::Type));
}

#[test]
fn test_step_budget() {
    // (λx. (x x)) (λx. (x x)) never halts.
    let omega = Node::lambda(["x"], Node::apply(Node::var("x"), [Node::var("x")]));
    let program = Node::apply(omega.clone(), [omega]);
    assert_eq!(
        agreed_with(&program, |kind| bounded_machine(kind, 5_000)),
        Err(FaultClass::Budget)
    );
}

// ============================================================================
// Evaluation Order
// ============================================================================

#[test]
fn test_operator_faults_before_operands() {
    let program = Node::apply(Node::var("missing"), [Node::call("/", [Node::int(1), Node::int(0)])]);
    assert_eq!(agreed(&program), Err(FaultClass::Unbound));
}

#[test]
fn test_operands_fault_left_to_right() {
    let program = Node::call("+", [Node::var("missing"), Node::call("/", [Node::int(1), Node::int(0)])]);
    assert_eq!(agreed(&program), Err(FaultClass::Unbound));
    let program = Node::call("+", [Node::call("/", [Node::int(1), Node::int(0)]), Node::var("missing")]);
    assert_eq!(agreed(&program), Err(FaultClass::Arithmetic));
}

#[test]
fn test_untaken_branch_is_not_evaluated() {
    let program = Node::if_(Node::bool(true), Node::int(1), Node::var("missing"));
    assert_eq!(agreed(&program), Ok(Value::Int(1)));
}

// ============================================================================
// Load-Time Faults
// ============================================================================

#[test]
fn test_malformed_images_never_load() {
    // An application whose operator does not exist.
    let datoms = vec![
        Datom::new(-1, schema::TYPE, Atom::Keyword("application".into()), 1),
        Datom::new(-1, schema::OPERATOR, Atom::Ref(-7), 1),
        Datom::new(-1, schema::OPERANDS, Atom::Seq(vec![]), 1),
    ];
    let err = ProgramImage::from_datoms(&datoms).unwrap_err();
    assert_eq!(cesk_vm::classify(&err), FaultClass::Malformed);
}

#[test]
fn test_idle_machines_fault_uniformly() {
    for kind in BackendKind::ALL {
        let mut vm = machine(kind);
        let err = vm.run().unwrap_err();
        assert_eq!(fault_code(cesk_vm::classify(&err)), "vm.fault.machine", "{kind}");
    }
}
