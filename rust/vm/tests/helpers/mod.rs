//! Shared test infrastructure for backend conformance tests.

use cesk_types::Node;
use cesk_vm::{classify, create, prelude, BackendKind, FaultClass, Machine, VMConfig, Value, VmError};
use proptest::prelude::*;

/// Deterministic seed for reproducibility.
pub const SEED: [u8; 32] = [
    0x43, 0x45, 0x53, 0x4B, 0x42, 0x61, 0x63, 0x6B, // "CESKBack"
    0x65, 0x6E, 0x64, 0x50, 0x61, 0x72, 0x69, 0x74, // "endParit"
    0x79, 0x53, 0x75, 0x69, 0x74, 0x65, 0x56, 0x31, // "ySuiteV1"
    0x52, 0x75, 0x73, 0x74, 0x56, 0x4D, 0x30, 0x31, // "RustVM01"
];

/// Outcome of a run, comparable across backends.
pub type Outcome = Result<Value, FaultClass>;

// ============================================================================
// Machines
// ============================================================================

pub fn machine(kind: BackendKind) -> Box<dyn Machine> {
    create(kind, VMConfig::default(), prelude())
}

pub fn bounded_machine(kind: BackendKind, max_steps: u64) -> Box<dyn Machine> {
    let config = VMConfig {
        max_steps: Some(max_steps),
        ..VMConfig::default()
    };
    create(kind, config, prelude())
}

pub fn eval(kind: BackendKind, node: &Node) -> Result<Value, VmError> {
    machine(kind).eval(node)
}

pub fn outcome(result: Result<Value, VmError>) -> Outcome {
    result.map_err(|e| classify(&e))
}

/// Run `node` on every backend and require one agreed outcome.
pub fn agreed(node: &Node) -> Outcome {
    agreed_with(node, |kind| machine(kind))
}

pub fn agreed_with(node: &Node, mut make: impl FnMut(BackendKind) -> Box<dyn Machine>) -> Outcome {
    let mut outcomes = BackendKind::ALL
        .into_iter()
        .map(|kind| (kind, outcome(make(kind).eval(node))));
    let (first_kind, first) = outcomes.next().expect("at least one backend");
    for (kind, other) in outcomes {
        assert_eq!(
            first, other,
            "{first_kind} and {kind} disagree on {}",
            node.to_json()
        );
    }
    first
}

// ============================================================================
// Programs
// ============================================================================

pub fn kw(k: &str) -> Node {
    Node::keyword(k)
}

/// `let a = e1 in let b = e2 in ... body`
pub fn lets(bindings: Vec<(&str, Node)>, body: Node) -> Node {
    bindings
        .into_iter()
        .rev()
        .fold(body, |body, (name, value)| Node::let_(name, value, body))
}

/// `((λx. (+ x (park))) 10)`
pub fn park_in_addition() -> Node {
    Node::apply(
        Node::lambda(["x"], Node::call("+", [Node::var("x"), Node::Park])),
        [Node::int(10)],
    )
}

// ============================================================================
// Strategies
// ============================================================================

fn leaf() -> impl Strategy<Value = Node> {
    prop_oneof![
        (-20i64..20).prop_map(Node::int),
        any::<bool>().prop_map(Node::bool),
        prop::sample::select(vec!["x", "y", "+", "-", "*", "/", "=", "<", "not"]).prop_map(Node::var),
        prop::sample::select(vec!["a", "b"]).prop_map(Node::keyword),
        Just(Node::nil()),
        Just(Node::stream_make(None)),
    ]
}

/// Small programs over every node type but park. Most are ill typed;
/// the point is that every backend fails the same way.
pub fn program_strategy() -> impl Strategy<Value = Node> {
    leaf().prop_recursive(4, 40, 3, |inner| {
        prop_oneof![
            3 => (inner.clone(), prop::collection::vec(inner.clone(), 0..3))
                .prop_map(|(op, args)| Node::apply(op, args)),
            2 => (prop::sample::select(vec!["+", "-", "*", "<", "="]), inner.clone(), inner.clone())
                .prop_map(|(op, a, b)| Node::call(op, [a, b])),
            2 => (prop::collection::vec(prop::sample::select(vec!["x", "y"]), 0..3), inner.clone())
                .prop_map(|(params, body)| Node::lambda(params, body)),
            2 => (inner.clone(), inner.clone(), inner.clone())
                .prop_map(|(t, c, a)| Node::if_(t, c, a)),
            1 => (inner.clone(), inner.clone()).prop_map(|(t, v)| Node::stream_put(t, v)),
            1 => inner.clone().prop_map(Node::stream_cursor),
            1 => inner.clone().prop_map(Node::stream_next),
            1 => (inner.clone(), inner).prop_map(|(p, v)| Node::resume(p, v)),
        ]
    })
}
