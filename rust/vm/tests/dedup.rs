//! Hash-addressed transport reuses what the receiver already holds.

#[allow(dead_code, unreachable_pub)]
mod helpers;

use cesk_types::hash::{content_hashes, hash_index};
use cesk_types::{HashIdMap, Node};
use cesk_vm::{BackendKind, Machine, MachineEvent, Value};

use helpers::{machine, park_in_addition};

fn imported_created(vm: &dyn Machine) -> Vec<usize> {
    vm.trace()
        .iter()
        .filter_map(|e| match e {
            MachineEvent::Imported { created, .. } => Some(*created),
            _ => None,
        })
        .collect()
}

fn known_of(vm: &dyn Machine) -> HashIdMap {
    hash_index(&content_hashes(vm.facts()).unwrap())
}

// ============================================================================
// AST Bundles
// ============================================================================

#[test]
fn test_ast_reimport_creates_nothing() {
    let program = Node::call("+", [Node::int(10), Node::call("*", [Node::int(2), Node::int(3)])]);
    for kind in BackendKind::ALL {
        let mut source = machine(kind);
        let root = source.load_ast(&program).unwrap();
        let bundle = source.export_ast(root).unwrap();

        let mut target = machine(kind);
        let mut known = HashIdMap::new();
        let first = target.import_ast(&bundle, &mut known).unwrap();
        let facts = target.facts().len();
        let second = target.import_ast(&bundle, &mut known).unwrap();
        assert_eq!(first, second, "{kind}");
        assert_eq!(target.facts().len(), facts, "{kind}");

        target.load_entity(first).unwrap();
        assert_eq!(target.run().unwrap(), Value::Int(16), "{kind}");
    }
}

#[test]
fn test_shared_subtrees_are_reused() {
    let shared = Node::call("*", [Node::int(6), Node::int(7)]);
    let mut source = machine(BackendKind::Tree);
    let bigger = source.load_ast(&Node::call("+", [shared.clone(), Node::int(1)])).unwrap();
    let bundle = source.export_ast(bigger).unwrap();

    let mut target = machine(BackendKind::Tree);
    target.eval(&shared).unwrap();
    let mut known = known_of(target.as_ref());
    let before = target.facts().entity_ids().count();
    let root = target.import_ast(&bundle, &mut known).unwrap();
    // Only the outer call, `+` and `1` are new.
    assert_eq!(target.facts().entity_ids().count(), before + 3);
    target.load_entity(root).unwrap();
    assert_eq!(target.run().unwrap(), Value::Int(43));
}

// ============================================================================
// Continuation Bundles
// ============================================================================

#[test]
fn test_continuation_reimport_creates_no_entities() {
    for kind in BackendKind::ALL {
        let mut source = machine(kind);
        let Value::Parked(id) = source.eval(&park_in_addition()).unwrap() else {
            panic!("{kind} did not park");
        };
        let bundle = source.export_continuation(id).unwrap();

        let mut target = machine(kind);
        let mut known = HashIdMap::new();
        let a = target.import_continuation(&bundle, &mut known).unwrap();
        let b = target.import_continuation(&bundle, &mut known).unwrap();
        assert_ne!(a, b, "{kind}");
        let created = imported_created(target.as_ref());
        assert_eq!(created.len(), 2, "{kind}");
        assert!(created[0] > 0, "{kind}");
        assert_eq!(created[1], 0, "{kind}");

        // Both registrations stay independently resumable.
        target.resume(b, Value::Int(1)).unwrap();
        assert_eq!(target.run().unwrap(), Value::Int(11), "{kind}");
        target.resume(a, Value::Int(2)).unwrap();
        assert_eq!(target.run().unwrap(), Value::Int(12), "{kind}");
    }
}

#[test]
fn test_continuation_returning_home_creates_nothing() {
    for kind in BackendKind::ALL {
        let mut vm = machine(kind);
        let Value::Parked(id) = vm.eval(&park_in_addition()).unwrap() else {
            panic!("{kind} did not park");
        };
        let bundle = vm.export_continuation(id).unwrap();
        let mut known = known_of(vm.as_ref());
        let facts = vm.facts().len();
        let local = vm.import_continuation(&bundle, &mut known).unwrap();
        assert_eq!(imported_created(vm.as_ref()), vec![0], "{kind}");
        assert_eq!(vm.facts().len(), facts, "{kind}");
        vm.resume(local, Value::Int(3)).unwrap();
        assert_eq!(vm.run().unwrap(), Value::Int(13), "{kind}");
    }
}
