//! Property tests: backends agree, and agreement survives transport.

#[allow(dead_code, unreachable_pub)]
mod helpers;

use cesk_types::{HashIdMap, Node};
use cesk_vm::{BackendKind, Machine, Value};
use proptest::strategy::{Strategy, ValueTree};
use proptest::test_runner::{Config, RngAlgorithm, TestRng, TestRunner};

use helpers::{agreed_with, bounded_machine, outcome, program_strategy, SEED};

const BUDGET: u64 = 20_000;

fn make_runner(cases: u32) -> TestRunner {
    TestRunner::new_with_rng(
        Config {
            cases,
            ..Config::default()
        },
        TestRng::from_seed(RngAlgorithm::ChaCha, &SEED),
    )
}

fn sample(runner: &mut TestRunner) -> Node {
    program_strategy()
        .new_tree(runner)
        .expect("strategy produces a tree")
        .current()
}

// ============================================================================
// Backend Agreement
// ============================================================================

#[test]
fn prop_backends_agree_on_outcome() {
    let mut runner = make_runner(200);
    for _ in 0..200 {
        let program = sample(&mut runner);
        agreed_with(&program, |kind| bounded_machine(kind, BUDGET));
    }
}

#[test]
fn prop_halted_machines_have_empty_continuations() {
    let mut runner = make_runner(100);
    for _ in 0..100 {
        let program = sample(&mut runner);
        for kind in BackendKind::ALL {
            let mut vm = bounded_machine(kind, BUDGET);
            if vm.eval(&program).is_ok() {
                assert!(vm.is_halted(), "{kind}");
                assert!(vm.continuation().is_empty(), "{kind}");
            }
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

#[test]
fn prop_bundled_programs_evaluate_the_same() {
    let mut runner = make_runner(100);
    for _ in 0..100 {
        let program = sample(&mut runner);
        for kind in BackendKind::ALL {
            let mut source = bounded_machine(kind, BUDGET);
            let root = source.load_ast(&program).unwrap();
            let bundle = source.export_ast(root).unwrap();
            let expected = outcome(source.run());

            let mut target = bounded_machine(kind, BUDGET);
            let imported = target.import_ast(&bundle, &mut HashIdMap::new()).unwrap();
            target.load_entity(imported).unwrap();
            let got = outcome(target.run());
            // Closures name entities, which differ between the machines.
            if !matches!(expected, Ok(Value::Closure(_))) {
                assert_eq!(expected, got, "{kind} on {}", program.to_json());
            }
        }
    }
}

#[test]
fn prop_parked_programs_resume_after_migration() {
    let mut runner = make_runner(50);
    for _ in 0..50 {
        // Either branch parks inside (+ 1 □).
        let program = sample(&mut runner);
        let parking = Node::call("+", [Node::int(1), Node::Park]);
        let wrapped = Node::if_(program, parking.clone(), parking);
        for kind in BackendKind::ALL {
            let mut source = bounded_machine(kind, BUDGET);
            let Ok(Value::Parked(id)) = source.eval(&wrapped) else {
                continue;
            };
            let bundle = source.export_continuation(id).unwrap();
            let mut target = bounded_machine(kind, BUDGET);
            let local = target.import_continuation(&bundle, &mut HashIdMap::new()).unwrap();
            target.resume(local, Value::Int(41)).unwrap();
            assert_eq!(target.run().unwrap(), Value::Int(42), "{kind}");
        }
    }
}
