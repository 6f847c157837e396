//! End-to-end flows across the facade: JSON in, JSON across the wire,
//! values out.

use assert_matches::assert_matches;
use cesk::prelude::*;
use serde_json::json;

fn program_json() -> serde_json::Value {
    // ((λx. (+ x (park))) 10)
    json!({
        "type": "application",
        "operator": {
            "type": "lambda",
            "params": ["x"],
            "body": {
                "type": "application",
                "operator": {"type": "variable", "name": "+"},
                "operands": [
                    {"type": "variable", "name": "x"},
                    {"type": "park"}
                ]
            }
        },
        "operands": [{"type": "literal", "value": 10}]
    })
}

#[test]
fn test_json_program_runs_on_every_backend() {
    let node = Node::from_json(&program_json()).unwrap();
    for kind in BackendKind::ALL {
        let mut machine = create_default(kind);
        assert_matches!(machine.eval(&node).unwrap(), Value::Parked(_));
    }
}

#[test]
fn test_sender_and_receiver_exchange_text_bundles() {
    let node = Node::from_json(&program_json()).unwrap();
    for kind in BackendKind::ALL {
        let mut sender = create_default(kind);
        let Value::Parked(id) = sender.eval(&node).unwrap() else {
            panic!("{kind} did not park");
        };
        let ast_wire = sender.export_ast(sender.core().root().unwrap()).unwrap().to_json_string().unwrap();
        let cont_wire = sender.export_continuation(id).unwrap().to_json_string().unwrap();

        let mut receiver = create_default(kind);
        let mut known = HashIdMap::new();
        receiver
            .import_ast(&AstBundle::from_json_str(&ast_wire).unwrap(), &mut known)
            .unwrap();
        let before = receiver.facts().len();
        let local = receiver
            .import_continuation(&ContinuationBundle::from_json_str(&cont_wire).unwrap(), &mut known)
            .unwrap();
        // The program arrived first, so the continuation adds no syntax.
        assert_eq!(receiver.facts().len(), before, "{kind}");
        receiver.resume(local, Value::Int(5)).unwrap();
        assert_eq!(receiver.run().unwrap(), Value::Int(15), "{kind}");
    }
}

#[test]
fn test_config_from_toml_shapes_streams() {
    let config = VMConfig::from_toml_str("default_stream_capacity = 1\nstream_overflow = \"fail\"\n").unwrap();
    assert_eq!(config.stream_overflow, OverflowPolicy::Fail);
    let program = Node::let_(
        "s",
        Node::stream_make(None),
        Node::stream_put(Node::stream_put(Node::var("s"), Node::int(1)), Node::int(2)),
    );
    for kind in BackendKind::ALL {
        let mut machine = create(kind, config.clone(), cesk::vm::prelude());
        let err = machine.eval(&program).unwrap_err();
        assert_eq!(cesk::vm::classify(&err), FaultClass::Stream, "{kind}");
    }
}
