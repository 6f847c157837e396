//! Run one program on a chosen backend and print the result as JSON.

use serde::Serialize;
use std::path::PathBuf;

use cesk_types::{AstBundle, HashIdMap, Node};
use cesk_vm::{create, fault_code_of, prelude, BackendKind, MachineEvent, VMConfig, Value};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let mut program_path: Option<PathBuf> = None;
    let mut bundle_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut export_path: Option<PathBuf> = None;
    let mut backend = BackendKind::Tree;
    let mut with_trace = false;
    let mut pretty = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--program" => program_path = args.next().map(PathBuf::from),
            "--bundle" => bundle_path = args.next().map(PathBuf::from),
            "--config" => config_path = args.next().map(PathBuf::from),
            "--export" => export_path = args.next().map(PathBuf::from),
            "--backend" => {
                let name = args.next().unwrap_or_else(|| usage("missing backend name"));
                backend = name.parse().unwrap_or_else(|e: String| usage(&e));
            }
            "--trace" => with_trace = true,
            "--pretty" => pretty = true,
            other => usage(&format!("unknown argument `{other}`")),
        }
    }

    let config = match config_path {
        Some(path) => VMConfig::from_file(&path).unwrap_or_else(|e| fatal(&e)),
        None => VMConfig::default(),
    };
    let mut machine = create(backend, config, prelude());

    let root = match (program_path, bundle_path) {
        (Some(path), None) => {
            let text = read(&path);
            let node = Node::from_json_str(&text).unwrap_or_else(|e| fatal(&e));
            machine.load_ast(&node).unwrap_or_else(|e| fatal(&e))
        }
        (None, Some(path)) => {
            let bundle = AstBundle::from_json_str(&read(&path)).unwrap_or_else(|e| fatal(&e));
            let root = machine
                .import_ast(&bundle, &mut HashIdMap::new())
                .unwrap_or_else(|e| fatal(&e));
            machine.load_entity(root).unwrap_or_else(|e| fatal(&e));
            root
        }
        _ => usage("give exactly one of --program or --bundle"),
    };

    if let Some(path) = export_path {
        let bundle = machine.export_ast(root).unwrap_or_else(|e| fatal(&e));
        let json = bundle.to_json_string().unwrap_or_else(|e| fatal(&e));
        std::fs::write(&path, format!("{json}\n"))
            .unwrap_or_else(|e| fatal(&format!("write {}: {e}", path.display())));
    }

    let outcome = machine.run();
    let output = RunOutput {
        backend: backend.name(),
        steps: machine.core().steps(),
        value: outcome.as_ref().ok().cloned(),
        fault: outcome.as_ref().err().map(|e| FaultOutput {
            code: fault_code_of(e),
            message: e.to_string(),
        }),
        trace: with_trace.then(|| machine.trace().to_vec()),
    };

    let json = if pretty {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string(&output)
    }
    .unwrap_or_else(|e| fatal(&format!("serialize output: {e}")));
    println!("{json}");

    if output.fault.is_some() {
        std::process::exit(2);
    }
}

#[derive(Debug, Serialize)]
struct RunOutput {
    backend: &'static str,
    steps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault: Option<FaultOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<Vec<MachineEvent>>,
}

#[derive(Debug, Serialize)]
struct FaultOutput {
    code: &'static str,
    message: String,
}

fn read(path: &PathBuf) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| fatal(&format!("read {}: {e}", path.display())))
}

fn usage(msg: &str) -> ! {
    eprintln!("{msg}");
    eprintln!(
        "usage: cesk-run (--program <ast.json> | --bundle <bundle.json>) \
         [--backend tree|stack|register|semantic] [--config <file>] [--export <file>] [--trace] [--pretty]"
    );
    std::process::exit(1);
}

fn fatal(err: &dyn std::fmt::Display) -> ! {
    eprintln!("error: {err}");
    std::process::exit(1);
}
