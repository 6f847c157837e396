//! CESK abstract machine over decomposed AST facts.
//!
//! A program is loaded as facts (see `cesk_types`) and evaluated by one of
//! four interchangeable backends. Each implements [`Machine`] and agrees on
//! values, faults, streams and parked continuations.
//!
//! # Architecture
//!
//! - **Contract** ([`machine`]): the [`Machine`] trait, atomic steps,
//!   AST and continuation transport
//! - **Walking backends** ([`walk`], [`tree`], [`semantic`]): direct
//!   reduction over linked terms or over raw facts
//! - **Compiling backends** ([`stack`], [`register`]): lazily compiled
//!   per-entity code units
//! - **Store** ([`stream`]): bounded streams with independent cursors
//! - **Continuations** ([`park`], [`migrate`]): one-shot parking and
//!   hash-addressed bundles that move between machines
//!
//! # Usage
//!
//! ```ignore
//! use cesk_types::Node;
//! use cesk_vm::{create_default, BackendKind, Machine};
//!
//! let mut vm = create_default(BackendKind::Register);
//! let value = vm.eval(&Node::call("+", [Node::int(10), Node::int(20)]))?;
//! ```

pub mod config;
pub mod continuation;
pub mod env;
pub mod error;
pub mod faults;
pub mod loader;
pub mod machine;
pub mod migrate;
pub mod park;
pub mod primitives;
pub mod register;
pub mod semantic;
pub mod stack;
pub mod stream;
pub mod trace;
pub mod tree;
pub mod value;
pub mod walk;

pub use config::VMConfig;
pub use continuation::FrameKind;
pub use env::Env;
pub use error::{ConfigError, VmError};
pub use faults::{classify, fault_code, fault_code_of, FaultClass};
pub use loader::ProgramImage;
pub use machine::{create, create_default, BackendKind, CodeAddr, ControlView, Machine, MachineCore, StepResult};
pub use migrate::ContinuationBundle;
pub use park::{ParkRegistry, ParkedContinuation, ParkedState};
pub use primitives::{prelude, Primitive};
pub use register::RegisterMachine;
pub use semantic::SemanticMachine;
pub use stack::StackMachine;
pub use stream::{OverflowPolicy, Store, Stream};
pub use trace::MachineEvent;
pub use tree::TreeMachine;
pub use value::{Closure, CursorId, ParkedId, StreamId, Value};
