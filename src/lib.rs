//! CESK machine runtime over content-addressed AST facts.
//!
//! Re-exports the fact model ([`types`]) and the machine ([`vm`]) under one
//! crate. Most callers need only the prelude:
//!
//! ```ignore
//! use cesk::prelude::*;
//!
//! let mut vm = create_default(BackendKind::Stack);
//! assert_eq!(vm.eval(&Node::int(42))?, Value::Int(42));
//! ```

pub use cesk_types as types;
pub use cesk_vm as vm;

pub mod prelude {
    pub use cesk_types::{AstBundle, EntityId, FactSet, HashIdMap, Node, NodeHash, StreamCapacity};
    pub use cesk_vm::{
        create, create_default, BackendKind, ContinuationBundle, FaultClass, Machine, OverflowPolicy, VMConfig,
        Value, VmError,
    };
}
