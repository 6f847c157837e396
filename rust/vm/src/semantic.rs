//! Semantic backend: interprets the fact arena directly.
//!
//! Control is an entity id and every step reads its node back from facts,
//! so the program under evaluation can be queried like any other data
//! while it runs.

use std::collections::BTreeSet;

use cesk_types::{AstError, Atom, EntityId, FactSet, NodeType, NodeView};

use crate::config::VMConfig;
use crate::env::Env;
use crate::error::VmError;
use crate::machine::BackendKind;
use crate::park::ParkedState;
use crate::value::ParkedId;
use crate::walk::{Control, Frame, Syntax, WalkMachine};

#[derive(Debug, Default, Clone, Copy)]
pub struct FactSyntax;

impl Syntax for FactSyntax {
    type Ref = EntityId;

    fn entity(node: &EntityId) -> EntityId {
        *node
    }

    fn view(&self, facts: &FactSet, node: &EntityId) -> Result<NodeView<EntityId>, VmError> {
        Ok(facts.view(*node)?)
    }

    fn resolve(&self, facts: &FactSet, entity: EntityId) -> Result<EntityId, VmError> {
        if facts.contains(entity) {
            Ok(entity)
        } else {
            Err(VmError::Malformed(AstError::UnknownEntity { entity }))
        }
    }
}

pub type SemanticMachine = WalkMachine<FactSyntax>;

impl WalkMachine<FactSyntax> {
    #[must_use]
    pub fn new(config: VMConfig, env: Env) -> Self {
        Self::with_syntax(BackendKind::Semantic, config, env, FactSyntax)
    }

    /// Every `(entity, value)` carrying `attribute`.
    #[must_use]
    pub fn scan_attr(&self, attribute: &str) -> Vec<(EntityId, Atom)> {
        self.core
            .facts
            .scan_attr(attribute)
            .into_iter()
            .map(|(e, v)| (e, v.clone()))
            .collect()
    }

    #[must_use]
    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<EntityId> {
        self.core.facts.nodes_of_type(node_type)
    }

    /// The node under evaluation, if control is a node.
    #[must_use]
    pub fn focus(&self) -> Option<EntityId> {
        match &self.state()?.control {
            Control::Eval { node, .. } => Some(*node),
            Control::Return(_) => None,
        }
    }

    /// Nodes the live continuation will still evaluate.
    #[must_use]
    pub fn pending_entities(&self) -> BTreeSet<EntityId> {
        self.state()
            .map(|s| frame_entities(s.cont.iter()))
            .unwrap_or_default()
    }

    /// Nodes a parked continuation will evaluate once resumed.
    pub fn parked_entities(&self, id: ParkedId) -> Result<BTreeSet<EntityId>, VmError> {
        match &self.core.parked_for(id, BackendKind::Semantic)?.state {
            ParkedState::Walk(snapshot) => Ok(frame_entities(snapshot.frames.iter())),
            _ => Err(VmError::internal("semantic backend holds a compiled snapshot")),
        }
    }
}

fn frame_entities<'a>(frames: impl Iterator<Item = &'a Frame<EntityId>>) -> BTreeSet<EntityId> {
    frames.flat_map(|f| f.refs().into_iter().copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, StepResult};
    use crate::primitives::prelude;
    use crate::value::Value;
    use cesk_types::{schema, Node};

    #[test]
    fn test_queries_see_running_program() {
        let mut machine = SemanticMachine::new(VMConfig::default(), prelude());
        machine
            .load_ast(&Node::if_(Node::bool(true), Node::keyword("yes"), Node::keyword("no")))
            .unwrap();
        assert_eq!(machine.nodes_of_type(NodeType::If).len(), 1);
        let literals = machine.scan_attr(schema::VALUE);
        assert_eq!(literals.len(), 3);

        assert_eq!(machine.step().unwrap(), StepResult::Continue);
        // Test pushed: both branches still pending.
        assert_eq!(machine.pending_entities().len(), 2);
        assert!(machine.focus().is_some());
        assert_eq!(machine.run().unwrap(), Value::keyword("yes"));
        assert!(machine.pending_entities().is_empty());
    }

    #[test]
    fn test_parked_entities_reports_remaining_work() {
        let mut machine = SemanticMachine::new(VMConfig::default(), prelude());
        let program = Node::call("+", [Node::Park, Node::int(1)]);
        let Value::Parked(id) = machine.eval(&program).unwrap() else {
            panic!("expected parked handle");
        };
        let remaining = machine.parked_entities(id).unwrap();
        assert_eq!(remaining.len(), 1);
        let literal = *remaining.iter().next().unwrap();
        assert_eq!(machine.core().facts.node_type(literal).unwrap(), NodeType::Literal);
    }
}
