//! Decomposition of a [`Node`] tree into datoms, and the inverse.
//!
//! Children are emitted before their parents and ids are allocated upward,
//! so the root always carries the maximum id of its batch.

use crate::ast::Node;
use crate::datom::{Atom, Datom, EntityId, TxId};
use crate::error::AstError;
use crate::facts::{FactSet, NodeView};
use crate::schema;
use std::collections::BTreeMap;

/// Default first provisional id.
pub const DEFAULT_ID_START: EntityId = -1_000_000_000;

/// Allocator for provisional entity ids and transaction numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decomposer {
    next: EntityId,
    tx: TxId,
}

impl Default for Decomposer {
    fn default() -> Self {
        Self::new(DEFAULT_ID_START)
    }
}

impl Decomposer {
    #[must_use]
    pub fn new(start: EntityId) -> Self {
        Self { next: start, tx: 0 }
    }

    /// Next id that [`Decomposer::allocate`] would hand out.
    #[must_use]
    pub fn peek(&self) -> EntityId {
        self.next
    }

    /// Last transaction number issued, 0 before the first batch.
    #[must_use]
    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Provisional ids stay negative.
    pub fn allocate(&mut self) -> Result<EntityId, AstError> {
        if self.next >= 0 {
            return Err(AstError::IdSpaceExhausted { next: self.next });
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    /// Open a new transaction.
    pub fn begin(&mut self) -> TxId {
        self.tx += 1;
        self.tx
    }

    /// Decompose `node` as one transaction.
    pub fn decompose(&mut self, node: &Node) -> Result<Decomposition, AstError> {
        let tx = self.begin();
        let mut datoms = Vec::with_capacity(node.size() * 3);
        let root = self.emit(node, tx, &mut datoms)?;
        Ok(Decomposition { root, tx, datoms })
    }

    /// Children are emitted before their parents from an explicit work
    /// stack; `out` receives each node's datoms as its id is allocated.
    fn emit(&mut self, root: &Node, tx: TxId, out: &mut Vec<Datom>) -> Result<EntityId, AstError> {
        enum Visit<'a> {
            Enter(&'a Node),
            Exit(&'a Node, usize),
        }
        let mut stack = vec![Visit::Enter(root)];
        let mut ids: Vec<EntityId> = Vec::new();
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(node) => {
                    let children = node.children();
                    stack.push(Visit::Exit(node, children.len()));
                    stack.extend(children.into_iter().rev().map(Visit::Enter));
                }
                Visit::Exit(node, arity) => {
                    let at = ids.len().checked_sub(arity).ok_or_else(|| AstError::invalid("node", "child count mismatch"))?;
                    let children = ids.split_off(at);
                    ids.push(self.emit_node(node, &children, tx, out)?);
                }
            }
        }
        ids.pop()
            .ok_or_else(|| AstError::invalid("node", "empty decomposition"))
    }

    fn emit_node(
        &mut self,
        node: &Node,
        children: &[EntityId],
        tx: TxId,
        out: &mut Vec<Datom>,
    ) -> Result<EntityId, AstError> {
        let child = |i: usize| {
            children
                .get(i)
                .copied()
                .map(Atom::Ref)
                .ok_or_else(|| AstError::invalid(node.node_type().keyword(), "missing child"))
        };
        let mut fields: Vec<(&'static str, Atom)> = Vec::new();
        match node {
            Node::Literal(lit) => fields.push((schema::VALUE, lit.to_atom())),
            Node::Variable { name } => fields.push((schema::NAME, Atom::Str(name.clone()))),
            Node::Lambda { params, .. } => {
                let params = params.iter().cloned().map(Atom::Str).collect();
                fields.push((schema::PARAMS, Atom::Seq(params)));
                fields.push((schema::BODY, child(0)?));
            }
            Node::Application { .. } => {
                fields.push((schema::OPERATOR, child(0)?));
                let operands = children.iter().skip(1).copied().map(Atom::Ref).collect();
                fields.push((schema::OPERANDS, Atom::Seq(operands)));
            }
            Node::If { .. } => {
                fields.push((schema::TEST, child(0)?));
                fields.push((schema::CONSEQUENT, child(1)?));
                fields.push((schema::ALTERNATE, child(2)?));
            }
            Node::StreamMake { capacity } => {
                if let Some(capacity) = capacity {
                    fields.push((schema::CAPACITY, capacity.to_atom()));
                }
            }
            Node::StreamPut { .. } => {
                fields.push((schema::TARGET, child(0)?));
                fields.push((schema::PAYLOAD, child(1)?));
            }
            Node::StreamCursor { .. } | Node::StreamNext { .. } => {
                fields.push((schema::SOURCE, child(0)?));
            }
            Node::Park => {}
            Node::Resume { .. } => {
                fields.push((schema::PARKED, child(0)?));
                fields.push((schema::PAYLOAD, child(1)?));
            }
        }

        let id = self.allocate()?;
        out.push(Datom::new(
            id,
            schema::TYPE,
            Atom::Keyword(node.node_type().keyword().to_string()),
            tx,
        ));
        out.extend(fields.into_iter().map(|(a, v)| Datom::new(id, a, v, tx)));
        Ok(id)
    }
}

/// Output of one decomposition batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decomposition {
    pub root: EntityId,
    pub tx: TxId,
    pub datoms: Vec<Datom>,
}

impl Decomposition {
    pub fn facts(&self) -> Result<FactSet, AstError> {
        FactSet::from_datoms(&self.datoms)
    }
}

/// Decompose with a fresh allocator. `id_start` defaults to
/// [`DEFAULT_ID_START`].
pub fn decompose(node: &Node, id_start: Option<EntityId>) -> Result<Decomposition, AstError> {
    Decomposer::new(id_start.unwrap_or(DEFAULT_ID_START)).decompose(node)
}

/// Rebuild the [`Node`] tree rooted at `root`.
///
/// Shared subtrees are copied for every parent but the last.
pub fn recompose(facts: &FactSet, root: EntityId) -> Result<Node, AstError> {
    let order = facts.post_order(&[root])?;
    let mut uses: BTreeMap<EntityId, usize> = BTreeMap::new();
    for id in &order {
        for child in facts.view(*id)?.children() {
            *uses.entry(*child).or_default() += 1;
        }
    }
    let mut built: BTreeMap<EntityId, Node> = BTreeMap::new();
    for id in order {
        // post_order guarantees every child is already built.
        let view = facts.view(id)?;
        let take = |child: EntityId| {
            let last = uses.get_mut(&child).map_or(true, |n| {
                *n -= 1;
                *n == 0
            });
            let node = if last {
                built.remove(&child)
            } else {
                built.get(&child).cloned()
            };
            node.ok_or(AstError::UnknownEntity { entity: child })
        };
        let node = match view.try_map(take)? {
            NodeView::Literal(lit) => Node::Literal(lit),
            NodeView::Variable { name } => Node::Variable { name },
            NodeView::Lambda { params, body } => Node::Lambda {
                params,
                body: Box::new(body),
            },
            NodeView::Application { operator, operands } => Node::Application {
                operator: Box::new(operator),
                operands,
            },
            NodeView::If {
                test,
                consequent,
                alternate,
            } => Node::if_(test, consequent, alternate),
            NodeView::StreamMake { capacity } => Node::StreamMake { capacity },
            NodeView::StreamPut { target, value } => Node::stream_put(target, value),
            NodeView::StreamCursor { source } => Node::stream_cursor(source),
            NodeView::StreamNext { source } => Node::stream_next(source),
            NodeView::Park => Node::Park,
            NodeView::Resume { parked, value } => Node::resume(parked, value),
        };
        built.insert(id, node);
    }
    built
        .remove(&root)
        .ok_or(AstError::UnknownEntity { entity: root })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::apply(
            Node::lambda(["x"], Node::call("+", [Node::var("x"), Node::int(1)])),
            [Node::int(10)],
        )
    }

    #[test]
    fn test_root_is_max_id() {
        let d = decompose(&sample(), Some(-100)).unwrap();
        let max = d.datoms.iter().map(|f| f.e).max().unwrap();
        assert_eq!(d.root, max);
        assert_eq!(d.root, -100 + sample().size() as i64 - 1);
    }

    #[test]
    fn test_children_before_parents() {
        let d = decompose(&sample(), None).unwrap();
        let facts = d.facts().unwrap();
        for datom in &d.datoms {
            for child in datom.v.refs() {
                assert!(child < datom.e, "child {child} after parent {}", datom.e);
                assert!(facts.contains(child));
            }
        }
    }

    #[test]
    fn test_single_transaction() {
        let mut alloc = Decomposer::new(-50);
        let first = alloc.decompose(&Node::int(1)).unwrap();
        let second = alloc.decompose(&Node::int(2)).unwrap();
        assert!(first.datoms.iter().all(|d| d.tx == first.tx));
        assert!(second.tx > first.tx);
        assert!(second.root > first.root);
    }

    #[test]
    fn test_recompose_inverts() {
        let node = sample();
        let d = decompose(&node, Some(-40)).unwrap();
        assert_eq!(recompose(&d.facts().unwrap(), d.root).unwrap(), node);
    }

    #[test]
    fn test_id_space_exhausted() {
        let err = decompose(&sample(), Some(-2)).unwrap_err();
        assert_eq!(err, AstError::IdSpaceExhausted { next: 0 });
    }

    #[test]
    fn test_deep_tree_decomposes_and_recomposes() {
        let depth = 100_000;
        let mut node = Node::int(0);
        for _ in 0..depth {
            node = Node::call("+", [node, Node::int(1)]);
        }
        let d = decompose(&node, None).unwrap();
        assert_eq!(d.datoms.len(), node.size() * 2 + depth);
        let facts = d.facts().unwrap();
        let NodeView::Application { operands, .. } = facts.view(d.root).unwrap() else {
            panic!("root is not an application");
        };
        assert_eq!(operands.len(), 2);
        let rebuilt = recompose(&facts, d.root).unwrap();
        assert_eq!(rebuilt.size(), node.size());
    }
}
