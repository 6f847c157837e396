//! The fact arena: one flat table of entities indexed by id.
//!
//! Ingestion normalizes both wire shapes of multi-valued attributes into a
//! single `Atom::Seq`, so hashing and execution only ever see one form.
//! Derived facts are kept beside, never inside, an entity's attribute set.

use crate::ast::{Literal, StreamCapacity};
use crate::datom::{Atom, Datom, EntityId, TxId};
use crate::error::AstError;
use crate::schema::{self, NodeType};
use std::collections::{BTreeMap, BTreeSet};

/// Structured view of one node with children of type `C`.
///
/// The semantic backend reads `NodeView<EntityId>` straight from facts on
/// every step; the tree backend links children as shared terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeView<C = EntityId> {
    Literal(Literal),
    Variable { name: String },
    Lambda { params: Vec<String>, body: C },
    Application { operator: C, operands: Vec<C> },
    If { test: C, consequent: C, alternate: C },
    StreamMake { capacity: Option<StreamCapacity> },
    StreamPut { target: C, value: C },
    StreamCursor { source: C },
    StreamNext { source: C },
    Park,
    Resume { parked: C, value: C },
}

impl<C> NodeView<C> {
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeView::Literal(_) => NodeType::Literal,
            NodeView::Variable { .. } => NodeType::Variable,
            NodeView::Lambda { .. } => NodeType::Lambda,
            NodeView::Application { .. } => NodeType::Application,
            NodeView::If { .. } => NodeType::If,
            NodeView::StreamMake { .. } => NodeType::StreamMake,
            NodeView::StreamPut { .. } => NodeType::StreamPut,
            NodeView::StreamCursor { .. } => NodeType::StreamCursor,
            NodeView::StreamNext { .. } => NodeType::StreamNext,
            NodeView::Park => NodeType::Park,
            NodeView::Resume { .. } => NodeType::Resume,
        }
    }

    /// Children in field declaration order.
    pub fn children(&self) -> Vec<&C> {
        match self {
            NodeView::Literal(_)
            | NodeView::Variable { .. }
            | NodeView::StreamMake { .. }
            | NodeView::Park => Vec::new(),
            NodeView::Lambda { body, .. } => vec![body],
            NodeView::Application { operator, operands } => {
                std::iter::once(operator).chain(operands.iter()).collect()
            }
            NodeView::If {
                test,
                consequent,
                alternate,
            } => vec![test, consequent, alternate],
            NodeView::StreamPut { target, value } => vec![target, value],
            NodeView::StreamCursor { source } | NodeView::StreamNext { source } => vec![source],
            NodeView::Resume { parked, value } => vec![parked, value],
        }
    }

    /// Replace every child handle, stopping at the first failure.
    pub fn try_map<D, E>(self, mut f: impl FnMut(C) -> Result<D, E>) -> Result<NodeView<D>, E> {
        Ok(match self {
            NodeView::Literal(lit) => NodeView::Literal(lit),
            NodeView::Variable { name } => NodeView::Variable { name },
            NodeView::Lambda { params, body } => NodeView::Lambda {
                params,
                body: f(body)?,
            },
            NodeView::Application { operator, operands } => NodeView::Application {
                operator: f(operator)?,
                operands: operands.into_iter().map(&mut f).collect::<Result<_, _>>()?,
            },
            NodeView::If {
                test,
                consequent,
                alternate,
            } => NodeView::If {
                test: f(test)?,
                consequent: f(consequent)?,
                alternate: f(alternate)?,
            },
            NodeView::StreamMake { capacity } => NodeView::StreamMake { capacity },
            NodeView::StreamPut { target, value } => NodeView::StreamPut {
                target: f(target)?,
                value: f(value)?,
            },
            NodeView::StreamCursor { source } => NodeView::StreamCursor { source: f(source)? },
            NodeView::StreamNext { source } => NodeView::StreamNext { source: f(source)? },
            NodeView::Park => NodeView::Park,
            NodeView::Resume { parked, value } => NodeView::Resume {
                parked: f(parked)?,
                value: f(value)?,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Entity {
    attrs: BTreeMap<String, Atom>,
    derived: BTreeMap<String, Atom>,
    tx: TxId,
}

/// Flat table of decomposed entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactSet {
    entities: BTreeMap<EntityId, Entity>,
}

impl FactSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a batch of datoms in either multi-value shape.
    ///
    /// Each batch must carry whole entities: facts for one entity are not
    /// spread over several batches.
    pub fn from_datoms<'a>(datoms: impl IntoIterator<Item = &'a Datom>) -> Result<Self, AstError> {
        let mut facts = FactSet::new();
        for datom in datoms {
            facts.ingest(datom)?;
        }
        facts.normalize();
        Ok(facts)
    }

    fn ingest(&mut self, datom: &Datom) -> Result<(), AstError> {
        let entity = self.entities.entry(datom.e).or_default();
        entity.tx = entity.tx.max(datom.tx);
        if datom.is_derived() {
            entity.derived.insert(datom.a.clone(), datom.v.clone());
            return Ok(());
        }
        if schema::is_many(&datom.a) {
            let slot = entity
                .attrs
                .entry(datom.a.clone())
                .or_insert_with(|| Atom::Seq(Vec::new()));
            if let Atom::Seq(items) = slot {
                match &datom.v {
                    Atom::Seq(more) => items.extend(more.iter().cloned()),
                    scalar => items.push(scalar.clone()),
                }
            }
            return Ok(());
        }
        match entity.attrs.get(&datom.a) {
            Some(existing) if existing != &datom.v => Err(AstError::ConflictingFact {
                entity: datom.e,
                attribute: datom.a.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                entity.attrs.insert(datom.a.clone(), datom.v.clone());
                Ok(())
            }
        }
    }

    // A materialized empty list has no facts at all.
    fn normalize(&mut self) {
        for entity in self.entities.values_mut() {
            let Some(node_type) = entity
                .attrs
                .get(schema::TYPE)
                .and_then(Atom::as_keyword)
                .and_then(|k| NodeType::from_keyword(k).ok())
            else {
                continue;
            };
            for attr in node_type.list_attributes() {
                entity
                    .attrs
                    .entry((*attr).to_string())
                    .or_insert_with(|| Atom::Seq(Vec::new()));
            }
        }
    }

    /// Ingest another batch; see [`FactSet::merge`].
    pub fn extend<'a>(&mut self, datoms: impl IntoIterator<Item = &'a Datom>) -> Result<usize, AstError> {
        let batch = FactSet::from_datoms(datoms)?;
        self.merge(batch)
    }

    /// Merge another fact set. Entities already present must carry the same
    /// attributes; nothing is inserted if any entity conflicts. Returns the
    /// number of newly added entities.
    pub fn merge(&mut self, other: FactSet) -> Result<usize, AstError> {
        for (id, incoming) in &other.entities {
            if let Some(existing) = self.entities.get(id) {
                if existing.attrs != incoming.attrs {
                    return Err(AstError::EntityConflict { entity: *id });
                }
            }
        }
        let mut added = 0;
        for (id, incoming) in other.entities {
            match self.entities.get_mut(&id) {
                Some(existing) => existing.derived.extend(incoming.derived),
                None => {
                    self.entities.insert(id, incoming);
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[must_use]
    pub fn contains(&self, entity: EntityId) -> bool {
        self.entities.contains_key(&entity)
    }

    /// Entity ids in ascending order.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Non-derived attributes of an entity, in canonical order.
    #[must_use]
    pub fn attributes(&self, entity: EntityId) -> Option<&BTreeMap<String, Atom>> {
        self.entities.get(&entity).map(|e| &e.attrs)
    }

    #[must_use]
    pub fn get(&self, entity: EntityId, attribute: &str) -> Option<&Atom> {
        self.entities.get(&entity)?.attrs.get(attribute)
    }

    #[must_use]
    pub fn derived(&self, entity: EntityId, attribute: &str) -> Option<&Atom> {
        self.entities.get(&entity)?.derived.get(attribute)
    }

    pub fn set_derived(
        &mut self,
        entity: EntityId,
        attribute: &str,
        value: Atom,
    ) -> Result<(), AstError> {
        let slot = self
            .entities
            .get_mut(&entity)
            .ok_or(AstError::UnknownEntity { entity })?;
        slot.derived.insert(attribute.to_string(), value);
        Ok(())
    }

    #[must_use]
    pub fn tx(&self, entity: EntityId) -> Option<TxId> {
        self.entities.get(&entity).map(|e| e.tx)
    }

    /// The root of a single decomposition: the maximum id.
    pub fn root(&self) -> Result<EntityId, AstError> {
        self.entities.keys().next_back().copied().ok_or(AstError::Empty)
    }

    fn require(&self, entity: EntityId) -> Result<&BTreeMap<String, Atom>, AstError> {
        self.attributes(entity)
            .ok_or(AstError::UnknownEntity { entity })
    }

    pub fn node_type(&self, entity: EntityId) -> Result<NodeType, AstError> {
        let attrs = self.require(entity)?;
        let tag = attrs
            .get(schema::TYPE)
            .ok_or_else(|| AstError::missing("entity", schema::TYPE))?;
        let keyword = tag
            .as_keyword()
            .ok_or_else(|| AstError::invalid(schema::TYPE, format!("expected keyword, found {tag}")))?;
        NodeType::from_keyword(keyword)
    }

    /// Read one node's fields. Children are not checked for existence.
    pub fn view(&self, entity: EntityId) -> Result<NodeView, AstError> {
        let node_type = self.node_type(entity)?;
        let attrs = self.require(entity)?;
        let tag = node_type.keyword();
        let field = |attr: &str| attrs.get(attr).ok_or_else(|| AstError::missing(tag, attr));
        let child = |attr: &str| -> Result<EntityId, AstError> {
            let atom = field(attr)?;
            atom.as_ref_id()
                .ok_or_else(|| AstError::invalid(attr, format!("expected ref, found {atom}")))
        };
        let list = |attr: &str| -> Result<&[Atom], AstError> {
            match field(attr)? {
                Atom::Seq(items) => Ok(items.as_slice()),
                other => Err(AstError::invalid(attr, format!("expected seq, found {other}"))),
            }
        };

        Ok(match node_type {
            NodeType::Literal => NodeView::Literal(Literal::from_atom(field(schema::VALUE)?)?),
            NodeType::Variable => {
                let name = field(schema::NAME)?;
                NodeView::Variable {
                    name: name
                        .as_str()
                        .ok_or_else(|| AstError::invalid(schema::NAME, "expected string"))?
                        .to_string(),
                }
            }
            NodeType::Lambda => NodeView::Lambda {
                params: list(schema::PARAMS)?
                    .iter()
                    .map(|p| {
                        p.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| AstError::invalid(schema::PARAMS, "expected string"))
                    })
                    .collect::<Result<_, _>>()?,
                body: child(schema::BODY)?,
            },
            NodeType::Application => NodeView::Application {
                operator: child(schema::OPERATOR)?,
                operands: list(schema::OPERANDS)?
                    .iter()
                    .map(|o| {
                        o.as_ref_id()
                            .ok_or_else(|| AstError::invalid(schema::OPERANDS, "expected ref"))
                    })
                    .collect::<Result<_, _>>()?,
            },
            NodeType::If => NodeView::If {
                test: child(schema::TEST)?,
                consequent: child(schema::CONSEQUENT)?,
                alternate: child(schema::ALTERNATE)?,
            },
            NodeType::StreamMake => NodeView::StreamMake {
                capacity: attrs
                    .get(schema::CAPACITY)
                    .map(StreamCapacity::from_atom)
                    .transpose()?,
            },
            NodeType::StreamPut => NodeView::StreamPut {
                target: child(schema::TARGET)?,
                value: child(schema::PAYLOAD)?,
            },
            NodeType::StreamCursor => NodeView::StreamCursor {
                source: child(schema::SOURCE)?,
            },
            NodeType::StreamNext => NodeView::StreamNext {
                source: child(schema::SOURCE)?,
            },
            NodeType::Park => NodeView::Park,
            NodeType::Resume => NodeView::Resume {
                parked: child(schema::PARKED)?,
                value: child(schema::PAYLOAD)?,
            },
        })
    }

    /// Entities referenced by `entity`, in canonical attribute order.
    pub fn references(&self, entity: EntityId) -> Result<Vec<EntityId>, AstError> {
        Ok(self
            .require(entity)?
            .values()
            .flat_map(Atom::refs)
            .collect())
    }

    /// `(entity, value)` for every entity carrying `attribute`.
    #[must_use]
    pub fn scan_attr(&self, attribute: &str) -> Vec<(EntityId, &Atom)> {
        self.entities
            .iter()
            .filter_map(|(id, e)| e.attrs.get(attribute).map(|v| (*id, v)))
            .collect()
    }

    #[must_use]
    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<EntityId> {
        let keyword = Atom::Keyword(node_type.keyword().to_string());
        self.scan_attr(schema::TYPE)
            .into_iter()
            .filter(|(_, v)| **v == keyword)
            .map(|(id, _)| id)
            .collect()
    }

    /// Every entity reachable from `roots`, children before parents.
    ///
    /// Fails on dangling references and on cycles. Shared subtrees appear
    /// once.
    pub fn post_order(&self, roots: &[EntityId]) -> Result<Vec<EntityId>, AstError> {
        enum Visit {
            Enter(EntityId, Option<EntityId>),
            Exit(EntityId),
        }
        let mut state: BTreeMap<EntityId, bool> = BTreeMap::new(); // false = on path
        let mut order = Vec::new();
        let mut stack: Vec<Visit> = roots.iter().rev().map(|r| Visit::Enter(*r, None)).collect();

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(id, parent) => {
                    match state.get(&id) {
                        Some(true) => continue,
                        Some(false) => return Err(AstError::CyclicReference { entity: id }),
                        None => {}
                    }
                    let Some(attrs) = self.attributes(id) else {
                        return Err(match parent {
                            Some(entity) => AstError::DanglingReference { entity, target: id },
                            None => AstError::UnknownEntity { entity: id },
                        });
                    };
                    state.insert(id, false);
                    stack.push(Visit::Exit(id));
                    let children: Vec<EntityId> = attrs.values().flat_map(Atom::refs).collect();
                    for child in children.into_iter().rev() {
                        stack.push(Visit::Enter(child, Some(id)));
                    }
                }
                Visit::Exit(id) => {
                    state.insert(id, true);
                    order.push(id);
                }
            }
        }
        Ok(order)
    }

    /// Check that `root` heads a well-formed, acyclic tree.
    pub fn validate(&self, root: EntityId) -> Result<(), AstError> {
        for id in self.post_order(&[root])? {
            self.view(id)?;
        }
        Ok(())
    }

    /// A copy restricted to `ids`.
    #[must_use]
    pub fn subset(&self, ids: impl IntoIterator<Item = EntityId>) -> FactSet {
        FactSet {
            entities: ids
                .into_iter()
                .filter_map(|id| self.entities.get(&id).map(|e| (id, e.clone())))
                .collect(),
        }
    }

    /// All facts in vector form, ascending by entity, derived facts last
    /// within each entity.
    #[must_use]
    pub fn datoms(&self) -> Vec<Datom> {
        let mut out = Vec::new();
        for (id, entity) in &self.entities {
            for (a, v) in &entity.attrs {
                out.push(Datom::new(*id, a.clone(), v.clone(), entity.tx));
            }
            for (a, v) in &entity.derived {
                out.push(Datom::derived(*id, a.clone(), v.clone(), entity.tx));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn kw(k: &str) -> Atom {
        Atom::Keyword(k.to_string())
    }

    fn application_datoms(materialized: bool) -> Vec<Datom> {
        let mut out = vec![
            Datom::new(-4, schema::TYPE, kw("variable"), 1),
            Datom::new(-4, schema::NAME, Atom::Str("+".into()), 1),
            Datom::new(-3, schema::TYPE, kw("literal"), 1),
            Datom::new(-3, schema::VALUE, Atom::Int(1), 1),
            Datom::new(-2, schema::TYPE, kw("literal"), 1),
            Datom::new(-2, schema::VALUE, Atom::Int(2), 1),
            Datom::new(-1, schema::TYPE, kw("application"), 1),
            Datom::new(-1, schema::OPERATOR, Atom::Ref(-4), 1),
        ];
        if materialized {
            out.push(Datom::new(-1, schema::OPERANDS, Atom::Ref(-3), 1));
            out.push(Datom::new(-1, schema::OPERANDS, Atom::Ref(-2), 1));
        } else {
            out.push(Datom::new(
                -1,
                schema::OPERANDS,
                Atom::Seq(vec![Atom::Ref(-3), Atom::Ref(-2)]),
                1,
            ));
        }
        out
    }

    #[test]
    fn test_materialized_and_vector_forms_normalize() {
        let vector = FactSet::from_datoms(&application_datoms(false)).unwrap();
        let materialized = FactSet::from_datoms(&application_datoms(true)).unwrap();
        assert_eq!(vector, materialized);
        assert_eq!(
            vector.view(-1).unwrap(),
            NodeView::Application {
                operator: -4,
                operands: vec![-3, -2]
            }
        );
    }

    #[test]
    fn test_materialized_empty_list() {
        let facts = FactSet::from_datoms(&[
            Datom::new(-2, schema::TYPE, kw("variable"), 1),
            Datom::new(-2, schema::NAME, Atom::Str("f".into()), 1),
            Datom::new(-1, schema::TYPE, kw("application"), 1),
            Datom::new(-1, schema::OPERATOR, Atom::Ref(-2), 1),
        ])
        .unwrap();
        assert_eq!(
            facts.get(-1, schema::OPERANDS),
            Some(&Atom::Seq(Vec::new()))
        );
    }

    #[test]
    fn test_conflicting_scalar() {
        let err = FactSet::from_datoms(&[
            Datom::new(-1, schema::TYPE, kw("literal"), 1),
            Datom::new(-1, schema::VALUE, Atom::Int(1), 1),
            Datom::new(-1, schema::VALUE, Atom::Int(2), 1),
        ])
        .unwrap_err();
        assert_matches!(err, AstError::ConflictingFact { entity: -1, .. });
    }

    #[test]
    fn test_dangling_reference() {
        let facts = FactSet::from_datoms(&[
            Datom::new(-1, schema::TYPE, kw("stream-next"), 1),
            Datom::new(-1, schema::SOURCE, Atom::Ref(-9), 1),
        ])
        .unwrap();
        assert_eq!(
            facts.validate(-1),
            Err(AstError::DanglingReference {
                entity: -1,
                target: -9
            })
        );
    }

    #[test]
    fn test_cycle_detected() {
        let facts = FactSet::from_datoms(&[
            Datom::new(-2, schema::TYPE, kw("stream-cursor"), 1),
            Datom::new(-2, schema::SOURCE, Atom::Ref(-1), 1),
            Datom::new(-1, schema::TYPE, kw("stream-next"), 1),
            Datom::new(-1, schema::SOURCE, Atom::Ref(-2), 1),
        ])
        .unwrap();
        assert_matches!(facts.validate(-1), Err(AstError::CyclicReference { .. }));
    }

    #[test]
    fn test_post_order_children_first() {
        let facts = FactSet::from_datoms(&application_datoms(false)).unwrap();
        let order = facts.post_order(&[-1]).unwrap();
        assert_eq!(order.last(), Some(&-1));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_scan_and_type_queries() {
        let facts = FactSet::from_datoms(&application_datoms(false)).unwrap();
        assert_eq!(facts.nodes_of_type(NodeType::Literal), vec![-3, -2]);
        assert_eq!(facts.scan_attr(schema::NAME).len(), 1);
        assert_eq!(facts.root().unwrap(), -1);
    }

    #[test]
    fn test_merge_conflict_is_atomic() {
        let mut facts = FactSet::from_datoms(&application_datoms(false)).unwrap();
        let clash = FactSet::from_datoms(&[
            Datom::new(-10, schema::TYPE, kw("park"), 2),
            Datom::new(-3, schema::TYPE, kw("literal"), 2),
            Datom::new(-3, schema::VALUE, Atom::Int(99), 2),
        ])
        .unwrap();
        assert_eq!(
            facts.merge(clash),
            Err(AstError::EntityConflict { entity: -3 })
        );
        assert!(!facts.contains(-10));
    }

    #[test]
    fn test_derived_facts_kept_apart() {
        let mut facts = FactSet::from_datoms(&application_datoms(false)).unwrap();
        let before = facts.attributes(-1).cloned();
        facts
            .set_derived(-1, schema::HASH, Atom::Str("cafe".into()))
            .unwrap();
        assert_eq!(facts.attributes(-1).cloned(), before);
        assert!(facts.datoms().iter().any(Datom::is_derived));
    }
}
