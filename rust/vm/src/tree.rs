//! Tree backend: walks linked syntax terms.
//!
//! On load every reachable entity is materialized once as a [`Term`] whose
//! children are shared pointers, so a step never consults the fact arena.

use std::collections::HashMap;
use std::convert::Infallible;
use std::rc::Rc;

use cesk_types::{AstError, EntityId, FactSet, NodeView};

use crate::config::VMConfig;
use crate::env::Env;
use crate::error::VmError;
use crate::machine::BackendKind;
use crate::walk::{Syntax, WalkMachine};

#[derive(Debug, PartialEq)]
pub struct Term {
    pub id: EntityId,
    pub view: NodeView<Rc<Term>>,
}

/// Entity to term index.
#[derive(Debug, Default)]
pub struct TermIndex {
    terms: HashMap<EntityId, Rc<Term>>,
}

impl TermIndex {
    #[must_use]
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    #[must_use]
    pub fn get(&self, entity: EntityId) -> Option<&Rc<Term>> {
        self.terms.get(&entity)
    }
}

impl Syntax for TermIndex {
    type Ref = Rc<Term>;

    fn entity(node: &Rc<Term>) -> EntityId {
        node.id
    }

    fn view(&self, _facts: &FactSet, node: &Rc<Term>) -> Result<NodeView<Rc<Term>>, VmError> {
        Ok(node.view.clone())
    }

    fn resolve(&self, _facts: &FactSet, entity: EntityId) -> Result<Rc<Term>, VmError> {
        self.terms
            .get(&entity)
            .cloned()
            .ok_or(VmError::Malformed(AstError::UnknownEntity { entity }))
    }

    // Children before parents, so each link target already exists.
    fn refresh(&mut self, facts: &FactSet, roots: &[EntityId]) -> Result<(), VmError> {
        let fresh: Vec<EntityId> = roots.iter().copied().filter(|id| !self.terms.contains_key(id)).collect();
        if fresh.is_empty() {
            return Ok(());
        }
        for id in facts.post_order(&fresh)? {
            if self.terms.contains_key(&id) {
                continue;
            }
            let view = facts.view(id)?.try_map(|child| {
                self.terms
                    .get(&child)
                    .cloned()
                    .ok_or(AstError::UnknownEntity { entity: child })
            })?;
            self.terms.insert(id, Rc::new(Term { id, view }));
        }
        Ok(())
    }
}

// Linked terms are released iteratively; a deep chain would otherwise
// unwind one stack frame per level.
impl Drop for Term {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        detach(&mut self.view, &mut pending);
        while let Some(term) = pending.pop() {
            if let Ok(mut term) = Rc::try_unwrap(term) {
                detach(&mut term.view, &mut pending);
            }
        }
    }
}

fn detach(view: &mut NodeView<Rc<Term>>, out: &mut Vec<Rc<Term>>) {
    let children = std::mem::replace(view, NodeView::Park);
    let _ = children.try_map(|child| {
        out.push(child);
        Ok::<(), Infallible>(())
    });
}

pub type TreeMachine = WalkMachine<TermIndex>;

impl WalkMachine<TermIndex> {
    #[must_use]
    pub fn new(config: VMConfig, env: Env) -> Self {
        Self::with_syntax(BackendKind::Tree, config, env, TermIndex::default())
    }

    #[must_use]
    pub fn terms(&self) -> &TermIndex {
        &self.syntax
    }
}
