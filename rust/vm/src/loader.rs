//! Program images.
//!
//! Every backend loads the same thing: a root entity and the facts that
//! describe it. Images come from an AST, from raw datoms, or from an AST
//! bundle imported against the receiver's hash map.

use cesk_types::{
    bundle, decompose, AstBundle, Datom, Decomposer, Decomposition, EntityId, FactSet, HashIdMap,
    Node,
};
use tracing::debug;

use crate::error::VmError;

/// A validated program: root entity plus its facts.
///
/// Validation has already checked that every node reachable from the
/// root exists, is well formed and is acyclic.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramImage {
    pub root: EntityId,
    pub facts: FactSet,
}

impl ProgramImage {
    pub fn new(root: EntityId, facts: FactSet) -> Result<Self, VmError> {
        facts.validate(root)?;
        Ok(Self { root, facts })
    }

    /// Decompose `node` with ids starting at `id_start`.
    pub fn from_ast(node: &Node, id_start: Option<EntityId>) -> Result<Self, VmError> {
        Self::from_decomposition(&decompose(node, id_start)?)
    }

    pub fn from_decomposition(decomposition: &Decomposition) -> Result<Self, VmError> {
        Self::new(decomposition.root, decomposition.facts()?)
    }

    /// Image over raw datoms; the root is the greatest entity id.
    pub fn from_datoms(datoms: &[Datom]) -> Result<Self, VmError> {
        let facts = FactSet::from_datoms(datoms)?;
        let root = facts.root()?;
        Self::new(root, facts)
    }

    /// Import a bundle with no prior knowledge: every entity is created.
    pub fn from_bundle(bundle: &AstBundle, alloc: &mut Decomposer) -> Result<Self, VmError> {
        let mut known = HashIdMap::new();
        let (root, outcome) = bundle::import_ast(bundle, alloc, &mut known)?;
        debug!(root, created = outcome.created, "bundle imported");
        Self::new(root, FactSet::from_datoms(&outcome.datoms)?)
    }

    /// Parse an AST in its JSON form.
    pub fn from_json_str(text: &str, id_start: Option<EntityId>) -> Result<Self, VmError> {
        Self::from_ast(&Node::from_json_str(text)?, id_start)
    }

    /// Rebuild the AST this image describes.
    pub fn to_ast(&self) -> Result<Node, VmError> {
        Ok(cesk_types::recompose(&self.facts, self.root)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cesk_types::{schema, AstError, Atom};

    #[test]
    fn test_from_ast_roots_at_max_id() {
        let image = ProgramImage::from_ast(&Node::call("+", [Node::int(10), Node::int(20)]), Some(-100)).unwrap();
        assert_eq!(image.root, image.facts.root().unwrap());
        assert_eq!(image.to_ast().unwrap(), Node::call("+", [Node::int(10), Node::int(20)]));
    }

    #[test]
    fn test_from_datoms_rejects_dangling_reference() {
        let datoms = vec![
            Datom::new(-5, schema::TYPE, Atom::Keyword("lambda".into()), 1),
            Datom::new(-5, schema::PARAMS, Atom::Seq(Vec::new()), 1),
            Datom::new(-5, schema::BODY, Atom::Ref(-9), 1),
        ];
        assert_matches!(
            ProgramImage::from_datoms(&datoms),
            Err(VmError::Malformed(AstError::DanglingReference { .. }))
        );
    }

    #[test]
    fn test_from_bundle_matches_source() {
        let node = Node::if_(Node::bool(true), Node::keyword("yes"), Node::keyword("no"));
        let source = ProgramImage::from_ast(&node, None).unwrap();
        let exported = bundle::export_ast(&source.facts, source.root).unwrap();
        let mut alloc = Decomposer::new(-50);
        let image = ProgramImage::from_bundle(&exported, &mut alloc).unwrap();
        assert_eq!(image.to_ast().unwrap(), node);
    }
}
