//! Hash-addressed wire form of AST facts, with deduplicating import.
//!
//! A bundle files each entity under its content hash. Ground attributes
//! travel as-is; references travel as child hashes. Importing a bundle
//! recreates only the entities whose hash the receiver does not already
//! know.

use crate::datom::{Atom, Datom, EntityId};
use crate::decompose::Decomposer;
use crate::error::{AstError, BundleError};
use crate::facts::FactSet;
use crate::hash::{self, CanonicalEntity, CanonicalValue, NodeHash};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Receiver's index from content hash to an existing entity.
pub type HashIdMap = HashMap<NodeHash, EntityId>;

/// A child reference on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BundleRef {
    One(NodeHash),
    Many(Vec<NodeHash>),
}

/// One entity on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntity {
    #[serde(default)]
    pub attributes: BTreeMap<String, Atom>,
    #[serde(default)]
    pub references: BTreeMap<String, BundleRef>,
}

impl BundleEntity {
    fn from_canonical(canonical: CanonicalEntity) -> Self {
        let mut entity = BundleEntity::default();
        for (attribute, value) in canonical {
            match value {
                CanonicalValue::Ground(atom) => {
                    entity.attributes.insert(attribute, atom);
                }
                CanonicalValue::Child(hash) => {
                    entity.references.insert(attribute, BundleRef::One(hash));
                }
                CanonicalValue::Children(hashes) => {
                    entity.references.insert(attribute, BundleRef::Many(hashes));
                }
            }
        }
        entity
    }

    fn to_canonical(&self) -> CanonicalEntity {
        let mut canonical: CanonicalEntity = self
            .attributes
            .iter()
            .map(|(a, v)| (a.clone(), CanonicalValue::Ground(v.clone())))
            .collect();
        for (attribute, reference) in &self.references {
            let value = match reference {
                BundleRef::One(hash) => CanonicalValue::Child(hash.clone()),
                BundleRef::Many(hashes) => CanonicalValue::Children(hashes.clone()),
            };
            canonical.insert(attribute.clone(), value);
        }
        canonical
    }

    /// Child hashes in canonical attribute order.
    pub fn child_hashes(&self) -> impl Iterator<Item = &NodeHash> {
        self.references.values().flat_map(|r| match r {
            BundleRef::One(hash) => std::slice::from_ref(hash).iter(),
            BundleRef::Many(hashes) => hashes.iter(),
        })
    }
}

/// The entity table shared by AST and continuation bundles.
pub type EntityTable = BTreeMap<NodeHash, BundleEntity>;

/// Wire form of one AST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstBundle {
    pub root_hash: NodeHash,
    pub entities: EntityTable,
}

impl AstBundle {
    pub fn to_json_string(&self) -> Result<String, BundleError> {
        serde_json::to_string(self).map_err(|e| BundleError::Encoding(e.to_string()))
    }

    pub fn from_json_str(text: &str) -> Result<Self, BundleError> {
        serde_json::from_str(text).map_err(|e| BundleError::Encoding(e.to_string()))
    }
}

/// Hash-address every entity reachable from `roots`.
///
/// Returns the entity table and the hash of each exported entity.
pub fn export_entities(
    facts: &FactSet,
    roots: &[EntityId],
) -> Result<(EntityTable, BTreeMap<EntityId, NodeHash>), BundleError> {
    let hashes = hash::hashes_from(facts, roots)?;
    let mut table = EntityTable::new();
    for (id, node_hash) in &hashes {
        if table.contains_key(node_hash) {
            continue;
        }
        let attrs = facts
            .attributes(*id)
            .ok_or(AstError::UnknownEntity { entity: *id })?;
        let canonical = hash::canonicalize(*id, attrs, &hashes)?;
        table.insert(node_hash.clone(), BundleEntity::from_canonical(canonical));
    }
    Ok((table, hashes))
}

/// Export the AST rooted at `root`.
pub fn export_ast(facts: &FactSet, root: EntityId) -> Result<AstBundle, BundleError> {
    let (entities, hashes) = export_entities(facts, &[root])?;
    let root_hash = hashes
        .get(&root)
        .cloned()
        .ok_or(AstError::UnknownEntity { entity: root })?;
    Ok(AstBundle {
        root_hash,
        entities,
    })
}

/// Planned import: facts to add and the entity every requested hash
/// resolves to. Nothing is visible to the receiver until committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportPlan {
    pub datoms: Vec<Datom>,
    pub resolved: HashMap<NodeHash, EntityId>,
    pub created: usize,
    pub reused: usize,
}

impl ImportPlan {
    /// Record newly created entities in the receiver's hash map.
    pub fn commit(self, known: &mut HashIdMap) -> ImportOutcome {
        for (hash, id) in &self.resolved {
            known.entry(hash.clone()).or_insert(*id);
        }
        ImportOutcome {
            datoms: self.datoms,
            resolved: self.resolved,
            created: self.created,
            reused: self.reused,
        }
    }
}

/// Result of a committed import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub datoms: Vec<Datom>,
    pub resolved: HashMap<NodeHash, EntityId>,
    pub created: usize,
    pub reused: usize,
}

fn validate(table: &EntityTable, roots: &[NodeHash], known: &HashIdMap) -> Result<(), BundleError> {
    for (expected, entity) in table {
        let actual = hash::digest_canonical(&entity.to_canonical())?;
        if &actual != expected {
            return Err(BundleError::HashMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        for child in entity.child_hashes() {
            if !table.contains_key(child) && !known.contains_key(child) {
                return Err(BundleError::UnresolvedHash {
                    hash: child.clone(),
                });
            }
        }
    }
    for root in roots {
        if !table.contains_key(root) && !known.contains_key(root) {
            return Err(BundleError::UnresolvedHash { hash: root.clone() });
        }
    }
    Ok(())
}

/// Plan the import of the entities reachable from `roots`.
///
/// The whole table is validated first: every entry must digest to its key
/// and every referenced hash must be resolvable. Hashes present in `known`
/// are reused rather than recreated. New ids come from `alloc`, one
/// transaction for the batch.
pub fn plan_import(
    table: &EntityTable,
    roots: &[NodeHash],
    alloc: &mut Decomposer,
    known: &HashIdMap,
) -> Result<ImportPlan, BundleError> {
    validate(table, roots, known)?;

    enum Visit<'a> {
        Enter(&'a NodeHash),
        Exit(&'a NodeHash),
    }
    let mut resolved: HashMap<NodeHash, EntityId> = HashMap::new();
    let mut datoms = Vec::new();
    let mut created = 0;
    let mut reused = 0;
    let mut tx = None;
    let mut stack: Vec<Visit<'_>> = roots.iter().rev().map(Visit::Enter).collect();

    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(node_hash) => {
                if resolved.contains_key(node_hash) {
                    continue;
                }
                if let Some(id) = known.get(node_hash) {
                    resolved.insert(node_hash.clone(), *id);
                    reused += 1;
                    continue;
                }
                let entity = table.get(node_hash).ok_or_else(|| BundleError::UnresolvedHash {
                    hash: node_hash.clone(),
                })?;
                stack.push(Visit::Exit(node_hash));
                let children: Vec<&NodeHash> = entity.child_hashes().collect();
                for child in children.into_iter().rev() {
                    stack.push(Visit::Enter(child));
                }
            }
            Visit::Exit(node_hash) => {
                if resolved.contains_key(node_hash) {
                    continue;
                }
                let entity = table.get(node_hash).ok_or_else(|| BundleError::UnresolvedHash {
                    hash: node_hash.clone(),
                })?;
                let lookup = |h: &NodeHash| {
                    resolved
                        .get(h)
                        .copied()
                        .ok_or_else(|| BundleError::UnresolvedHash { hash: h.clone() })
                };
                let mut facts: Vec<(String, Atom)> = Vec::new();
                for (attribute, atom) in &entity.attributes {
                    facts.push((attribute.clone(), atom.clone()));
                }
                for (attribute, reference) in &entity.references {
                    let atom = match reference {
                        BundleRef::One(h) => Atom::Ref(lookup(h)?),
                        BundleRef::Many(hs) => Atom::Seq(
                            hs.iter()
                                .map(|h| lookup(h).map(Atom::Ref))
                                .collect::<Result<_, _>>()?,
                        ),
                    };
                    facts.push((attribute.clone(), atom));
                }
                let id = alloc.allocate().map_err(BundleError::Ast)?;
                let tx = *tx.get_or_insert_with(|| alloc.begin());
                datoms.extend(facts.into_iter().map(|(a, v)| Datom::new(id, a, v, tx)));
                resolved.insert(node_hash.clone(), id);
                created += 1;
            }
        }
    }

    Ok(ImportPlan {
        datoms,
        resolved,
        created,
        reused,
    })
}

/// Import an AST bundle, skipping every entity whose hash is in `known`.
///
/// Returns the new facts and the entity the root resolves to. `known` is
/// extended with the created entities; on failure nothing changes.
pub fn import_ast(
    bundle: &AstBundle,
    alloc: &mut Decomposer,
    known: &mut HashIdMap,
) -> Result<(EntityId, ImportOutcome), BundleError> {
    let plan = plan_import(
        &bundle.entities,
        std::slice::from_ref(&bundle.root_hash),
        alloc,
        known,
    )?;
    let root = plan
        .resolved
        .get(&bundle.root_hash)
        .copied()
        .ok_or_else(|| BundleError::UnresolvedHash {
            hash: bundle.root_hash.clone(),
        })?;
    Ok((root, plan.commit(known)))
}
