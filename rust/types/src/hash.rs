//! Gauge-invariant content hashing over decomposed facts.
//!
//! An entity's hash digests its non-derived attributes in canonical order,
//! with every reference replaced by the referent's hash. Entity ids and
//! transaction numbers never reach the digest, so shifting the id range
//! leaves every hash unchanged. Operand order and variable names do reach
//! it.
//!
//! Encoding per attribute: name, then value, both tagged and length
//! prefixed so that no two distinct canonical forms share bytes.

use crate::content_id::{ContentId, Sha256Hasher};
use crate::datom::{Atom, EntityId};
use crate::error::AstError;
use crate::facts::FactSet;
use crate::schema;
use std::collections::{BTreeMap, HashMap};

/// Hash of one AST subtree.
pub type NodeHash = ContentId<Sha256Hasher>;

const DOMAIN: &[u8] = b"cesk.ast.v1";

const TAG_ATTR: u8 = 0xA0;
const TAG_NIL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_STR: u8 = 0x03;
const TAG_KEYWORD: u8 = 0x04;
const TAG_CHILD: u8 = 0x05;
const TAG_SEQ: u8 = 0x06;

/// An attribute value with references replaced by child hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalValue {
    Ground(Atom),
    Child(NodeHash),
    Children(Vec<NodeHash>),
}

/// The hash-addressed form of one entity.
pub type CanonicalEntity = BTreeMap<String, CanonicalValue>;

fn put_len(out: &mut Vec<u8>, len: usize) {
    let len = u64::try_from(len).unwrap_or(u64::MAX);
    out.extend_from_slice(&len.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    out.push(tag);
    put_len(out, bytes.len());
    out.extend_from_slice(bytes);
}

fn encode_atom(out: &mut Vec<u8>, atom: &Atom) -> Result<(), AstError> {
    match atom {
        Atom::Nil => out.push(TAG_NIL),
        Atom::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Atom::Int(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Atom::Str(s) => put_bytes(out, TAG_STR, s.as_bytes()),
        Atom::Keyword(k) => put_bytes(out, TAG_KEYWORD, k.as_bytes()),
        Atom::Seq(items) => {
            out.push(TAG_SEQ);
            put_len(out, items.len());
            for item in items {
                encode_atom(out, item)?;
            }
        }
        Atom::Ref(target) => {
            return Err(AstError::invalid(
                "ref",
                format!("reference to {target} left in canonical form"),
            ))
        }
    }
    Ok(())
}

fn encode_child(out: &mut Vec<u8>, hash: &NodeHash) {
    out.push(TAG_CHILD);
    out.extend_from_slice(hash.as_bytes());
}

/// Digest a canonical entity.
///
/// A list of children encodes exactly like a sequence of single children,
/// so an empty operand list hashes the same in either representation.
pub fn digest_canonical(entity: &CanonicalEntity) -> Result<NodeHash, AstError> {
    let mut out = DOMAIN.to_vec();
    for (attribute, value) in entity {
        put_bytes(&mut out, TAG_ATTR, attribute.as_bytes());
        match value {
            CanonicalValue::Ground(atom) => encode_atom(&mut out, atom)?,
            CanonicalValue::Child(hash) => encode_child(&mut out, hash),
            CanonicalValue::Children(hashes) => {
                out.push(TAG_SEQ);
                put_len(&mut out, hashes.len());
                for hash in hashes {
                    encode_child(&mut out, hash);
                }
            }
        }
    }
    Ok(NodeHash::from_bytes(&out))
}

/// Canonicalize an entity's attributes given already computed child hashes.
pub fn canonicalize(
    entity: EntityId,
    attrs: &BTreeMap<String, Atom>,
    hashes: &BTreeMap<EntityId, NodeHash>,
) -> Result<CanonicalEntity, AstError> {
    let lookup = |target: EntityId| {
        hashes
            .get(&target)
            .cloned()
            .ok_or(AstError::DanglingReference { entity, target })
    };
    attrs
        .iter()
        .map(|(attribute, atom)| {
            let value = match atom {
                Atom::Ref(target) => CanonicalValue::Child(lookup(*target)?),
                Atom::Seq(items) if items.iter().any(|i| matches!(i, Atom::Ref(_))) => {
                    CanonicalValue::Children(
                        items
                            .iter()
                            .map(|item| match item {
                                Atom::Ref(target) => lookup(*target),
                                other => Err(AstError::invalid(
                                    attribute,
                                    format!("mixed reference list holds {other}"),
                                )),
                            })
                            .collect::<Result<_, _>>()?,
                    )
                }
                ground => CanonicalValue::Ground(ground.clone()),
            };
            Ok((attribute.clone(), value))
        })
        .collect()
}

/// Hash every entity reachable from `roots`.
pub fn hashes_from(
    facts: &FactSet,
    roots: &[EntityId],
) -> Result<BTreeMap<EntityId, NodeHash>, AstError> {
    let mut hashes = BTreeMap::new();
    for id in facts.post_order(roots)? {
        let attrs = facts
            .attributes(id)
            .ok_or(AstError::UnknownEntity { entity: id })?;
        let hash = digest_canonical(&canonicalize(id, attrs, &hashes)?)?;
        hashes.insert(id, hash);
    }
    Ok(hashes)
}

/// Hash every entity in the fact set.
pub fn content_hashes(facts: &FactSet) -> Result<BTreeMap<EntityId, NodeHash>, AstError> {
    let all: Vec<EntityId> = facts.entity_ids().collect();
    hashes_from(facts, &all)
}

/// Hash of the subtree rooted at `entity`.
pub fn subtree_hash(facts: &FactSet, entity: EntityId) -> Result<NodeHash, AstError> {
    hashes_from(facts, &[entity])?
        .remove(&entity)
        .ok_or(AstError::UnknownEntity { entity })
}

/// Hash of the maximum-id entity.
pub fn root_hash(facts: &FactSet) -> Result<NodeHash, AstError> {
    subtree_hash(facts, facts.root()?)
}

/// Cache each entity's hash as a derived `:ast/hash` fact.
pub fn annotate_hashes(facts: &mut FactSet) -> Result<usize, AstError> {
    let hashes = content_hashes(facts)?;
    for (id, hash) in &hashes {
        facts.set_derived(*id, schema::HASH, Atom::Str(hash.to_hex()))?;
    }
    Ok(hashes.len())
}

/// Hash to entity index. Structurally identical subtrees share a hash; the
/// lowest id wins.
#[must_use]
pub fn hash_index(hashes: &BTreeMap<EntityId, NodeHash>) -> HashMap<NodeHash, EntityId> {
    let mut index = HashMap::with_capacity(hashes.len());
    for (id, hash) in hashes {
        index.entry(hash.clone()).or_insert(*id);
    }
    index
}
