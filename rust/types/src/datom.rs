//! The datom: the immutable five-tuple every program is decomposed into.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity identifier. Negative while provisional.
pub type EntityId = i64;

/// Transaction sequence number, monotonic per allocator.
pub type TxId = u64;

/// Metadata value meaning "no provenance".
pub const NO_META: EntityId = 0;

/// Metadata sentinel marking a derived fact (for example a cached hash).
/// Derived facts never contribute to content hashes.
pub const DERIVED: EntityId = EntityId::MIN;

/// A fact value: a ground scalar, a reference, or an ordered sequence.
///
/// There are no floats, so `Eq` and `Hash` hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atom {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Keyword(String),
    Ref(EntityId),
    Seq(Vec<Atom>),
}

impl Atom {
    #[must_use]
    pub fn as_ref_id(&self) -> Option<EntityId> {
        match self {
            Atom::Ref(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_keyword(&self) -> Option<&str> {
        match self {
            Atom::Keyword(k) => Some(k),
            _ => None,
        }
    }

    /// Every entity this atom references, in order.
    pub fn refs(&self) -> Vec<EntityId> {
        match self {
            Atom::Ref(id) => vec![*id],
            Atom::Seq(items) => items.iter().flat_map(Atom::refs).collect(),
            _ => Vec::new(),
        }
    }

    /// Short class name for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Atom::Nil => "nil",
            Atom::Bool(_) => "bool",
            Atom::Int(_) => "int",
            Atom::Str(_) => "string",
            Atom::Keyword(_) => "keyword",
            Atom::Ref(_) => "ref",
            Atom::Seq(_) => "seq",
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Nil => write!(f, "nil"),
            Atom::Bool(b) => write!(f, "{b}"),
            Atom::Int(n) => write!(f, "{n}"),
            Atom::Str(s) => write!(f, "{s:?}"),
            Atom::Keyword(k) => write!(f, ":{k}"),
            Atom::Ref(e) => write!(f, "#{e}"),
            Atom::Seq(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// One fact: `(entity, attribute, value, transaction, metadata)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Datom {
    pub e: EntityId,
    pub a: String,
    pub v: Atom,
    pub tx: TxId,
    #[serde(default)]
    pub meta: EntityId,
}

impl Datom {
    #[must_use]
    pub fn new(e: EntityId, a: impl Into<String>, v: Atom, tx: TxId) -> Self {
        Self {
            e,
            a: a.into(),
            v,
            tx,
            meta: NO_META,
        }
    }

    /// A fact flagged as derived.
    #[must_use]
    pub fn derived(e: EntityId, a: impl Into<String>, v: Atom, tx: TxId) -> Self {
        Self {
            meta: DERIVED,
            ..Self::new(e, a, v, tx)
        }
    }

    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.meta == DERIVED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_flag() {
        let plain = Datom::new(-3, ":ast/type", Atom::Keyword("park".into()), 1);
        let cached = Datom::derived(-3, ":ast/hash", Atom::Str("00".into()), 1);
        assert!(!plain.is_derived());
        assert!(cached.is_derived());
        assert_eq!(plain.meta, NO_META);
    }

    #[test]
    fn test_refs_through_sequences() {
        let atom = Atom::Seq(vec![Atom::Ref(-4), Atom::Int(1), Atom::Ref(-2)]);
        assert_eq!(atom.refs(), vec![-4, -2]);
        assert!(Atom::Str("x".into()).refs().is_empty());
    }

    #[test]
    fn test_datom_json_shape() {
        let d = Datom::new(-7, ":ast/operands", Atom::Seq(vec![Atom::Ref(-6)]), 2);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["e"], -7);
        assert_eq!(json["v"]["seq"][0]["ref"], -6);
        let back: Datom = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }
}
