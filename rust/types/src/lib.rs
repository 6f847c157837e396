//! Canonical AST and fact model for the CESK runtime.
//!
//! Programs arrive as tagged [`Node`] trees and are decomposed into
//! [`Datom`]s: immutable `(entity, attribute, value, tx, meta)` facts held in
//! a [`FactSet`] arena. Every entity has a gauge-invariant content hash
//! ([`hash`]), which addresses it on the wire ([`bundle`]).
//!
//! | Module | Role |
//! |--------|------|
//! | [`ast`] | tagged AST and its JSON shape |
//! | [`datom`] | the five-tuple fact and its value atoms |
//! | [`schema`] | attribute names and node types |
//! | [`decompose`] | AST to facts, facts to AST |
//! | [`facts`] | fact arena, normalization, structural queries |
//! | [`hash`] | content hashing |
//! | [`bundle`] | hash-addressed export and deduplicating import |

pub mod ast;
pub mod bundle;
pub mod content_id;
pub mod datom;
pub mod decompose;
mod error;
pub mod facts;
pub mod hash;
pub mod schema;

pub use ast::{Literal, Node, StreamCapacity};
pub use bundle::{AstBundle, BundleEntity, BundleRef, EntityTable, HashIdMap};
pub use content_id::{ContentId, Sha256Hasher};
pub use datom::{Atom, Datom, EntityId, TxId, DERIVED, NO_META};
pub use decompose::{decompose, recompose, Decomposer, Decomposition, DEFAULT_ID_START};
pub use error::{AstError, BundleError};
pub use facts::{FactSet, NodeView};
pub use hash::NodeHash;
pub use schema::NodeType;
