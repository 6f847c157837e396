//! Attribute vocabulary and node types of the canonical AST.

use crate::error::AstError;
use std::fmt;

pub const TYPE: &str = ":ast/type";
pub const VALUE: &str = ":ast/value";
pub const NAME: &str = ":ast/name";
pub const PARAMS: &str = ":ast/params";
pub const BODY: &str = ":ast/body";
pub const OPERATOR: &str = ":ast/operator";
pub const OPERANDS: &str = ":ast/operands";
pub const TEST: &str = ":ast/test";
pub const CONSEQUENT: &str = ":ast/consequent";
pub const ALTERNATE: &str = ":ast/alternate";
pub const CAPACITY: &str = ":ast/capacity";
pub const TARGET: &str = ":ast/target";
pub const PAYLOAD: &str = ":ast/payload";
pub const SOURCE: &str = ":ast/source";
pub const PARKED: &str = ":ast/parked";

/// Derived: hex content hash cached on an entity.
pub const HASH: &str = ":ast/hash";

/// Keyword value of `:ast/capacity` for an unbounded stream.
pub const UNBOUNDED: &str = "unbounded";

/// Attributes that hold an ordered list. They arrive either as one `Seq`
/// fact or as repeated scalar facts and are stored as a `Seq`.
pub const MANY: [&str; 2] = [PARAMS, OPERANDS];

#[must_use]
pub fn is_many(attribute: &str) -> bool {
    MANY.contains(&attribute)
}

/// Tag of an AST node, stored as a keyword under [`TYPE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeType {
    Literal,
    Variable,
    Lambda,
    Application,
    If,
    StreamMake,
    StreamPut,
    StreamCursor,
    StreamNext,
    Park,
    Resume,
}

impl NodeType {
    pub const ALL: [NodeType; 11] = [
        NodeType::Literal,
        NodeType::Variable,
        NodeType::Lambda,
        NodeType::Application,
        NodeType::If,
        NodeType::StreamMake,
        NodeType::StreamPut,
        NodeType::StreamCursor,
        NodeType::StreamNext,
        NodeType::Park,
        NodeType::Resume,
    ];

    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            NodeType::Literal => "literal",
            NodeType::Variable => "variable",
            NodeType::Lambda => "lambda",
            NodeType::Application => "application",
            NodeType::If => "if",
            NodeType::StreamMake => "stream-make",
            NodeType::StreamPut => "stream-put",
            NodeType::StreamCursor => "stream-cursor",
            NodeType::StreamNext => "stream-next",
            NodeType::Park => "park",
            NodeType::Resume => "resume",
        }
    }

    pub fn from_keyword(tag: &str) -> Result<Self, AstError> {
        Self::ALL
            .into_iter()
            .find(|t| t.keyword() == tag)
            .ok_or_else(|| AstError::UnknownTag {
                tag: tag.to_string(),
            })
    }

    /// Multi-valued attributes this node type always carries, even when empty.
    #[must_use]
    pub fn list_attributes(self) -> &'static [&'static str] {
        match self {
            NodeType::Lambda => &[PARAMS],
            NodeType::Application => &[OPERANDS],
            _ => &[],
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_round_trip() {
        for t in NodeType::ALL {
            assert_eq!(NodeType::from_keyword(t.keyword()).unwrap(), t);
        }
    }

    #[test]
    fn test_unknown_keyword() {
        assert_eq!(
            NodeType::from_keyword("letrec"),
            Err(AstError::UnknownTag {
                tag: "letrec".into()
            })
        );
    }
}
