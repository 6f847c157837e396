//! The canonical tagged AST accepted from front-ends.
//!
//! Front-ends hand over either a [`Node`] value or its JSON shape:
//!
//! ```json
//! {"type": "application",
//!  "operator": {"type": "variable", "name": "+"},
//!  "operands": [{"type": "literal", "value": 10},
//!               {"type": "literal", "value": 20}]}
//! ```
//!
//! Keyword literals are written `{"keyword": "first"}`; stream capacity is an
//! integer or the string `"unbounded"`.

use crate::datom::Atom;
use crate::error::AstError;
use crate::schema::{NodeType, UNBOUNDED};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use std::fmt;

/// A ground literal value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Literal {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Keyword(String),
}

impl Literal {
    #[must_use]
    pub fn to_atom(&self) -> Atom {
        match self {
            Literal::Nil => Atom::Nil,
            Literal::Bool(b) => Atom::Bool(*b),
            Literal::Int(n) => Atom::Int(*n),
            Literal::Str(s) => Atom::Str(s.clone()),
            Literal::Keyword(k) => Atom::Keyword(k.clone()),
        }
    }

    /// Rejects references and sequences.
    pub fn from_atom(atom: &Atom) -> Result<Self, AstError> {
        Ok(match atom {
            Atom::Nil => Literal::Nil,
            Atom::Bool(b) => Literal::Bool(*b),
            Atom::Int(n) => Literal::Int(*n),
            Atom::Str(s) => Literal::Str(s.clone()),
            Atom::Keyword(k) => Literal::Keyword(k.clone()),
            other => {
                return Err(AstError::invalid(
                    "value",
                    format!("{} is not a literal", other.kind()),
                ))
            }
        })
    }
}

/// Stream capacity as written in a `stream-make` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamCapacity {
    Bounded(usize),
    Unbounded,
}

impl StreamCapacity {
    #[must_use]
    pub fn to_atom(self) -> Atom {
        match self {
            // usize always fits after the range check in from_atom.
            StreamCapacity::Bounded(n) => Atom::Int(i64::try_from(n).unwrap_or(i64::MAX)),
            StreamCapacity::Unbounded => Atom::Keyword(UNBOUNDED.to_string()),
        }
    }

    pub fn from_atom(atom: &Atom) -> Result<Self, AstError> {
        match atom {
            Atom::Int(n) => usize::try_from(*n)
                .map(StreamCapacity::Bounded)
                .map_err(|_| AstError::invalid("capacity", format!("{n} is negative"))),
            Atom::Keyword(k) if k == UNBOUNDED => Ok(StreamCapacity::Unbounded),
            other => Err(AstError::invalid(
                "capacity",
                format!("expected integer or :{UNBOUNDED}, found {other}"),
            )),
        }
    }
}

/// One AST node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    Literal(Literal),
    Variable {
        name: String,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Node>,
    },
    Application {
        operator: Box<Node>,
        operands: Vec<Node>,
    },
    If {
        test: Box<Node>,
        consequent: Box<Node>,
        alternate: Box<Node>,
    },
    StreamMake {
        capacity: Option<StreamCapacity>,
    },
    StreamPut {
        target: Box<Node>,
        value: Box<Node>,
    },
    StreamCursor {
        source: Box<Node>,
    },
    StreamNext {
        source: Box<Node>,
    },
    Park,
    Resume {
        parked: Box<Node>,
        value: Box<Node>,
    },
}

impl Node {
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Literal(_) => NodeType::Literal,
            Node::Variable { .. } => NodeType::Variable,
            Node::Lambda { .. } => NodeType::Lambda,
            Node::Application { .. } => NodeType::Application,
            Node::If { .. } => NodeType::If,
            Node::StreamMake { .. } => NodeType::StreamMake,
            Node::StreamPut { .. } => NodeType::StreamPut,
            Node::StreamCursor { .. } => NodeType::StreamCursor,
            Node::StreamNext { .. } => NodeType::StreamNext,
            Node::Park => NodeType::Park,
            Node::Resume { .. } => NodeType::Resume,
        }
    }

    #[must_use]
    pub fn nil() -> Self {
        Node::Literal(Literal::Nil)
    }

    #[must_use]
    pub fn bool(b: bool) -> Self {
        Node::Literal(Literal::Bool(b))
    }

    #[must_use]
    pub fn int(n: i64) -> Self {
        Node::Literal(Literal::Int(n))
    }

    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Node::Literal(Literal::Str(s.into()))
    }

    #[must_use]
    pub fn keyword(k: impl Into<String>) -> Self {
        Node::Literal(Literal::Keyword(k.into()))
    }

    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        Node::Variable { name: name.into() }
    }

    #[must_use]
    pub fn lambda<S: Into<String>>(params: impl IntoIterator<Item = S>, body: Node) -> Self {
        Node::Lambda {
            params: params.into_iter().map(Into::into).collect(),
            body: Box::new(body),
        }
    }

    #[must_use]
    pub fn apply(operator: Node, operands: impl IntoIterator<Item = Node>) -> Self {
        Node::Application {
            operator: Box::new(operator),
            operands: operands.into_iter().collect(),
        }
    }

    /// `(op a b ...)` where `op` is a variable, usually a primitive.
    #[must_use]
    pub fn call(op: &str, operands: impl IntoIterator<Item = Node>) -> Self {
        Self::apply(Self::var(op), operands)
    }

    #[must_use]
    pub fn if_(test: Node, consequent: Node, alternate: Node) -> Self {
        Node::If {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        }
    }

    #[must_use]
    pub fn stream_make(capacity: Option<StreamCapacity>) -> Self {
        Node::StreamMake { capacity }
    }

    #[must_use]
    pub fn stream_put(target: Node, value: Node) -> Self {
        Node::StreamPut {
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    #[must_use]
    pub fn stream_cursor(source: Node) -> Self {
        Node::StreamCursor {
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn stream_next(source: Node) -> Self {
        Node::StreamNext {
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn resume(parked: Node, value: Node) -> Self {
        Node::Resume {
            parked: Box::new(parked),
            value: Box::new(value),
        }
    }

    /// `((λ name. body) value)`
    #[must_use]
    pub fn let_(name: &str, value: Node, body: Node) -> Self {
        Self::apply(Self::lambda([name], body), [value])
    }

    /// Number of nodes in this tree.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            count += 1;
            pending.extend(node.children());
        }
        count
    }

    /// Child nodes in field declaration order.
    #[must_use]
    pub fn children(&self) -> Vec<&Node> {
        match self {
            Node::Literal(_) | Node::Variable { .. } | Node::StreamMake { .. } | Node::Park => {
                Vec::new()
            }
            Node::Lambda { body, .. } => vec![body.as_ref()],
            Node::Application { operator, operands } => {
                let mut out = vec![operator.as_ref()];
                out.extend(operands.iter());
                out
            }
            Node::If {
                test,
                consequent,
                alternate,
            } => vec![test.as_ref(), consequent.as_ref(), alternate.as_ref()],
            Node::StreamPut { target, value } => vec![target.as_ref(), value.as_ref()],
            Node::StreamCursor { source } | Node::StreamNext { source } => vec![source.as_ref()],
            Node::Resume { parked, value } => vec![parked.as_ref(), value.as_ref()],
        }
    }

    /// Move every child out, leaving `(park)` placeholders behind.
    fn detach_children(&mut self, out: &mut Vec<Node>) {
        match self {
            Node::Literal(_) | Node::Variable { .. } | Node::StreamMake { .. } | Node::Park => {}
            Node::Lambda { body, .. } => out.push(detach(body)),
            Node::Application { operator, operands } => {
                out.push(detach(operator));
                out.append(operands);
            }
            Node::If {
                test,
                consequent,
                alternate,
            } => {
                out.push(detach(test));
                out.push(detach(consequent));
                out.push(detach(alternate));
            }
            Node::StreamPut { target, value } | Node::Resume { parked: target, value } => {
                out.push(detach(target));
                out.push(detach(value));
            }
            Node::StreamCursor { source } | Node::StreamNext { source } => out.push(detach(source)),
        }
    }

    /// Parse the JSON AST shape.
    pub fn from_json(json: &Json) -> Result<Self, AstError> {
        enum Pending<'a> {
            Parse(&'a Json),
            Build(Header<'a>, usize),
        }
        let mut pending = vec![Pending::Parse(json)];
        let mut built: Vec<Node> = Vec::new();
        while let Some(next) = pending.pop() {
            match next {
                Pending::Parse(json) => {
                    let header = Header::read(json)?;
                    let children = header.children()?;
                    pending.push(Pending::Build(header, children.len()));
                    pending.extend(children.into_iter().rev().map(Pending::Parse));
                }
                Pending::Build(header, arity) => {
                    let at = built
                        .len()
                        .checked_sub(arity)
                        .ok_or_else(|| AstError::invalid(header.tag, "child count mismatch"))?;
                    let children = built.split_off(at);
                    built.push(header.build(children)?);
                }
            }
        }
        built
            .pop()
            .ok_or_else(|| AstError::invalid("document", "no node"))
    }

    /// Parse JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, AstError> {
        let json: Json = serde_json::from_str(text)
            .map_err(|e| AstError::invalid("document", e.to_string()))?;
        Self::from_json(&json)
    }

    /// Render the JSON AST shape.
    #[must_use]
    pub fn to_json(&self) -> Json {
        let tag = self.node_type().keyword();
        match self {
            Node::Literal(lit) => json!({"type": tag, "value": literal_to_json(lit)}),
            Node::Variable { name } => json!({"type": tag, "name": name}),
            Node::Lambda { params, body } => {
                json!({"type": tag, "params": params, "body": body.to_json()})
            }
            Node::Application { operator, operands } => json!({
                "type": tag,
                "operator": operator.to_json(),
                "operands": operands.iter().map(Node::to_json).collect::<Vec<_>>(),
            }),
            Node::If {
                test,
                consequent,
                alternate,
            } => json!({
                "type": tag,
                "test": test.to_json(),
                "consequent": consequent.to_json(),
                "alternate": alternate.to_json(),
            }),
            Node::StreamMake { capacity } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(tag));
                match capacity {
                    Some(StreamCapacity::Bounded(n)) => {
                        obj.insert("capacity".into(), json!(n));
                    }
                    Some(StreamCapacity::Unbounded) => {
                        obj.insert("capacity".into(), json!(UNBOUNDED));
                    }
                    None => {}
                }
                Json::Object(obj)
            }
            Node::StreamPut { target, value } => {
                json!({"type": tag, "target": target.to_json(), "value": value.to_json()})
            }
            Node::StreamCursor { source } | Node::StreamNext { source } => {
                json!({"type": tag, "source": source.to_json()})
            }
            Node::Park => json!({"type": tag}),
            Node::Resume { parked, value } => {
                json!({"type": tag, "parked": parked.to_json(), "value": value.to_json()})
            }
        }
    }
}

fn detach(slot: &mut Node) -> Node {
    std::mem::replace(slot, Node::Park)
}

// Deep trees would otherwise be freed one stack frame per level.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(mut node) = pending.pop() {
            node.detach_children(&mut pending);
        }
    }
}

/// A JSON node object whose tag has been read.
struct Header<'a> {
    obj: &'a Map<String, Json>,
    tag: &'a str,
    node_type: NodeType,
}

impl<'a> Header<'a> {
    fn read(json: &'a Json) -> Result<Self, AstError> {
        let obj = json
            .as_object()
            .ok_or_else(|| AstError::invalid("node", format!("expected object, found {json}")))?;
        let tag = obj
            .get("type")
            .ok_or_else(|| AstError::missing("node", "type"))?
            .as_str()
            .ok_or_else(|| AstError::invalid("type", "expected string"))?;
        let node_type = NodeType::from_keyword(tag)?;
        Ok(Self { obj, tag, node_type })
    }

    fn field(&self, field: &str) -> Result<&'a Json, AstError> {
        self.obj
            .get(field)
            .ok_or_else(|| AstError::missing(self.tag, field))
    }

    /// Child objects in field declaration order.
    fn children(&self) -> Result<Vec<&'a Json>, AstError> {
        Ok(match self.node_type {
            NodeType::Literal | NodeType::Variable | NodeType::StreamMake | NodeType::Park => {
                Vec::new()
            }
            NodeType::Lambda => vec![self.field("body")?],
            NodeType::Application => {
                let operands = self
                    .field("operands")?
                    .as_array()
                    .ok_or_else(|| AstError::invalid("operands", "expected array"))?;
                let mut out = Vec::with_capacity(operands.len() + 1);
                out.push(self.field("operator")?);
                out.extend(operands);
                out
            }
            NodeType::If => vec![
                self.field("test")?,
                self.field("consequent")?,
                self.field("alternate")?,
            ],
            NodeType::StreamPut => vec![self.field("target")?, self.field("value")?],
            NodeType::StreamCursor | NodeType::StreamNext => vec![self.field("source")?],
            NodeType::Resume => vec![self.field("parked")?, self.field("value")?],
        })
    }

    /// Assemble the node from its already parsed children.
    fn build(&self, children: Vec<Node>) -> Result<Node, AstError> {
        let mut children = children.into_iter();
        let mut child = || -> Result<Box<Node>, AstError> {
            children
                .next()
                .map(Box::new)
                .ok_or_else(|| AstError::invalid(self.tag, "missing child"))
        };
        Ok(match self.node_type {
            NodeType::Literal => Node::Literal(literal_from_json(self.field("value")?)?),
            NodeType::Variable => Node::Variable {
                name: string_field(self.obj, self.tag, "name")?,
            },
            NodeType::Lambda => {
                let params = self
                    .field("params")?
                    .as_array()
                    .ok_or_else(|| AstError::invalid("params", "expected array"))?
                    .iter()
                    .map(|p| {
                        p.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| AstError::invalid("params", "expected string"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Node::Lambda {
                    params,
                    body: child()?,
                }
            }
            NodeType::Application => {
                let operator = child()?;
                let mut operands = Vec::new();
                while let Ok(operand) = child() {
                    operands.push(*operand);
                }
                Node::Application { operator, operands }
            }
            NodeType::If => Node::If {
                test: child()?,
                consequent: child()?,
                alternate: child()?,
            },
            NodeType::StreamMake => Node::StreamMake {
                capacity: capacity_from_json(self.obj.get("capacity"))?,
            },
            NodeType::StreamPut => Node::StreamPut {
                target: child()?,
                value: child()?,
            },
            NodeType::StreamCursor => Node::StreamCursor { source: child()? },
            NodeType::StreamNext => Node::StreamNext { source: child()? },
            NodeType::Park => Node::Park,
            NodeType::Resume => Node::Resume {
                parked: child()?,
                value: child()?,
            },
        })
    }
}

fn capacity_from_json(value: Option<&Json>) -> Result<Option<StreamCapacity>, AstError> {
    match value {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) if s == UNBOUNDED => Ok(Some(StreamCapacity::Unbounded)),
        Some(Json::Number(n)) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(|n| Some(StreamCapacity::Bounded(n)))
            .ok_or_else(|| AstError::invalid("capacity", format!("{n} is out of range"))),
        Some(other) => Err(AstError::invalid(
            "capacity",
            format!("expected integer or \"{UNBOUNDED}\", found {other}"),
        )),
    }
}

fn string_field(obj: &Map<String, Json>, tag: &str, field: &str) -> Result<String, AstError> {
    obj.get(field)
        .ok_or_else(|| AstError::missing(tag, field))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AstError::invalid(field, "expected string"))
}

fn literal_from_json(value: &Json) -> Result<Literal, AstError> {
    match value {
        Json::Null => Ok(Literal::Nil),
        Json::Bool(b) => Ok(Literal::Bool(*b)),
        Json::Number(n) => n
            .as_i64()
            .map(Literal::Int)
            .ok_or_else(|| AstError::invalid("value", format!("{n} is not a 64-bit integer"))),
        Json::String(s) => Ok(Literal::Str(s.clone())),
        Json::Object(obj) => match obj.get("keyword").and_then(Json::as_str) {
            Some(k) if obj.len() == 1 => Ok(Literal::Keyword(k.to_string())),
            _ => Err(AstError::invalid("value", "expected {\"keyword\": name}")),
        },
        Json::Array(_) => Err(AstError::invalid("value", "arrays are not literals")),
    }
}

fn literal_to_json(lit: &Literal) -> Json {
    match lit {
        Literal::Nil => Json::Null,
        Literal::Bool(b) => json!(b),
        Literal::Int(n) => json!(n),
        Literal::Str(s) => json!(s),
        Literal::Keyword(k) => json!({ "keyword": k }),
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_atom(), f)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Literal(lit) => write!(f, "{lit}"),
            Node::Variable { name } => write!(f, "{name}"),
            Node::Lambda { params, body } => write!(f, "(λ{}. {body})", params.join(" ")),
            Node::Application { operator, operands } => {
                write!(f, "({operator}")?;
                for operand in operands {
                    write!(f, " {operand}")?;
                }
                write!(f, ")")
            }
            Node::If {
                test,
                consequent,
                alternate,
            } => write!(f, "(if {test} {consequent} {alternate})"),
            Node::StreamMake { capacity: None } => write!(f, "(stream-make)"),
            Node::StreamMake {
                capacity: Some(StreamCapacity::Bounded(n)),
            } => write!(f, "(stream-make {n})"),
            Node::StreamMake {
                capacity: Some(StreamCapacity::Unbounded),
            } => write!(f, "(stream-make :{UNBOUNDED})"),
            Node::StreamPut { target, value } => write!(f, "(stream-put {target} {value})"),
            Node::StreamCursor { source } => write!(f, "(stream-cursor {source})"),
            Node::StreamNext { source } => write!(f, "(stream-next {source})"),
            Node::Park => write!(f, "(park)"),
            Node::Resume { parked, value } => write!(f, "(resume {parked} {value})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_application() {
        let node = Node::from_json(&json!({
            "type": "application",
            "operator": {"type": "variable", "name": "+"},
            "operands": [
                {"type": "literal", "value": 10},
                {"type": "literal", "value": 20}
            ]
        }))
        .unwrap();
        assert_eq!(node, Node::call("+", [Node::int(10), Node::int(20)]));
        assert_eq!(node.to_string(), "(+ 10 20)");
    }

    #[test]
    fn test_json_round_trip_all_tags() {
        let node = Node::let_(
            "s",
            Node::stream_make(Some(StreamCapacity::Unbounded)),
            Node::if_(
                Node::bool(true),
                Node::stream_next(Node::stream_cursor(Node::stream_put(
                    Node::var("s"),
                    Node::keyword("first"),
                ))),
                Node::resume(Node::Park, Node::nil()),
            ),
        );
        assert_eq!(Node::from_json(&node.to_json()).unwrap(), node);
    }

    #[test]
    fn test_missing_field() {
        let err = Node::from_json(&json!({"type": "if", "test": {"type": "park"}})).unwrap_err();
        assert_eq!(err, AstError::missing("if", "consequent"));
    }

    #[test]
    fn test_unknown_tag() {
        let err = Node::from_json(&json!({"type": "loop"})).unwrap_err();
        assert_eq!(err, AstError::UnknownTag { tag: "loop".into() });
    }

    #[test]
    fn test_negative_capacity_rejected() {
        let err = Node::from_json(&json!({"type": "stream-make", "capacity": -1})).unwrap_err();
        assert!(matches!(err, AstError::InvalidField { field, .. } if field == "capacity"));
    }

    #[test]
    fn test_size() {
        let node = Node::apply(Node::lambda(["x"], Node::var("x")), [Node::int(1)]);
        assert_eq!(node.size(), 4);
    }

    #[test]
    fn test_deep_json_nesting_parses() {
        let depth = 2_000;
        let mut json = json!({"type": "literal", "value": 0});
        for _ in 0..depth {
            let mut obj = Map::new();
            obj.insert("type".into(), json!("application"));
            obj.insert("operator".into(), json!({"type": "variable", "name": "-"}));
            obj.insert(
                "operands".into(),
                Json::Array(vec![json, json!({"type": "literal", "value": 1})]),
            );
            json = Json::Object(obj);
        }
        let node = Node::from_json(&json).unwrap();
        assert_eq!(node.size(), depth * 3 + 1);
        let Node::Application { operands, .. } = &node else {
            panic!("expected application");
        };
        assert_eq!(operands[1], Node::int(1));
    }

    #[test]
    fn test_deep_tree_sizes_and_drops() {
        let depth = 200_000;
        let mut node = Node::int(0);
        for _ in 0..depth {
            node = Node::lambda(["x"], node);
        }
        assert_eq!(node.size(), depth + 1);
        drop(node);
    }
}
