//! Structured value model used by the merge engine.
//!
//! A [`Node`] is either a leaf [`Primitive`], a keyed [`Node::Mapping`], or an
//! ordered [`Node::List`]. The merge engine recurses over this tagged shape
//! instead of inspecting dynamic JSON values.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

/// A non-container leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
}

/// A structured value: primitive, mapping, or list.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Primitive(Primitive),
    /// Keyed mapping. Key order is not significant.
    Mapping(BTreeMap<String, Node>),
    List(Vec<Node>),
}

impl Node {
    /// Parse JSON bytes into a node.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice::<Value>(bytes).map(Self::from)
    }

    /// Serialize as pretty-printed JSON with a trailing newline.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = serde_json::to_vec_pretty(&Value::from(self.clone()))?;
        out.push(b'\n');
        Ok(out)
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Primitive(Primitive::Null),
            Value::Bool(b) => Self::Primitive(Primitive::Bool(b)),
            Value::Number(n) => Self::Primitive(Primitive::Number(n)),
            Value::String(s) => Self::Primitive(Primitive::String(s)),
            Value::Array(items) => Self::List(items.into_iter().map(Node::from).collect()),
            Value::Object(map) => {
                Self::Mapping(map.into_iter().map(|(k, v)| (k, Node::from(v))).collect())
            }
        }
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Self {
        match node {
            Node::Primitive(Primitive::Null) => Value::Null,
            Node::Primitive(Primitive::Bool(b)) => Value::Bool(b),
            Node::Primitive(Primitive::Number(n)) => Value::Number(n),
            Node::Primitive(Primitive::String(s)) => Value::String(s),
            Node::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Node::Mapping(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}
