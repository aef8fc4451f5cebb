//! Runtime values and the parsed-object arena.
//!
//! A parsed tree is a set of [`NodeData`] records owned by an
//! [`ObjectArena`]; nodes refer to each other (parent, root, field values)
//! through [`NodeId`] indices, never through owning references, so
//! back-references cannot form ownership cycles.
//!
//! [`Value`] is the tagged union flowing through the expression evaluator
//! and into node fields. Integers are `i64` until a read or an arithmetic
//! step produces something wider, at which point they promote to
//! [`Value::BigInt`].

use crate::schema::model::Endian;
use crate::stream::SharedStream;
use indexmap::IndexMap;
use num_bigint::BigInt;
use std::rc::Rc;

/// Index of a node in its [`ObjectArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// An enum-tagged integer: the raw value plus the enum it was tagged with.
/// The symbolic label is resolved when the tag is applied and kept for
/// output; expressions always operate on the raw integer.
#[derive(Debug, Clone)]
pub struct EnumValue {
    pub enum_name: Rc<str>,
    pub label: Option<Rc<str>>,
    pub value: i64,
}

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Bool(bool),
    Bytes(Rc<Vec<u8>>),
    Str(Rc<str>),
    Array(Rc<Vec<Value>>),
    Object(NodeId),
    Enum(EnumValue),
    Stream(SharedStream),
}

impl Value {
    pub fn bytes(data: Vec<u8>) -> Value {
        Value::Bytes(Rc::new(data))
    }

    pub fn string(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(items))
    }

    /// Wraps an unsigned 64-bit read, promoting past `i64::MAX` to BigInt.
    pub fn from_u64(v: u64) -> Value {
        match i64::try_from(v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::BigInt(BigInt::from(v)),
        }
    }

    /// Collapses a BigInt back to `Int` when it fits.
    pub fn from_bigint(v: BigInt) -> Value {
        match i64::try_from(&v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::BigInt(v),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::BigInt(_) => "integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "boolean",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Enum(_) => "enum",
            Value::Stream(_) => "stream",
        }
    }

    /// The integer behind this value, if it is integral. Enum tags count;
    /// BigInts count only when they fit in `i64`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::BigInt(b) => i64::try_from(b).ok(),
            Value::Enum(e) => Some(e.value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Lazily evaluated instance field on a node.
#[derive(Debug, Clone)]
pub enum InstanceSlot {
    Pending,
    /// Evaluation in flight; seeing this again means a reference cycle.
    InProgress,
    Done(Value),
}

/// One materialized object in the parse tree.
#[derive(Debug)]
pub struct NodeData {
    /// Path of nested type names from the schema root that produced this
    /// node; empty for the top-level type.
    pub type_path: Rc<Vec<String>>,
    /// Sequential fields, in the order the type's `seq` assigned them.
    pub fields: IndexMap<String, Value>,
    /// Parameter bindings for parametric types.
    pub params: IndexMap<String, Value>,
    /// Lazy instances declared on this node's type.
    pub instances: IndexMap<String, InstanceSlot>,
    pub start_pos: u64,
    /// Bytes consumed by the node's `seq`; frozen once `finalized`.
    pub sizeof: u64,
    pub finalized: bool,
    /// The stream this node was parsed from (`_io`).
    pub io: SharedStream,
    pub parent: Option<NodeId>,
    pub root: NodeId,
    /// Byte order resolved for this node, once a field required one.
    pub endian: Option<Endian>,
}

/// Flat storage for every node of one parse.
#[derive(Debug, Default)]
pub struct ObjectArena {
    nodes: Vec<NodeData>,
}

impl ObjectArena {
    pub fn new() -> Self {
        ObjectArena::default()
    }

    pub fn alloc(&mut self, node: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::KaitaiStream;

    fn dummy_node(io: SharedStream) -> NodeData {
        NodeData {
            type_path: Rc::new(vec![]),
            fields: IndexMap::new(),
            params: IndexMap::new(),
            instances: IndexMap::new(),
            start_pos: 0,
            sizeof: 0,
            finalized: false,
            io,
            parent: None,
            root: NodeId(0),
            endian: None,
        }
    }

    #[test]
    fn u64_promotion_boundary() {
        assert!(matches!(Value::from_u64(i64::MAX as u64), Value::Int(_)));
        assert!(matches!(
            Value::from_u64(i64::MAX as u64 + 1),
            Value::BigInt(_)
        ));
    }

    #[test]
    fn bigint_collapses_when_small() {
        assert!(matches!(
            Value::from_bigint(BigInt::from(42)),
            Value::Int(42)
        ));
        let big = BigInt::from(u64::MAX);
        assert!(matches!(Value::from_bigint(big), Value::BigInt(_)));
    }

    #[test]
    fn arena_hands_out_sequential_ids() {
        let io = KaitaiStream::shared(vec![]);
        let mut arena = ObjectArena::new();
        let a = arena.alloc(dummy_node(io.clone()));
        let b = arena.alloc(dummy_node(io));
        assert_eq!(a, NodeId(0));
        assert_eq!(b, NodeId(1));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn enum_values_expose_raw_integer() {
        let v = Value::Enum(EnumValue {
            enum_name: Rc::from("protocol"),
            label: Some(Rc::from("tcp")),
            value: 6,
        });
        assert_eq!(v.as_int(), Some(6));
    }
}
