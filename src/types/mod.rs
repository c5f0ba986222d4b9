use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Unique identifier for a value within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub usize);

/// Identity of a graph instance. Two `Graph` objects never share an id, so a
/// `(GraphId, ValueId)` pair is unambiguous even when a rewrite spans two
/// graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GraphId(pub(crate) u32);

/// A graph-qualified value reference. Node wiring inside a graph uses plain
/// `ValueId`s; only rewrite-scratch state (gradient slots and the
/// staging/retention maps) uses these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueRef {
    pub graph: GraphId,
    pub value: ValueId,
}

/// A graph-qualified node reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef {
    pub graph: GraphId,
    pub node: NodeId,
}

/// Element type of a tensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    Float32,
    Float64,
    Int32,
    Int64,
    Bool,
}

impl Dtype {
    pub fn size_of(self) -> usize {
        match self {
            Dtype::Float32 | Dtype::Int32 => 4,
            Dtype::Float64 | Dtype::Int64 => 8,
            Dtype::Bool => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Dtype::Float32 | Dtype::Float64)
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

/// Type of a tensor slot: element dtype plus element count. The count is
/// `None` while shape inference has not resolved it; such values have no
/// known byte size and make the whole graph unsupported for rewriting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: Dtype,
    pub elements: Option<usize>,
}

impl TensorType {
    pub fn new(dtype: Dtype, elements: usize) -> Self {
        Self {
            dtype,
            elements: Some(elements),
        }
    }

    pub fn scalar(dtype: Dtype) -> Self {
        Self::new(dtype, 1)
    }

    /// A type whose element count is still unresolved.
    pub fn unresolved(dtype: Dtype) -> Self {
        Self {
            dtype,
            elements: None,
        }
    }

    /// Total byte size, if the element count is known.
    pub fn nbytes(&self) -> Option<usize> {
        self.elements.map(|n| n * self.dtype.size_of())
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.elements {
            Some(n) => write!(f, "{}[{}]", self.dtype, n),
            None => write!(f, "{}[?]", self.dtype),
        }
    }
}
