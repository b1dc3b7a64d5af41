use crate::graph::op::Op;
use crate::tensor::Tensor;

use std::fmt;

/// Stable handle of a node inside a [`Graph`](crate::graph::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a node holds and how it takes part in forward/backward passes.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Externally supplied values (inputs, labels). No parents; forward and
    /// backward are no-ops.
    Data,
    /// Trainable leaf updated by gradient descent.
    Weight,
    /// Result of an operation over its parents.
    Op(Op),
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeKind::Data => write!(f, "Data"),
            NodeKind::Weight => write!(f, "Weight"),
            NodeKind::Op(op) => write!(f, "{}", op),
        }
    }
}

/// A graph node: its data, its Jacobian relative to the latest backward
/// target, and its links.
///
/// The Jacobian has shape `(N, C, target_H * target_W, H * W)`.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) data: Tensor,
    pub(crate) jacobi: Tensor,
    pub(crate) parents: Vec<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) awaiting_backward: bool,
    pub(crate) requires_grad: bool,
}

impl Node {
    pub(crate) fn new(name: String, kind: NodeKind, data: Tensor) -> Self {
        let requires_grad = !matches!(kind, NodeKind::Data);
        Node {
            name,
            kind,
            data,
            jacobi: Tensor::uninitialized(),
            parents: Vec::new(),
            children: Vec::new(),
            awaiting_backward: false,
            requires_grad,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn jacobi(&self) -> &Tensor {
        &self.jacobi
    }

    /// True between a forward pass and the backward pass that consumes it.
    pub fn is_awaiting_backward(&self) -> bool {
        self.awaiting_backward
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Data | NodeKind::Weight)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(&self.kind, NodeKind::Op(op) if op.is_terminal())
    }
}
