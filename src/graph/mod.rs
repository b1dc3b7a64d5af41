//! Computational graph with explicit per-node Jacobians.
//!
//! Nodes live in an arena owned by [`Graph`] and are addressed by [`NodeId`].
//! Parent and child lists are kept symmetric by [`Graph::add_parent`].
//!
//! A cycle runs: `forward(loss)`, then `backward(param, loss)` for every
//! parameter, `update(param, lr)`, and finally `clear_all_jacobi()`.
//!
//! ```rust
//! use jacobi_graph::{Graph, Op, Tensor};
//!
//! # fn main() -> Result<(), jacobi_graph::Error> {
//! let mut g = Graph::new();
//! let x = g.data_node("x", Tensor::from_vec([1, 1, 1, 2], vec![1.0, -1.0])?);
//! let w = g.weight_node("w", Tensor::from_vec([1, 1, 1, 2], vec![0.5, 2.0])?);
//! let y = g.op_node("y", Op::Multiply, &[x, w])?;
//!
//! g.forward(y)?;
//! g.backward(w, y)?;
//! // d(y) / d(w) = diag(x)
//! assert_eq!(g.jacobi(w)?.to_vec()?, vec![1.0, 0.0, 0.0, -1.0]);
//! # Ok(())
//! # }
//! ```

pub mod loss;
pub mod node;
pub mod op;

pub use loss::{LabelMatch, LogLossConfig};
pub use node::{Node, NodeId, NodeKind};
pub use op::{LocalJacobi, Op};

use crate::error::Error;
use crate::init::{self, InitScheme};
use crate::ops::jacobian;
use crate::tensor::{Elem, Shape, Tensor};

/// Arena of graph nodes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        debug_println!("new node {} '{}' ({})", id, node.name, node.kind);
        self.nodes.push(node);
        id
    }

    /// Adds a leaf holding externally supplied values.
    pub fn data_node(&mut self, name: impl Into<String>, data: Tensor) -> NodeId {
        self.push(Node::new(name.into(), NodeKind::Data, data))
    }

    /// Adds a trainable leaf with the given initial values.
    pub fn weight_node(&mut self, name: impl Into<String>, data: Tensor) -> NodeId {
        self.push(Node::new(name.into(), NodeKind::Weight, data))
    }

    /// Adds a trainable leaf of `shape` initialized with `scheme`.
    pub fn init_weight(
        &mut self,
        name: impl Into<String>,
        shape: Shape,
        scheme: InitScheme,
    ) -> Result<NodeId, Error> {
        let data = init::initialize(scheme, shape)?;
        Ok(self.weight_node(name, data))
    }

    /// Adds an operation node wired to `parents` in order. Its data stays
    /// uninitialized until the first forward pass.
    pub fn op_node(
        &mut self,
        name: impl Into<String>,
        op: Op,
        parents: &[NodeId],
    ) -> Result<NodeId, Error> {
        for &p in parents {
            if self.node(p)?.is_terminal() {
                return Err(self.misuse(p, "loss nodes cannot have children"));
            }
        }
        op.check_arity(parents.len())?;
        let id = self.push(Node::new(name.into(), NodeKind::Op(op), Tensor::uninitialized()));
        for &p in parents {
            self.add_parent(id, p)?;
        }
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, Error> {
        self.nodes.get(id.0).ok_or(Error::UnknownNode(id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, Error> {
        self.nodes.get_mut(id.0).ok_or(Error::UnknownNode(id.0))
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    fn misuse(&self, id: NodeId, reason: &str) -> Error {
        Error::GraphMisuse {
            node: self
                .nodes
                .get(id.0)
                .map_or_else(|| id.to_string(), |n| n.name.clone()),
            reason: reason.to_string(),
        }
    }

    /// True if `to` is reachable from `from` along child links.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if std::mem::replace(&mut seen[id.0], true) {
                continue;
            }
            stack.extend(self.nodes[id.0].children.iter().copied());
        }
        false
    }

    /// Registers `parent` as an input of `child` and `child` as a consumer of
    /// `parent`. Repeated links are ignored.
    ///
    /// # Errors
    /// [`Error::GraphMisuse`] if `child` is a leaf, `parent` is a loss node, or
    /// the link would close a cycle.
    pub fn add_parent(&mut self, child: NodeId, parent: NodeId) -> Result<(), Error> {
        let (c, p) = (self.node(child)?, self.node(parent)?);
        if c.is_leaf() {
            return Err(self.misuse(child, "leaf nodes cannot have parents"));
        }
        if p.is_terminal() {
            return Err(self.misuse(parent, "loss nodes cannot have children"));
        }
        if c.parents.contains(&parent) {
            return Ok(());
        }
        if self.reaches(child, parent) {
            return Err(self.misuse(child, "link would create a cycle"));
        }
        self.nodes[child.0].parents.push(parent);
        if !self.nodes[parent.0].children.contains(&child) {
            self.nodes[parent.0].children.push(child);
        }
        Ok(())
    }

    /// Mirror of [`Graph::add_parent`].
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), Error> {
        self.add_parent(child, parent)
    }

    pub fn parents(&self, id: NodeId) -> Result<&[NodeId], Error> {
        let node = self.node(id)?;
        if matches!(node.kind, NodeKind::Data) {
            return Err(self.misuse(id, "data nodes have no parents"));
        }
        Ok(&node.parents)
    }

    pub fn children(&self, id: NodeId) -> Result<&[NodeId], Error> {
        let node = self.node(id)?;
        if node.is_terminal() {
            return Err(self.misuse(id, "loss nodes have no children"));
        }
        Ok(&node.children)
    }

    /// The node's data; the returned tensor aliases the node's buffer.
    pub fn data(&self, id: NodeId) -> Result<Tensor, Error> {
        Ok(self.node(id)?.data.clone())
    }

    pub fn jacobi(&self, id: NodeId) -> Result<Tensor, Error> {
        Ok(self.node(id)?.jacobi.clone())
    }

    /// Replaces a leaf's values and marks everything downstream stale.
    pub fn set_data(&mut self, id: NodeId, data: Tensor) -> Result<(), Error> {
        if !self.node(id)?.is_leaf() {
            return Err(self.misuse(id, "only leaf nodes accept external data"));
        }
        self.nodes[id.0].data = data;
        let mut stack = self.nodes[id.0].children.clone();
        while let Some(n) = stack.pop() {
            let node = &mut self.nodes[n.0];
            if node.awaiting_backward {
                node.awaiting_backward = false;
                stack.extend(node.children.iter().copied());
            }
        }
        Ok(())
    }

    pub fn set_requires_grad(&mut self, id: NodeId, requires_grad: bool) -> Result<(), Error> {
        self.node_mut(id)?.requires_grad = requires_grad;
        Ok(())
    }

    /// Computes the node's data, forwarding every parent that has no fresh
    /// output yet.
    pub fn forward(&mut self, id: NodeId) -> Result<(), Error> {
        let node = self.node(id)?;
        let parents = match node.kind {
            NodeKind::Data => return Ok(()),
            NodeKind::Weight => None,
            NodeKind::Op(_) => Some(node.parents.clone()),
        };
        let Some(parents) = parents else {
            self.nodes[id.0].awaiting_backward = true;
            return Ok(());
        };
        for &p in &parents {
            if !self.nodes[p.0].awaiting_backward {
                self.forward(p)?;
            }
        }
        let inputs: Vec<Tensor> = parents.iter().map(|p| self.nodes[p.0].data.clone()).collect();
        let node = &mut self.nodes[id.0];
        if let NodeKind::Op(op) = &mut node.kind {
            node.data = op.compute_forward(&inputs)?;
            debug_println!("forward '{}' {} -> {:?}", node.name, op, node.data.shape());
        }
        node.awaiting_backward = true;
        Ok(())
    }

    /// Computes the Jacobian of `target`'s output with respect to `id`'s data.
    ///
    /// Children that still await backward are processed first; their
    /// contributions are chained through each child's local Jacobian and
    /// summed. A node that does not require gradients passes its children's
    /// Jacobians through unchanged.
    pub fn backward(&mut self, id: NodeId, target: NodeId) -> Result<(), Error> {
        let node = self.node(id)?;
        let target_data = &self.node(target)?.data;
        if !target_data.is_initialized() || !node.data.is_initialized() {
            return Err(Error::Uninitialized);
        }
        let own = node.data.shape();
        let [n, c, h, w] = own;

        if id == target {
            let node = &mut self.nodes[id.0];
            node.jacobi = jacobian::identity(n, c, h * w)?;
            node.awaiting_backward = false;
            return Ok(());
        }
        if matches!(node.kind, NodeKind::Data) {
            return Ok(());
        }

        let [_, _, th, tw] = target_data.shape();
        let rows = th * tw;
        let requires_grad = node.requires_grad;
        let children = node.children.clone();

        let mut acc = Tensor::uninitialized();
        for child in children {
            if !self.nodes[child.0].data.is_initialized() {
                continue;
            }
            if self.nodes[child.0].awaiting_backward {
                self.backward(child, target)?;
            }
            let child_node = &self.nodes[child.0];
            let upstream = &child_node.jacobi;
            if !upstream.is_initialized() {
                continue;
            }
            let contribution = if requires_grad {
                let slot = child_node
                    .parents
                    .iter()
                    .position(|&p| p == id)
                    .ok_or_else(|| self.misuse(child, "child does not list this node as a parent"))?;
                let inputs: Vec<Tensor> = child_node
                    .parents
                    .iter()
                    .map(|p| self.nodes[p.0].data.clone())
                    .collect();
                let op = match &child_node.kind {
                    NodeKind::Op(op) => op,
                    _ => return Err(self.misuse(child, "leaf node listed as a child")),
                };
                op.compute_jacobi(&inputs, &child_node.data, upstream, slot)?
                    .chain(upstream, own)?
            } else {
                upstream.clone()
            };
            if acc.is_initialized() {
                if acc.shape() != contribution.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: acc.shape().to_vec(),
                        actual: contribution.shape().to_vec(),
                    });
                }
                acc.add_(&contribution)?;
            } else {
                acc = contribution;
            }
        }
        if !acc.is_initialized() {
            acc = Tensor::zeros([n, c, rows, h * w])?;
        }

        let node = &mut self.nodes[id.0];
        debug_println!("backward '{}' jacobi {:?}", node.name, acc.shape());
        node.jacobi = acc;
        node.awaiting_backward = false;
        Ok(())
    }

    /// Gradient-descent step `data -= lr * jacobi` on a weight node whose
    /// Jacobian was taken against a scalar target. Other node kinds are left
    /// unchanged.
    pub fn update(&mut self, id: NodeId, learning_rate: Elem) -> Result<(), Error> {
        let node = self.node(id)?;
        if !matches!(node.kind, NodeKind::Weight) || !node.requires_grad {
            debug_println!("update skipped for '{}'", node.name);
            return Ok(());
        }
        if !node.jacobi.is_initialized() {
            return Err(Error::InvalidOperation(format!(
                "node '{}' has no Jacobian; run backward first",
                node.name
            )));
        }
        if node.jacobi.len() != node.data.len() {
            return Err(Error::ShapeMismatch {
                expected: node.data.shape().to_vec(),
                actual: node.jacobi.shape().to_vec(),
            });
        }
        let step = node.jacobi.view(node.data.shape())?.scale(-learning_rate)?;
        let node = &mut self.nodes[id.0];
        node.data.add_(&step)?;
        Ok(())
    }

    /// Drops the node's Jacobian and returns it to the clean state. Data and
    /// links are kept.
    pub fn clear_jacobi(&mut self, id: NodeId) -> Result<(), Error> {
        let node = self.node_mut(id)?;
        node.jacobi = Tensor::uninitialized();
        node.awaiting_backward = false;
        Ok(())
    }

    pub fn clear_all_jacobi(&mut self) {
        for node in &mut self.nodes {
            node.jacobi = Tensor::uninitialized();
            node.awaiting_backward = false;
        }
    }
}
