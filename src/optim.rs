// src/optim.rs
use crate::graph::{Graph, NodeId};
use crate::{Elem, Error};

/// Stochastic Gradient Descent over graph weight nodes.
#[derive(Debug, Clone)]
pub struct Sgd {
    parameters: Vec<NodeId>,
    learning_rate: Elem,
}

impl Sgd {
    /// Creates a new SGD optimizer.
    ///
    /// # Arguments
    ///
    /// * `parameters` - Weight nodes to update.
    /// * `learning_rate` - The step size for gradient updates.
    pub fn new(parameters: Vec<NodeId>, learning_rate: Elem) -> Self {
        Sgd {
            parameters,
            learning_rate,
        }
    }

    pub fn learning_rate(&self) -> Elem {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: Elem) {
        self.learning_rate = learning_rate;
    }

    /// Computes each parameter's Jacobian against the scalar `loss` and
    /// applies `param = param - lr * jacobi`.
    ///
    /// `loss` must have been forwarded in the current cycle.
    pub fn step(&mut self, graph: &mut Graph, loss: NodeId) -> Result<(), Error> {
        for &param in &self.parameters {
            graph.backward(param, loss)?;
        }
        // Apply updates only after every Jacobian is computed from the same data.
        for &param in &self.parameters {
            graph.update(param, self.learning_rate)?;
        }
        debug_println!("sgd step over {} parameters", self.parameters.len());
        Ok(())
    }

    /// Clears every Jacobian in the graph, starting a new cycle.
    pub fn zero_grad(&mut self, graph: &mut Graph) {
        graph.clear_all_jacobi();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Op;
    use crate::Tensor;

    #[test]
    fn test_sgd_step_moves_against_gradient() -> Result<(), Error> {
        // loss = w * x with x = 2, so d(loss)/dw = 2.
        let mut g = Graph::new();
        let x = g.data_node("x", Tensor::scalar(2.0));
        let w = g.weight_node("w", Tensor::scalar(1.0));
        let y = g.op_node("y", Op::Multiply, &[w, x])?;

        let mut sgd = Sgd::new(vec![w], 0.1);
        g.forward(y)?;
        sgd.step(&mut g, y)?;
        assert!((g.data(w)?.get_flat(0)? - 0.8).abs() < 1e-12);

        sgd.zero_grad(&mut g);
        assert!(!g.jacobi(w)?.is_initialized());
        Ok(())
    }
}
