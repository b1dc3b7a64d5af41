use crate::graph::{Graph, NodeId};
use crate::{Elem, Error, Tensor};

/// Checks the analytical Jacobian of `target` with respect to the leaf `node`
/// against central finite differences.
///
/// # Arguments
/// * `graph`: The graph holding both nodes. Jacobians are cleared on return.
/// * `node`: A weight (or other leaf) node whose data is perturbed.
/// * `target`: The node whose output is differentiated.
/// * `epsilon`: Finite-difference perturbation (e.g., 1e-6).
/// * `tolerance`: Allowed absolute difference, relative to `max(1, |analytical|, |numerical|)`.
///
/// Numerical rows are summed over the target's (batch, channel) slices, which
/// matches how the backward pass folds slices onto a shared parent.
pub fn check_jacobian(
    graph: &mut Graph,
    node: NodeId,
    target: NodeId,
    epsilon: Elem,
    tolerance: Elem,
) -> Result<(), Error> {
    // --- Analytical Jacobian ---
    graph.clear_all_jacobi();
    graph.forward(target)?;
    graph.backward(node, target)?;
    let analytical = graph.jacobi(node)?;

    let base = graph.data(node)?.deep_copy();
    let [xn, xc, xh, xw] = base.shape();
    let own_slice = xh * xw;
    let [_, _, th, tw] = graph.data(target)?.shape();
    let rows = th * tw;
    let expected = [xn, xc, rows, own_slice];
    if analytical.shape() != expected {
        return Err(Error::ShapeMismatch {
            expected: expected.to_vec(),
            actual: analytical.shape().to_vec(),
        });
    }
    let analytical = analytical.as_slice()?;

    // --- Numerical Jacobian, one input element at a time ---
    let result = (|| -> Result<(), Error> {
        for i in 0..base.len() {
            let original = base.get_flat(i)?;
            let mut outputs = Vec::with_capacity(2);
            for delta in [epsilon, -epsilon] {
                let mut perturbed = base.deep_copy();
                perturbed.set_flat(i, original + delta)?;
                graph.clear_all_jacobi();
                graph.set_data(node, perturbed)?;
                graph.forward(target)?;
                outputs.push(graph.data(target)?.to_vec()?);
            }

            let (slice, m) = (i / own_slice, i % own_slice);
            for r in 0..rows {
                let numerical: Elem = outputs[0]
                    .iter()
                    .zip(&outputs[1])
                    .skip(r)
                    .step_by(rows)
                    .map(|(p, q)| (p - q) / (2.0 * epsilon))
                    .sum();
                let a = analytical[(slice * rows + r) * own_slice + m];
                let abs_error = (a - numerical).abs();
                let scale = 1.0_f64.max(a.abs()).max(numerical.abs());
                if abs_error > tolerance * scale {
                    return Err(Error::JacobianCheckError {
                        analytical: a,
                        numerical,
                        abs_error,
                        at_index: (slice * rows + r) * own_slice + m,
                    });
                }
            }
        }
        Ok(())
    })();

    // --- Restore the unperturbed state ---
    graph.set_data(node, base)?;
    graph.clear_all_jacobi();
    result
}

/// Builds a tensor of `shape` with deterministic, distinct values in
/// `[-1, 1]`, useful for tie-free test inputs.
pub fn ramp(shape: [usize; 4]) -> Result<Tensor, Error> {
    let len: usize = shape.iter().product();
    let data = (0..len)
        .map(|i| ((i * 7919) % 1000) as Elem / 500.0 - 1.0)
        .collect();
    Tensor::from_vec(shape, data)
}
