// tests/gradient_checker_tests.rs
use jacobi_graph::nn::{self, Conv2dConfig};
use jacobi_graph::test_utils::{check_jacobian, ramp};
use jacobi_graph::{Elem, Error, Graph, InitScheme, LogLossConfig, Op, Reduction, Tensor};

const EPSILON: Elem = 1e-6;
const TOLERANCE: Elem = 1e-5;

#[test]
fn test_sigmoid_matches_finite_differences() -> Result<(), Error> {
    let xs: Vec<Elem> = (-5..=5).map(|x| x as Elem).collect();
    let mut g = Graph::new();
    let x = g.weight_node("x", Tensor::from_vec([1, 1, 1, 11], xs)?);
    let s = g.op_node("s", Op::Sigmoid, &[x])?;
    check_jacobian(&mut g, x, s, EPSILON, 1e-4)?;
    Ok(())
}

#[test]
fn test_add_broadcast_operands() -> Result<(), Error> {
    let mut g = Graph::new();
    let a = g.weight_node("a", ramp([2, 1, 2, 2])?);
    let b = g.weight_node("b", Tensor::from_vec([1, 1, 1, 2], vec![0.3, -0.7])?);
    let sum = g.op_node("sum", Op::Add, &[a, b])?;
    check_jacobian(&mut g, a, sum, EPSILON, TOLERANCE)?;
    check_jacobian(&mut g, b, sum, EPSILON, TOLERANCE)?;
    Ok(())
}

#[test]
fn test_multiply_broadcast_operands() -> Result<(), Error> {
    let mut g = Graph::new();
    let a = g.weight_node("a", ramp([1, 2, 2, 3])?);
    let b = g.weight_node("b", Tensor::from_vec([1, 1, 1, 3], vec![0.3, -0.7, 1.1])?);
    let prod = g.op_node("prod", Op::Multiply, &[a, b])?;
    check_jacobian(&mut g, a, prod, EPSILON, TOLERANCE)?;
    check_jacobian(&mut g, b, prod, EPSILON, TOLERANCE)?;
    Ok(())
}

#[test]
fn test_matmul_both_operands() -> Result<(), Error> {
    let mut g = Graph::new();
    let a = g.weight_node("a", ramp([2, 1, 2, 3])?);
    let b = g.weight_node("b", ramp([1, 1, 3, 2])?.scale(0.5)?);
    let prod = g.op_node("prod", Op::MatMul, &[a, b])?;
    check_jacobian(&mut g, a, prod, EPSILON, TOLERANCE)?;
    check_jacobian(&mut g, b, prod, EPSILON, TOLERANCE)?;
    Ok(())
}

#[test]
fn test_transpose_then_sigmoid() -> Result<(), Error> {
    let mut g = Graph::new();
    let x = g.weight_node("x", ramp([1, 2, 2, 3])?);
    let t = g.op_node("t", Op::Transpose, &[x])?;
    let s = g.op_node("s", Op::Sigmoid, &[t])?;
    check_jacobian(&mut g, x, s, EPSILON, TOLERANCE)?;
    Ok(())
}

#[test]
fn test_padding() -> Result<(), Error> {
    let mut g = Graph::new();
    let x = g.weight_node("x", ramp([1, 2, 3, 3])?);
    let p = g.op_node(
        "p",
        Op::Padding {
            padding: (1, 2),
            fill: 0.5,
        },
        &[x],
    )?;
    let s = g.op_node("s", Op::Sigmoid, &[p])?;
    check_jacobian(&mut g, x, s, EPSILON, TOLERANCE)?;
    Ok(())
}

#[test]
fn test_img2col_overlapping_and_truncating() -> Result<(), Error> {
    for (size, stride) in [(4, 1), (5, 2)] {
        let mut g = Graph::new();
        let x = g.weight_node("x", ramp([2, 2, size, size])?);
        let cols = g.op_node(
            "cols",
            Op::Img2col {
                kernel: (2, 2),
                stride,
            },
            &[x],
        )?;
        check_jacobian(&mut g, x, cols, EPSILON, TOLERANCE)?;
    }
    Ok(())
}

#[test]
fn test_max_pool() -> Result<(), Error> {
    let mut g = Graph::new();
    let x = g.weight_node("x", ramp([2, 2, 4, 4])?);
    let pool = g.op_node("pool", Op::max_pool2d((2, 2), 2), &[x])?;
    let s = g.op_node("s", Op::Sigmoid, &[pool])?;
    check_jacobian(&mut g, x, s, EPSILON, TOLERANCE)?;
    Ok(())
}

#[test]
fn test_conv_core_all_parents() -> Result<(), Error> {
    // Output-channel bias and per-input-channel bias, both tiled over positions.
    for bias_shape in [[1, 1, 3, 1], [1, 2, 3, 1]] {
        let mut g = Graph::new();
        let weight = g.weight_node("w", ramp([1, 2, 3, 4])?);
        let cols = g.weight_node("cols", ramp([2, 2, 4, 5])?.scale(0.5)?);
        let bias = g.weight_node("b", ramp(bias_shape)?.scale(0.3)?);
        let core = g.op_node("core", Op::ConvCore, &[weight, cols, bias])?;
        let s = g.op_node("s", Op::Sigmoid, &[core])?;
        check_jacobian(&mut g, weight, s, EPSILON, TOLERANCE)?;
        check_jacobian(&mut g, cols, s, EPSILON, TOLERANCE)?;
        check_jacobian(&mut g, bias, s, EPSILON, TOLERANCE)?;
    }
    Ok(())
}

#[test]
fn test_concat_every_axis() -> Result<(), Error> {
    for axis in 1..=3 {
        let base = [2, 1, 2, 3];
        let mut wider = base;
        wider[axis] += 1;
        let mut g = Graph::new();
        let a = g.weight_node("a", ramp(base)?);
        let b = g.weight_node("b", ramp(wider)?.scale(0.5)?);
        let c = g.weight_node("c", ramp(base)?.scale(-0.8)?);
        let cat = g.op_node("cat", Op::Concat { axis }, &[a, b, c])?;
        let s = g.op_node("s", Op::Sigmoid, &[cat])?;
        g.forward(s)?;
        let mut expected = base;
        expected[axis] = 2 * base[axis] + wider[axis];
        assert_eq!(g.data(cat)?.shape(), expected);
        for x in [a, b, c] {
            check_jacobian(&mut g, x, s, EPSILON, TOLERANCE)?;
        }
    }
    Ok(())
}

#[test]
fn test_equal_length_operands_pair_flat() -> Result<(), Error> {
    for (lhs, rhs) in [([1, 1, 2, 3], [1, 1, 3, 2]), ([1, 2, 1, 3], [1, 1, 2, 3])] {
        for op in [Op::Add, Op::Multiply] {
            let mut g = Graph::new();
            let a = g.weight_node("a", ramp(lhs)?);
            let b = g.weight_node("b", ramp(rhs)?.scale(-0.6)?);
            let y = g.op_node("y", op, &[a, b])?;
            let s = g.op_node("s", Op::Sigmoid, &[y])?;
            check_jacobian(&mut g, a, s, EPSILON, TOLERANCE)?;
            check_jacobian(&mut g, b, s, EPSILON, TOLERANCE)?;
        }
    }
    Ok(())
}

#[test]
fn test_view_both_directions() -> Result<(), Error> {
    for (from, to) in [([2, 1, 2, 3], [2, 2, 1, 3]), ([2, 2, 1, 3], [2, 1, 2, 3])] {
        let mut g = Graph::new();
        let x = g.weight_node("x", ramp(from)?);
        let v = g.op_node("v", Op::View { shape: to }, &[x])?;
        let s = g.op_node("s", Op::Sigmoid, &[v])?;
        check_jacobian(&mut g, x, s, EPSILON, TOLERANCE)?;
    }
    Ok(())
}

#[test]
fn test_log_loss_reductions() -> Result<(), Error> {
    for reduction in [Reduction::Mean, Reduction::Sum, Reduction::None] {
        let cfg = LogLossConfig {
            reduction,
            ..Default::default()
        };
        let mut g = Graph::new();
        let p = g.weight_node("p", Tensor::from_vec([3, 1, 1, 1], vec![0.3, 0.6, 0.9])?);
        let y = g.data_node("y", Tensor::from_vec([3, 1, 1, 1], vec![1.0, 0.0, 1.0])?);
        let loss = g.op_node("loss", Op::LogLoss(cfg), &[p, y])?;
        check_jacobian(&mut g, p, loss, EPSILON, TOLERANCE)?;
    }
    Ok(())
}

#[test]
fn test_conv_layer_stack() -> Result<(), Error> {
    let mut g = Graph::new();
    let x = g.weight_node("x", ramp([2, 2, 5, 5])?);
    let cfg = Conv2dConfig {
        kernel_size: (3, 3),
        padding: (1, 1),
        stride: 2,
        bias_init: InitScheme::Gaussian,
        ..Default::default()
    };
    let conv = nn::conv2d(&mut g, "conv1", x, [2, 2, 5, 5], 3, &cfg)?;
    assert_eq!(conv.output_shape, [2, 3, 3, 3]);
    let s = nn::sigmoid(&mut g, "conv1", conv.output)?;
    check_jacobian(&mut g, x, s, EPSILON, TOLERANCE)?;
    check_jacobian(&mut g, conv.weight, s, EPSILON, TOLERANCE)?;
    check_jacobian(&mut g, conv.bias, s, EPSILON, TOLERANCE)?;
    Ok(())
}

#[test]
fn test_checker_reports_mismatch() -> Result<(), Error> {
    // A node excluded from differentiation yields a wrong Jacobian on purpose.
    let mut g = Graph::new();
    let x = g.weight_node("x", Tensor::from_vec([1, 1, 1, 2], vec![0.5, 2.0])?);
    let s = g.op_node("s", Op::Sigmoid, &[x])?;
    let k = g.data_node("k", Tensor::scalar(3.0));
    let y = g.op_node("y", Op::Multiply, &[s, k])?;
    g.set_requires_grad(s, false)?;
    let result = check_jacobian(&mut g, x, y, EPSILON, TOLERANCE);
    assert!(matches!(result, Err(Error::JacobianCheckError { .. })));
    // The perturbed leaf is restored.
    assert_eq!(g.data(x)?.to_vec()?, vec![0.5, 2.0]);
    Ok(())
}
