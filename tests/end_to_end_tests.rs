// tests/end_to_end_tests.rs
use approx::assert_abs_diff_eq;
use jacobi_graph::nn::{self, Conv2dConfig, LinearConfig, MaxPool2dConfig};
use jacobi_graph::{Error, Graph, InitScheme, LogLossConfig, NodeId, Op, Sgd, Tensor};

struct LogisticModel {
    graph: Graph,
    weight: NodeId,
    bias: NodeId,
    linear: NodeId,
    prediction: NodeId,
    loss: NodeId,
}

fn logistic_model() -> Result<LogisticModel, Error> {
    let mut graph = Graph::new();
    let x = graph.data_node("input", Tensor::from_vec([1, 1, 1, 4], vec![1.0, 2.0, 3.0, 4.0])?);
    let label = graph.data_node("label", Tensor::scalar(1.0));
    let cfg = LinearConfig::new(InitScheme::Ones, InitScheme::Zeros);
    let fc = nn::linear(&mut graph, "fc", x, 4, 1, &cfg)?;
    let prediction = nn::sigmoid(&mut graph, "fc", fc.output)?;
    let loss = nn::log_loss(&mut graph, "out", prediction, label, &LogLossConfig::default())?;
    Ok(LogisticModel {
        graph,
        weight: fc.weight,
        bias: fc.bias,
        linear: fc.output,
        prediction,
        loss,
    })
}

#[test]
fn test_logistic_regression_step_reduces_loss() -> Result<(), Error> {
    let mut m = logistic_model()?;
    let g = &mut m.graph;

    g.forward(m.loss)?;
    assert_abs_diff_eq!(g.data(m.linear)?.get_flat(0)?, 10.0, epsilon = 1e-12);
    let p = g.data(m.prediction)?.get_flat(0)?;
    assert_abs_diff_eq!(p, 0.9999546021312976, epsilon = 1e-12);
    let before = g.data(m.loss)?.get_flat(0)?;
    assert_abs_diff_eq!(before, -p.ln(), epsilon = 1e-15);

    g.backward(m.weight, m.loss)?;
    g.backward(m.bias, m.loss)?;
    // dL/dw = (p - 1) * x
    let jw = g.jacobi(m.weight)?;
    assert_eq!(jw.shape(), [1, 1, 1, 4]);
    for (i, x) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
        assert_abs_diff_eq!(jw.get_flat(i)?, (p - 1.0) * x, epsilon = 1e-12);
    }
    assert_abs_diff_eq!(g.jacobi(m.bias)?.get_flat(0)?, p - 1.0, epsilon = 1e-12);

    g.update(m.weight, 1e-4)?;
    g.update(m.bias, 1e-4)?;
    g.clear_all_jacobi();
    g.forward(m.loss)?;
    let after = g.data(m.loss)?.get_flat(0)?;
    assert!(after < before, "loss did not decrease: {} -> {}", before, after);
    Ok(())
}

#[test]
fn test_sgd_training_loop_converges() -> Result<(), Error> {
    let mut g = Graph::new();
    let x = g.data_node(
        "input",
        Tensor::from_vec([4, 1, 1, 2], vec![1.0, 1.0, 2.0, 0.5, -1.0, -1.5, -2.0, -0.5])?,
    );
    let y = g.data_node("label", Tensor::from_vec([4, 1, 1, 1], vec![1.0, 1.0, 0.0, 0.0])?);
    let cfg = LinearConfig::new(InitScheme::Zeros, InitScheme::Zeros);
    let fc = nn::linear(&mut g, "fc", x, 2, 1, &cfg)?;
    let p = nn::sigmoid(&mut g, "fc", fc.output)?;
    let loss = nn::log_loss(&mut g, "out", p, y, &LogLossConfig::default())?;

    let mut sgd = Sgd::new(fc.params().to_vec(), 0.5);
    let mut losses = Vec::new();
    for _ in 0..20 {
        g.forward(loss)?;
        losses.push(g.data(loss)?.get_flat(0)?);
        sgd.step(&mut g, loss)?;
        sgd.zero_grad(&mut g);
    }
    assert_abs_diff_eq!(losses[0], std::f64::consts::LN_2, epsilon = 1e-12);
    assert!(losses.windows(2).all(|w| w[1] < w[0]));
    assert!(losses[19] < 0.1);
    Ok(())
}

#[test]
fn test_conv_pool_classifier_step() -> Result<(), Error> {
    let mut g = Graph::new();
    let data: Vec<f64> = (0..2 * 36).map(|i| ((i * 37) % 17) as f64 / 17.0).collect();
    let x = g.data_node("input", Tensor::from_vec([2, 1, 6, 6], data)?);
    let y = g.data_node("label", Tensor::from_vec([2, 1, 1, 1], vec![1.0, 0.0])?);

    let conv_cfg = Conv2dConfig {
        padding: (1, 1),
        ..Default::default()
    };
    let conv = nn::conv2d(&mut g, "conv1", x, [2, 1, 6, 6], 2, &conv_cfg)?;
    let act = nn::sigmoid(&mut g, "conv1", conv.output)?;
    let pool = nn::max_pool2d(&mut g, "pool1", act, &MaxPool2dConfig::default())?;
    // (2, 2, 3, 3) -> (2, 1, 1, 18) rows for the classifier.
    let flat = g.op_node("flatten", Op::View { shape: [2, 1, 1, 18] }, &[pool])?;
    let fc = nn::linear(&mut g, "fc", flat, 18, 1, &LinearConfig::default())?;
    let p = nn::sigmoid(&mut g, "fc", fc.output)?;
    let loss = nn::log_loss(&mut g, "out", p, y, &LogLossConfig::default())?;

    let mut params = conv.params().to_vec();
    params.extend(fc.params());
    let mut sgd = Sgd::new(params, 0.05);

    g.forward(loss)?;
    assert_eq!(g.data(pool)?.shape(), [2, 2, 3, 3]);
    let before = g.data(loss)?.get_flat(0)?;
    sgd.step(&mut g, loss)?;
    assert_eq!(g.jacobi(conv.weight)?.shape(), [1, 1, 1, 2 * 9]);
    sgd.zero_grad(&mut g);

    g.forward(loss)?;
    let after = g.data(loss)?.get_flat(0)?;
    assert!(after < before, "loss did not decrease: {} -> {}", before, after);
    Ok(())
}
