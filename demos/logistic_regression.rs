//! Logistic regression on two synthetic Gaussian blobs.
//!
//! Builds `linear -> sigmoid -> log_loss` as a graph and trains it with SGD.
//! Logs the training loss every few epochs.

use jacobi_graph::nn::{self, LinearConfig};
use jacobi_graph::{Error, Graph, InitScheme, LogLossConfig, Sgd, Tensor};
use rand_distr::{Distribution, Normal};

const SAMPLES_PER_CLASS: usize = 64;
const NUM_EPOCHS: usize = 200;
const LEARNING_RATE: f64 = 0.5;
const LOG_EVERY: usize = 20;

fn main() -> Result<(), Error> {
    // Generate synthetic data: class 1 around (1, 1), class 0 around (-1, -1)
    let mut rng = rand::rng();
    let noise = Normal::new(0.0, 0.6).map_err(|_| Error::InitializationError)?;
    let samples = 2 * SAMPLES_PER_CLASS;
    let mut features = Vec::with_capacity(samples * 2);
    let mut labels = Vec::with_capacity(samples);
    for i in 0..samples {
        let label = if i % 2 == 0 { 1.0 } else { 0.0 };
        let centre = if label == 1.0 { 1.0 } else { -1.0 };
        features.push(centre + noise.sample(&mut rng));
        features.push(centre + noise.sample(&mut rng));
        labels.push(label);
    }

    let mut g = Graph::new();
    let x = g.data_node("input", Tensor::from_vec([samples, 1, 1, 2], features)?);
    let y = g.data_node("label", Tensor::from_vec([samples, 1, 1, 1], labels.clone())?);

    let cfg = LinearConfig::new(InitScheme::Xavier, InitScheme::Zeros);
    let fc = nn::linear(&mut g, "fc", x, 2, 1, &cfg)?;
    let prediction = nn::sigmoid(&mut g, "fc", fc.output)?;
    let loss = nn::log_loss(&mut g, "out", prediction, y, &LogLossConfig::default())?;

    let mut optimizer = Sgd::new(fc.params().to_vec(), LEARNING_RATE);

    println!("Training logistic regression on {} samples...", samples);
    for epoch in 0..NUM_EPOCHS {
        g.forward(loss)?;
        let value = g.data(loss)?.get_flat(0)?;
        optimizer.step(&mut g, loss)?;
        optimizer.zero_grad(&mut g);
        if epoch % LOG_EVERY == 0 || epoch == NUM_EPOCHS - 1 {
            println!("Epoch {:4}: loss = {:.6}", epoch, value);
        }
    }

    g.forward(loss)?;
    let probs = g.data(prediction)?.to_vec()?;
    let correct = probs
        .iter()
        .zip(&labels)
        .filter(|(&p, &l)| (p >= 0.5) == (l == 1.0))
        .count();
    println!(
        "Final loss = {:.6}, accuracy = {:.1}%",
        g.data(loss)?.get_flat(0)?,
        100.0 * correct as f64 / samples as f64
    );
    println!("Weights: {:?}", g.data(fc.weight)?.to_vec()?);
    println!("Bias: {:?}", g.data(fc.bias)?.to_vec()?);
    Ok(())
}
