use crate::error::{Error, Reduction};
use crate::tensor::{Elem, Tensor};

/// How a label value is recognised as the positive class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LabelMatch {
    /// `|label - 1| < eps`, for labels carried as floats.
    Tolerance(Elem),
    /// `label == 1` exactly, for integer-valued labels.
    Exact,
}

impl LabelMatch {
    pub fn is_positive(&self, label: Elem) -> bool {
        match *self {
            LabelMatch::Tolerance(eps) => (label - 1.0).abs() < eps,
            LabelMatch::Exact => label == 1.0,
        }
    }
}

impl Default for LabelMatch {
    fn default() -> Self {
        LabelMatch::Tolerance(1e-4)
    }
}

/// Configuration of a binary cross-entropy node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogLossConfig {
    pub reduction: Reduction,
    pub label_match: LabelMatch,
    /// Predictions are clamped into `[clamp, 1 - clamp]` before the logarithm.
    pub clamp: Elem,
}

impl Default for LogLossConfig {
    fn default() -> Self {
        LogLossConfig {
            reduction: Reduction::Mean,
            label_match: LabelMatch::default(),
            clamp: 1e-12,
        }
    }
}

fn check_operands(pred: &Tensor, label: &Tensor) -> Result<(), Error> {
    if pred.shape() != label.shape() {
        return Err(Error::ShapeMismatch {
            expected: pred.shape().to_vec(),
            actual: label.shape().to_vec(),
        });
    }
    let [_, c, h, w] = pred.shape();
    if (c, h, w) != (1, 1, 1) {
        return Err(Error::ShapeError(format!(
            "log-loss expects one scalar per sample (N, 1, 1, 1), got {:?}",
            pred.shape()
        )));
    }
    Ok(())
}

impl LogLossConfig {
    fn clamped(&self, p: Elem) -> Elem {
        p.max(self.clamp).min(1.0 - self.clamp)
    }

    fn scale(&self, samples: usize) -> Elem {
        match self.reduction {
            Reduction::Mean => 1.0 / samples as Elem,
            Reduction::Sum | Reduction::None => 1.0,
        }
    }

    /// `-log(p)` for positive labels, `-log(1 - p)` otherwise, reduced per
    /// `self.reduction`. `None` keeps one value per sample.
    pub fn forward(&self, pred: &Tensor, label: &Tensor) -> Result<Tensor, Error> {
        check_operands(pred, label)?;
        let losses: Vec<Elem> = pred
            .as_slice()?
            .iter()
            .zip(label.as_slice()?)
            .map(|(&p, &y)| {
                let p = self.clamped(p);
                if self.label_match.is_positive(y) {
                    -p.ln()
                } else {
                    -(1.0 - p).ln()
                }
            })
            .collect();
        let samples = losses.len();
        match self.reduction {
            Reduction::None => Tensor::from_vec(pred.shape(), losses),
            _ => Ok(Tensor::scalar(losses.iter().sum::<Elem>() * self.scale(samples))),
        }
    }

    /// Per-sample derivative with respect to the prediction, shape (N, 1, 1, 1):
    /// `-1/p` for positive labels, `1/(1 - p)` otherwise, times the reduction scale.
    pub fn jacobi(&self, pred: &Tensor, label: &Tensor) -> Result<Tensor, Error> {
        check_operands(pred, label)?;
        let scale = self.scale(pred.len());
        let grads: Vec<Elem> = pred
            .as_slice()?
            .iter()
            .zip(label.as_slice()?)
            .map(|(&p, &y)| {
                let p = self.clamped(p);
                let g = if self.label_match.is_positive(y) {
                    -1.0 / p
                } else {
                    1.0 / (1.0 - p)
                };
                g * scale
            })
            .collect();
        Tensor::from_vec(pred.shape(), grads)
    }
}
