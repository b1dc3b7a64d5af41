//! Layer builders that wire groups of nodes into a [`Graph`].
//!
//! Each builder names its nodes `<layer>_<PART>` and returns the handles it
//! created, so callers can reach parameters for updates.

use crate::error::Error;
use crate::graph::{Graph, LogLossConfig, NodeId, Op};
use crate::init::InitScheme;
use crate::ops::output_extent;
use crate::tensor::{Elem, Shape};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearConfig {
    pub weight_init: InitScheme,
    pub bias_init: InitScheme,
}

impl Default for LinearConfig {
    fn default() -> Self {
        LinearConfig {
            weight_init: InitScheme::Gaussian,
            bias_init: InitScheme::Zeros,
        }
    }
}

impl LinearConfig {
    pub fn new(weight_init: InitScheme, bias_init: InitScheme) -> Self {
        LinearConfig {
            weight_init,
            bias_init,
        }
    }
}

/// Handles of a fully connected layer `y = x W^T + b`.
#[derive(Debug, Clone, Copy)]
pub struct Linear {
    /// Shape (1, 1, out, in).
    pub weight: NodeId,
    /// Shape (1, 1, 1, out).
    pub bias: NodeId,
    pub output: NodeId,
}

impl Linear {
    pub fn params(&self) -> [NodeId; 2] {
        [self.weight, self.bias]
    }
}

/// Fully connected layer over an input of shape (N, 1, 1, in_features).
/// The weight is broadcast across the batch.
pub fn linear(
    graph: &mut Graph,
    name: &str,
    input: NodeId,
    in_features: usize,
    out_features: usize,
    cfg: &LinearConfig,
) -> Result<Linear, Error> {
    debug_println!("linear '{}': {} -> {}", name, in_features, out_features);
    let weight = graph.init_weight(
        format!("{}_WEIGHT", name),
        [1, 1, out_features, in_features],
        cfg.weight_init,
    )?;
    let bias = graph.init_weight(format!("{}_BIAS", name), [1, 1, 1, out_features], cfg.bias_init)?;
    let weight_t = graph.op_node(format!("{}_WEIGHT_T", name), Op::Transpose, &[weight])?;
    let product = graph.op_node(format!("{}_MUL", name), Op::MatMul, &[input, weight_t])?;
    let output = graph.op_node(format!("{}_ADD", name), Op::Add, &[product, bias])?;
    Ok(Linear {
        weight,
        bias,
        output,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conv2dConfig {
    pub kernel_size: (usize, usize),
    pub padding: (usize, usize),
    pub stride: usize,
    pub padding_fill: Elem,
    pub weight_init: InitScheme,
    pub bias_init: InitScheme,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Conv2dConfig {
            kernel_size: (3, 3),
            padding: (0, 0),
            stride: 1,
            padding_fill: 0.0,
            weight_init: InitScheme::Gaussian,
            bias_init: InitScheme::Zeros,
        }
    }
}

/// Handles of a convolution layer.
#[derive(Debug, Clone, Copy)]
pub struct Conv2d {
    /// Shape (1, C_in, C_out, kh * kw).
    pub weight: NodeId,
    /// Shape (1, 1, C_out, 1), tiled over input channels and output positions
    /// before the channel sum.
    pub bias: NodeId,
    pub output: NodeId,
    /// (N, C_out, out_h, out_w).
    pub output_shape: Shape,
}

impl Conv2d {
    pub fn params(&self) -> [NodeId; 2] {
        [self.weight, self.bias]
    }
}

/// Convolution as padding, img2col, a weighted channel sum and a relabel to
/// (N, C_out, out_h, out_w). `input_shape` is the (N, C, H, W) of `input`.
pub fn conv2d(
    graph: &mut Graph,
    name: &str,
    input: NodeId,
    input_shape: Shape,
    out_channels: usize,
    cfg: &Conv2dConfig,
) -> Result<Conv2d, Error> {
    let [n, c, h, w] = input_shape;
    let (kh, kw) = cfg.kernel_size;
    let (ph, pw) = cfg.padding;
    let out_h = output_extent(h + 2 * ph, kh, cfg.stride)?;
    let out_w = output_extent(w + 2 * pw, kw, cfg.stride)?;
    debug_println!(
        "conv2d '{}': {:?} -> [{}, {}, {}, {}]",
        name,
        input_shape,
        n,
        out_channels,
        out_h,
        out_w
    );

    let padded = graph.op_node(
        format!("{}_PADDING", name),
        Op::Padding {
            padding: cfg.padding,
            fill: cfg.padding_fill,
        },
        &[input],
    )?;
    let cols = graph.op_node(
        format!("{}_IMG2COL", name),
        Op::Img2col {
            kernel: cfg.kernel_size,
            stride: cfg.stride,
        },
        &[padded],
    )?;
    let weight = graph.init_weight(
        format!("{}_WEIGHT", name),
        [1, c, out_channels, kh * kw],
        cfg.weight_init,
    )?;
    let bias = graph.init_weight(format!("{}_BIAS", name), [1, 1, out_channels, 1], cfg.bias_init)?;
    let core = graph.op_node(format!("{}_CORE", name), Op::ConvCore, &[weight, cols, bias])?;
    let output_shape = [n, out_channels, out_h, out_w];
    let output = graph.op_node(
        format!("{}_VIEW", name),
        Op::View {
            shape: output_shape,
        },
        &[core],
    )?;
    Ok(Conv2d {
        weight,
        bias,
        output,
        output_shape,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxPool2dConfig {
    pub kernel_size: (usize, usize),
    /// Defaults to the kernel extent when the kernel is square.
    pub stride: Option<usize>,
}

impl Default for MaxPool2dConfig {
    fn default() -> Self {
        MaxPool2dConfig {
            kernel_size: (2, 2),
            stride: None,
        }
    }
}

impl MaxPool2dConfig {
    /// Effective stride. A missing (or zero) stride with a non-square kernel is unsupported.
    pub fn resolved_stride(&self) -> Result<usize, Error> {
        let (kh, kw) = self.kernel_size;
        match self.stride {
            Some(s) if s > 0 => Ok(s),
            _ if kh == kw => Ok(kh),
            _ => Err(Error::Unsupported(format!(
                "max-pool kernel {:?} is not square; an explicit stride is required",
                self.kernel_size
            ))),
        }
    }
}

pub fn max_pool2d(
    graph: &mut Graph,
    name: &str,
    input: NodeId,
    cfg: &MaxPool2dConfig,
) -> Result<NodeId, Error> {
    let stride = cfg.resolved_stride()?;
    graph.op_node(
        format!("{}_POOL", name),
        Op::max_pool2d(cfg.kernel_size, stride),
        &[input],
    )
}

pub fn sigmoid(graph: &mut Graph, name: &str, input: NodeId) -> Result<NodeId, Error> {
    graph.op_node(format!("{}_SIGMOID", name), Op::Sigmoid, &[input])
}

/// Terminal binary cross-entropy node over `(prediction, label)`.
pub fn log_loss(
    graph: &mut Graph,
    name: &str,
    prediction: NodeId,
    label: NodeId,
    cfg: &LogLossConfig,
) -> Result<NodeId, Error> {
    graph.op_node(format!("{}_LOGLOSS", name), Op::LogLoss(*cfg), &[prediction, label])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tensor;

    #[test]
    fn test_max_pool_stride_defaults() {
        assert_eq!(MaxPool2dConfig::default().resolved_stride().unwrap(), 2);
        let rect = MaxPool2dConfig {
            kernel_size: (2, 3),
            stride: None,
        };
        assert!(matches!(rect.resolved_stride(), Err(Error::Unsupported(_))));
        let explicit = MaxPool2dConfig {
            kernel_size: (2, 3),
            stride: Some(1),
        };
        assert_eq!(explicit.resolved_stride().unwrap(), 1);
    }

    #[test]
    fn test_conv2d_output_shape() {
        let mut g = Graph::new();
        let x = g.data_node("x", Tensor::ones([2, 3, 6, 6]).unwrap());
        let cfg = Conv2dConfig {
            padding: (1, 1),
            stride: 2,
            ..Default::default()
        };
        let conv = conv2d(&mut g, "conv1", x, [2, 3, 6, 6], 4, &cfg).unwrap();
        assert_eq!(conv.output_shape, [2, 4, 3, 3]);
        g.forward(conv.output).unwrap();
        assert_eq!(g.data(conv.output).unwrap().shape(), [2, 4, 3, 3]);
        assert_eq!(g.node(conv.weight).unwrap().name(), "conv1_WEIGHT");
    }
}
