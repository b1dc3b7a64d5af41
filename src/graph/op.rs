use crate::error::Error;
use crate::graph::loss::LogLossConfig;
use crate::ops::{self, jacobian};
use crate::tensor::{Elem, Shape, Tensor};
use crate::util::tiles_into;

use std::fmt;

/// Operation carried by a non-leaf graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Sum of all parents, smaller operands tiled.
    Add,
    /// Elementwise product of exactly two parents, smaller operand tiled.
    Multiply,
    /// Batched matrix product of two parents; a batch or channel extent of 1 broadcasts.
    MatMul,
    /// Per-slice H/W swap.
    Transpose,
    Sigmoid,
    /// `sum_c(weight[c] x cols[c] + bias[c])` over parents (weight, cols, bias).
    /// The bias tiles into the `(N, C, oc, L)` product before the channel sum.
    ConvCore,
    Padding {
        padding: (usize, usize),
        fill: Elem,
    },
    Img2col {
        kernel: (usize, usize),
        stride: usize,
    },
    MaxPool2d {
        kernel: (usize, usize),
        stride: usize,
        /// Absolute winner indices from the latest forward pass.
        winners: Vec<usize>,
        input_shape: Shape,
    },
    /// Concatenation of all parents along channel (1), height (2) or width (3).
    Concat {
        axis: usize,
    },
    /// Per-batch relabeling to `shape`.
    View {
        shape: Shape,
    },
    /// Binary cross-entropy over parents (prediction, label). Graph-terminal.
    LogLoss(LogLossConfig),
}

/// A node's local derivative with respect to one parent, in the cheapest
/// form that the chain rule can consume.
#[derive(Debug, Clone)]
pub enum LocalJacobi {
    /// Output slice equals the parent slice.
    Identity,
    /// Diagonal matrix; the tensor holds the diagonal with the parent's slice layout.
    Diagonal(Tensor),
    /// Dense `(N, C, out_slice, parent_slice)` matrix.
    Dense(Tensor),
    /// The parent's Jacobian, already composed with the upstream rows.
    Chained(Tensor),
}

impl LocalJacobi {
    /// Composes this local derivative with the child's Jacobian `upstream`,
    /// yielding a Jacobian for a parent of shape `own`.
    pub fn chain(self, upstream: &Tensor, own: Shape) -> Result<Tensor, Error> {
        match self {
            LocalJacobi::Identity => jacobian::chain_diagonal(upstream, None, own),
            LocalJacobi::Diagonal(entries) => jacobian::chain_diagonal(upstream, Some(&entries), own),
            LocalJacobi::Dense(local) => jacobian::chain_dense(upstream, &local, own),
            LocalJacobi::Chained(t) => {
                let rows = upstream.shape()[2];
                let expected = [own[0], own[1], rows, own[2] * own[3]];
                if t.shape() != expected {
                    return Err(Error::ShapeMismatch {
                        expected: expected.to_vec(),
                        actual: t.shape().to_vec(),
                    });
                }
                Ok(t)
            }
        }
    }
}

/// Views `(N, C, R, M)` rows as `(N, C * R, H, W)` images.
fn rows_as_images(t: &Tensor, h: usize, w: usize) -> Result<Tensor, Error> {
    let [n, c, r, _] = t.shape();
    t.view([n, c * r, h, w])
}

/// Views `(N, C * R, H, W)` images back as `(N, C, R, H * W)` rows.
fn images_as_rows(t: &Tensor, c: usize) -> Result<Tensor, Error> {
    let [n, cr, h, w] = t.shape();
    t.view([n, c, cr / c, h * w])
}

/// Tiles both operands of a batched product to a common batch/channel extent.
/// `(N, C, oc, L)` extent of the conv core's weight x cols product.
fn conv_product_shape(weight: &Tensor, cols: &Tensor) -> Shape {
    let [wn, wc, oc, _] = weight.shape();
    let [cn, cc, _, positions] = cols.shape();
    [wn.max(cn), wc.max(cc), oc, positions]
}

fn broadcast_pair(a: &Tensor, b: &Tensor) -> Result<(Tensor, Tensor), Error> {
    let [an, ac, _, _] = a.shape();
    let [bn, bc, _, _] = b.shape();
    let (n, c) = (an.max(bn), ac.max(bc));
    let a = if (an, ac) == (n, c) { a.clone() } else { a.repeat_slices(n, c)? };
    let b = if (bn, bc) == (n, c) { b.clone() } else { b.repeat_slices(n, c)? };
    Ok((a, b))
}

impl Op {
    pub fn max_pool2d(kernel: (usize, usize), stride: usize) -> Self {
        Op::MaxPool2d {
            kernel,
            stride,
            winners: Vec::new(),
            input_shape: [0; 4],
        }
    }

    /// Loss operations may not have children.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Op::LogLoss(_))
    }

    /// Validates the number of parents.
    pub fn check_arity(&self, parents: usize) -> Result<(), Error> {
        let ok = match self {
            Op::Add | Op::Concat { .. } => parents >= 2,
            Op::Multiply => {
                if parents > 2 {
                    return Err(Error::Unsupported(format!(
                        "Multiply supports exactly two operands, got {}",
                        parents
                    )));
                }
                parents == 2
            }
            Op::MatMul | Op::LogLoss(_) => parents == 2,
            Op::ConvCore => parents == 3,
            Op::Transpose
            | Op::Sigmoid
            | Op::Padding { .. }
            | Op::Img2col { .. }
            | Op::MaxPool2d { .. }
            | Op::View { .. } => parents == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "{} cannot take {} parent(s)",
                self, parents
            )))
        }
    }

    /// Computes this operation's output from its parents' data.
    pub fn compute_forward(&mut self, inputs: &[Tensor]) -> Result<Tensor, Error> {
        self.check_arity(inputs.len())?;
        match self {
            Op::Add => {
                let mut out = inputs[0].clone();
                for x in &inputs[1..] {
                    out.add_(x)?;
                }
                Ok(out)
            }
            Op::Multiply => inputs[0].mul_elementwise(&inputs[1]),
            Op::MatMul => {
                let (a, b) = broadcast_pair(&inputs[0], &inputs[1])?;
                a.matmul(&b)
            }
            Op::Transpose => inputs[0].transposed(),
            Op::Sigmoid => inputs[0].map(|x| 1.0 / (1.0 + (-x).exp())),
            Op::ConvCore => {
                let (weight, cols) = broadcast_pair(&inputs[0], &inputs[1])?;
                let mut product = weight.matmul(&cols)?;
                let bias_shape = inputs[2].shape();
                if !tiles_into(&product.shape(), &bias_shape) {
                    return Err(Error::IncompatibleShapes {
                        op: "conv bias".to_string(),
                        shape_a: product.shape().to_vec(),
                        shape_b: bias_shape.to_vec(),
                    });
                }
                product.add_(&inputs[2])?;
                product.sum_by_dim(1)
            }
            Op::Padding { padding, fill } => ops::add_padding(&inputs[0], *padding, *fill),
            Op::Img2col { kernel, stride } => ops::img2col(&inputs[0], *kernel, *stride),
            Op::MaxPool2d {
                kernel,
                stride,
                winners,
                input_shape,
            } => {
                let (out, win) = ops::max_pool2d(&inputs[0], *kernel, *stride)?;
                *winners = win;
                *input_shape = inputs[0].shape();
                Ok(out)
            }
            Op::Concat { axis } => {
                let mut out = inputs[0].clone();
                for x in &inputs[1..] {
                    out = out.concat(x, *axis)?;
                }
                Ok(out)
            }
            Op::View { shape } => {
                if shape[0] != inputs[0].shape()[0] {
                    return Err(Error::Unsupported(format!(
                        "view may not change the batch extent ({:?} -> {:?})",
                        inputs[0].shape(),
                        shape
                    )));
                }
                inputs[0].view(*shape)
            }
            Op::LogLoss(cfg) => cfg.forward(&inputs[0], &inputs[1]),
        }
    }

    /// Local Jacobian of this operation's output with respect to parent `slot`.
    ///
    /// `inputs` are the parents' data, `output` this node's data and `upstream`
    /// this node's own Jacobian (consumed directly by the structural ops).
    pub fn compute_jacobi(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        upstream: &Tensor,
        slot: usize,
    ) -> Result<LocalJacobi, Error> {
        self.check_arity(inputs.len())?;
        let parent = inputs.get(slot).ok_or(Error::IndexOutOfBounds {
            index: slot,
            size: inputs.len(),
        })?;
        let out_shape = output.shape();
        debug_println!("jacobi of {} wrt parent {} {:?}", self, slot, parent.shape());
        match self {
            Op::Add => {
                if parent.shape() == out_shape {
                    Ok(LocalJacobi::Identity)
                } else if parent.len() == output.len() {
                    Ok(LocalJacobi::Chained(jacobian::flat_jacobi(
                        upstream,
                        out_shape,
                        parent.shape(),
                        None,
                    )?))
                } else {
                    Ok(LocalJacobi::Dense(jacobian::broadcast_jacobi(
                        out_shape,
                        parent.shape(),
                        None,
                    )?))
                }
            }
            Op::Multiply => {
                let other = &inputs[1 - slot];
                if parent.shape() != out_shape && parent.len() == output.len() {
                    return Ok(LocalJacobi::Chained(jacobian::flat_jacobi(
                        upstream,
                        out_shape,
                        parent.shape(),
                        Some(other),
                    )?));
                }
                // Equal-length operands pair up in buffer order.
                let other = if other.len() == output.len() {
                    other.view(out_shape)?
                } else {
                    other.tile_to(out_shape)?
                };
                if parent.shape() == out_shape {
                    Ok(LocalJacobi::Diagonal(other))
                } else {
                    Ok(LocalJacobi::Dense(jacobian::broadcast_jacobi(
                        out_shape,
                        parent.shape(),
                        Some(&other),
                    )?))
                }
            }
            Op::MatMul => {
                let (a, b) = (&inputs[0], &inputs[1]);
                if slot == 0 {
                    let m = a.shape()[2];
                    Ok(LocalJacobi::Dense(jacobian::diagonal_blocks(&b.transposed()?, m)?))
                } else {
                    let p = b.shape()[3];
                    Ok(LocalJacobi::Dense(jacobian::special_jacobi(a, p)?))
                }
            }
            Op::Transpose => {
                let [_, _, h, w] = parent.shape();
                Ok(LocalJacobi::Dense(jacobian::transpose_jacobi(h, w)?))
            }
            Op::Sigmoid => Ok(LocalJacobi::Diagonal(output.map(|s| s * (1.0 - s))?)),
            Op::ConvCore => match slot {
                0 => {
                    let oc = inputs[0].shape()[2];
                    Ok(LocalJacobi::Dense(jacobian::diagonal_blocks(
                        &inputs[1].transposed()?,
                        oc,
                    )?))
                }
                1 => {
                    let positions = inputs[1].shape()[3];
                    Ok(LocalJacobi::Dense(jacobian::special_jacobi(
                        &inputs[0],
                        positions,
                    )?))
                }
                // Each channel's bias tile is summed into the output.
                _ => Ok(LocalJacobi::Dense(jacobian::broadcast_jacobi(
                    conv_product_shape(&inputs[0], &inputs[1]),
                    parent.shape(),
                    None,
                )?)),
            },
            Op::Padding { padding, .. } => {
                if *padding == (0, 0) {
                    return Ok(LocalJacobi::Identity);
                }
                let [_, c, h, w] = parent.shape();
                let (ph, pw) = *padding;
                let images = rows_as_images(upstream, h + 2 * ph, w + 2 * pw)?;
                let cropped = ops::sub_padding(&images, *padding)?;
                Ok(LocalJacobi::Chained(images_as_rows(&cropped, c)?))
            }
            Op::Img2col { kernel, stride } => {
                let [n, c, h, w] = parent.shape();
                let [_, _, taps, positions] = out_shape;
                let rows = upstream.shape()[2];
                let cols = rows_as_images(upstream, taps, positions)?;
                let images = ops::col2img(&cols, *kernel, *stride, [n, c * rows, h, w])?;
                Ok(LocalJacobi::Chained(images_as_rows(&images, c)?))
            }
            Op::MaxPool2d {
                winners,
                input_shape,
                ..
            } => {
                if winners.is_empty() || *input_shape != parent.shape() {
                    return Err(Error::InvalidOperation(
                        "max-pool backward requires winner indices from a forward pass".to_string(),
                    ));
                }
                Ok(LocalJacobi::Chained(ops::scatter_to_winners(
                    upstream,
                    winners,
                    *input_shape,
                )?))
            }
            Op::Concat { axis } => {
                let axis = *axis;
                if !(1..=3).contains(&axis) {
                    return Err(Error::InvalidAxis(axis as isize));
                }
                let offset: usize = inputs[..slot].iter().map(|t| t.shape()[axis]).sum();
                let range = (offset as isize, (offset + parent.shape()[axis]) as isize);
                let [un, _, rows, cols] = upstream.shape();
                if axis == 1 {
                    let block = upstream.slice(&[
                        (0, un as isize),
                        range,
                        (0, rows as isize),
                        (0, cols as isize),
                    ])?;
                    return Ok(LocalJacobi::Chained(block));
                }
                let [_, c, _, _] = parent.shape();
                let [_, _, oh, ow] = out_shape;
                let images = rows_as_images(upstream, oh, ow)?;
                let [_, planes, _, _] = images.shape();
                let mut ranges = [
                    (0, un as isize),
                    (0, planes as isize),
                    (0, oh as isize),
                    (0, ow as isize),
                ];
                ranges[axis] = range;
                let block = images.slice(&ranges)?;
                Ok(LocalJacobi::Chained(images_as_rows(&block, c)?))
            }
            Op::View { .. } => Ok(LocalJacobi::Dense(jacobian::view_jacobi(
                out_shape,
                parent.shape(),
            )?)),
            Op::LogLoss(cfg) => {
                if slot != 0 {
                    return Err(Error::InvalidOperation(
                        "log-loss is only differentiable with respect to the prediction".to_string(),
                    ));
                }
                Ok(LocalJacobi::Dense(cfg.jacobi(&inputs[0], &inputs[1])?))
            }
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Op::Add => write!(f, "Add"),
            Op::Multiply => write!(f, "Multiply"),
            Op::MatMul => write!(f, "MatMul"),
            Op::Transpose => write!(f, "Transpose"),
            Op::Sigmoid => write!(f, "Sigmoid"),
            Op::ConvCore => write!(f, "ConvCore"),
            Op::Padding { padding, fill } => write!(f, "Padding(padding={:?}, fill={})", padding, fill),
            Op::Img2col { kernel, stride } => write!(f, "Img2col(kernel={:?}, stride={})", kernel, stride),
            Op::MaxPool2d { kernel, stride, .. } => {
                write!(f, "MaxPool2d(kernel={:?}, stride={})", kernel, stride)
            }
            Op::Concat { axis } => write!(f, "Concat(axis={})", axis),
            Op::View { shape } => write!(f, "View(shape={:?})", shape),
            Op::LogLoss(cfg) => write!(f, "LogLoss(reduction={:?})", cfg.reduction),
        }
    }
}
