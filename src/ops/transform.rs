//! Shape-transform kernels: padding, image/column rearrangement and max pooling.
//!
//! These take extra geometry (padding, kernel, stride) that is not part of a
//! tensor's own shape, so they are free functions rather than `Tensor` methods.

use crate::error::Error;
use crate::tensor::{Elem, Shape, Tensor};
use crate::util::numel;

use rayon::prelude::*;

/// Number of kernel placements along one axis: `floor((size - kernel) / stride) + 1`.
pub fn output_extent(size: usize, kernel: usize, stride: usize) -> Result<usize, Error> {
    if stride == 0 {
        return Err(Error::Unsupported("stride must be >= 1".to_string()));
    }
    if kernel == 0 || kernel > size {
        return Err(Error::ShapeError(format!(
            "kernel extent {} does not fit input extent {}",
            kernel, size
        )));
    }
    Ok((size - kernel) / stride + 1)
}

/// Grows H and W by `pad` on each side, filling the border with `fill`.
/// Zero padding returns an alias of the input.
pub fn add_padding(t: &Tensor, pad: (usize, usize), fill: Elem) -> Result<Tensor, Error> {
    let src = t.as_slice()?;
    if pad == (0, 0) {
        return Ok(t.clone());
    }
    let [n, c, h, w] = t.shape();
    let (ph, pw) = pad;
    let (oh, ow) = (h + 2 * ph, w + 2 * pw);
    let mut data = vec![fill; n * c * oh * ow];
    data.par_chunks_mut(oh * ow)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let base = slice * h * w;
            for y in 0..h {
                let dst = (y + ph) * ow + pw;
                chunk[dst..dst + w].copy_from_slice(&src[base + y * w..base + (y + 1) * w]);
            }
        });
    Tensor::from_vec([n, c, oh, ow], data)
}

/// Inverse of [`add_padding`]: drops `pad` rows/columns from each side.
pub fn sub_padding(t: &Tensor, pad: (usize, usize)) -> Result<Tensor, Error> {
    let src = t.as_slice()?;
    if pad == (0, 0) {
        return Ok(t.clone());
    }
    let [n, c, h, w] = t.shape();
    let (ph, pw) = pad;
    if h <= 2 * ph || w <= 2 * pw {
        return Err(Error::ShapeError(format!(
            "cannot remove padding {:?} from extent {}x{}",
            pad, h, w
        )));
    }
    let (oh, ow) = (h - 2 * ph, w - 2 * pw);
    let mut data = vec![0.0; n * c * oh * ow];
    data.par_chunks_mut(oh * ow)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let base = slice * h * w;
            for y in 0..oh {
                let src_row = base + (y + ph) * w + pw;
                chunk[y * ow..(y + 1) * ow].copy_from_slice(&src[src_row..src_row + ow]);
            }
        });
    Tensor::from_vec([n, c, oh, ow], data)
}

/// Lays every kernel-sized receptive field out as one column.
///
/// Output shape is `(N, C, kh * kw, out_h * out_w)`; row `ki * kw + kj` holds the
/// kernel tap `(ki, kj)` for every output position.
pub fn img2col(t: &Tensor, kernel: (usize, usize), stride: usize) -> Result<Tensor, Error> {
    let src = t.as_slice()?;
    let [n, c, h, w] = t.shape();
    let (kh, kw) = kernel;
    let out_h = output_extent(h, kh, stride)?;
    let out_w = output_extent(w, kw, stride)?;
    let positions = out_h * out_w;
    let mut data = vec![0.0; n * c * kh * kw * positions];
    data.par_chunks_mut(kh * kw * positions)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let base = slice * h * w;
            for ki in 0..kh {
                for kj in 0..kw {
                    let row = (ki * kw + kj) * positions;
                    for y in 0..out_h {
                        for x in 0..out_w {
                            chunk[row + y * out_w + x] =
                                src[base + (y * stride + ki) * w + x * stride + kj];
                        }
                    }
                }
            }
        });
    Tensor::from_vec([n, c, kh * kw, positions], data)
}

/// Adjoint of [`img2col`]: scatters columns back into `target` geometry,
/// summing where receptive fields overlap.
///
/// Positions that no receptive field covers (the trailing rows/columns left
/// over when the stride does not tile the target) stay zero. Slices run in
/// parallel; accumulation within a slice is sequential.
pub fn col2img(
    cols: &Tensor,
    kernel: (usize, usize),
    stride: usize,
    target: Shape,
) -> Result<Tensor, Error> {
    let src = cols.as_slice()?;
    let [n, c, h, w] = target;
    let (kh, kw) = kernel;
    let out_h = output_extent(h, kh, stride)?;
    let out_w = output_extent(w, kw, stride)?;
    let positions = out_h * out_w;
    let expected = [n, c, kh * kw, positions];
    if cols.shape() != expected {
        return Err(Error::ShapeMismatch {
            expected: expected.to_vec(),
            actual: cols.shape().to_vec(),
        });
    }
    if (h - kh) % stride != 0 || (w - kw) % stride != 0 {
        debug_println!(
            "col2img: stride {} leaves uncovered border in {}x{}, truncating",
            stride,
            h,
            w
        );
    }
    let mut data = vec![0.0; numel(&target)];
    data.par_chunks_mut(h * w)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let base = slice * kh * kw * positions;
            for ki in 0..kh {
                for kj in 0..kw {
                    let row = base + (ki * kw + kj) * positions;
                    for y in 0..out_h {
                        for x in 0..out_w {
                            chunk[(y * stride + ki) * w + x * stride + kj] +=
                                src[row + y * out_w + x];
                        }
                    }
                }
            }
        });
    Tensor::from_vec(target, data)
}

/// 2D max pooling per (batch, channel) slice.
///
/// Returns the pooled tensor and, for every output element, the absolute flat
/// index into `t`'s buffer of the winning element. Ties keep the first
/// maximum in row-major order.
pub fn max_pool2d(
    t: &Tensor,
    kernel: (usize, usize),
    stride: usize,
) -> Result<(Tensor, Vec<usize>), Error> {
    let src = t.as_slice()?;
    let [n, c, h, w] = t.shape();
    let (kh, kw) = kernel;
    let out_h = output_extent(h, kh, stride)?;
    let out_w = output_extent(w, kw, stride)?;
    let positions = out_h * out_w;
    let mut data = vec![0.0; n * c * positions];
    let mut winners = vec![0usize; n * c * positions];
    data.par_chunks_mut(positions)
        .zip(winners.par_chunks_mut(positions))
        .enumerate()
        .for_each(|(slice, (out, win))| {
            let base = slice * h * w;
            for y in 0..out_h {
                for x in 0..out_w {
                    let mut best = base + (y * stride) * w + x * stride;
                    for ki in 0..kh {
                        for kj in 0..kw {
                            let idx = base + (y * stride + ki) * w + x * stride + kj;
                            if src[idx] > src[best] {
                                best = idx;
                            }
                        }
                    }
                    out[y * out_w + x] = src[best];
                    win[y * out_w + x] = best;
                }
            }
        });
    Ok((Tensor::from_vec([n, c, out_h, out_w], data)?, winners))
}

/// Routes rows of a pooled-output Jacobian back onto the recorded winners.
///
/// `upstream` has shape `(N, C, R, out_h * out_w)`; the result has shape
/// `(N, C, R, H * W)` for the pooled input `input_shape`.
pub fn scatter_to_winners(
    upstream: &Tensor,
    winners: &[usize],
    input_shape: Shape,
) -> Result<Tensor, Error> {
    let src = upstream.as_slice()?;
    let [n, c, rows, positions] = upstream.shape();
    let [in_n, in_c, h, w] = input_shape;
    if in_n != n || in_c != c || winners.len() != n * c * positions {
        return Err(Error::ShapeMismatch {
            expected: vec![n, c, winners.len() / (n * c).max(1)],
            actual: vec![in_n, in_c, positions],
        });
    }
    let slice_in = h * w;
    if winners
        .iter()
        .enumerate()
        .any(|(i, &idx)| idx / slice_in != i / positions)
    {
        return Err(Error::InvalidOperation(
            "winner index falls outside its pooling slice".to_string(),
        ));
    }
    let mut data = vec![0.0; n * c * rows * slice_in];
    data.par_chunks_mut(rows * slice_in)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let slice_winners = &winners[slice * positions..(slice + 1) * positions];
            for r in 0..rows {
                let up = slice * rows * positions + r * positions;
                for (o, &abs) in slice_winners.iter().enumerate() {
                    chunk[r * slice_in + abs - slice * slice_in] += src[up + o];
                }
            }
        });
    Tensor::from_vec([n, c, rows, slice_in], data)
}
