use crate::error::Error;
use crate::tensor::{Elem, Shape, Tensor};
use crate::util::{numel, resolve_bound, tile_shapes, tiles_into};

use ndarray::linalg::general_mat_mul;
use ndarray::{s, ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4, Axis};
use rayon::prelude::*;

fn nd_err(e: ndarray::ShapeError) -> Error {
    Error::ShapeError(e.to_string())
}

/// Flat offset of `(h, w)` inside slice `(n, c)` of a tensor with `shape`,
/// where the source shape may be smaller than the iteration shape and is tiled.
#[inline]
fn tiled_offset(shape: &Shape, n: usize, c: usize, h: usize, w: usize) -> usize {
    let [sn, sc, sh, sw] = *shape;
    (((n % sn) * sc + (c % sc)) * sh + (h % sh)) * sw + (w % sw)
}

/// Applies `op` elementwise with tiled broadcasting and returns a fresh tensor.
///
/// Equal-length operands are combined flat. Otherwise the smaller operand is
/// tiled across the larger one, one task per (batch, channel) slice.
pub fn binary_tiled<F>(op_name: &str, a: &Tensor, b: &Tensor, op: F) -> Result<Tensor, Error>
where
    F: Fn(Elem, Elem) -> Elem + Sync + Send,
{
    let lhs = a.as_slice()?;
    let rhs = b.as_slice()?;
    let (a_shape, b_shape) = (a.shape(), b.shape());
    let (out_shape, _) = tile_shapes(op_name, &a_shape, &b_shape)?;

    if lhs.len() == rhs.len() {
        let data: Vec<Elem> = lhs
            .par_iter()
            .zip(rhs.par_iter())
            .map(|(&x, &y)| op(x, y))
            .collect();
        return Tensor::from_vec(out_shape, data);
    }

    debug_println!("{}: tiling {:?} and {:?} to {:?}", op_name, a_shape, b_shape, out_shape);
    let [_, c_out, h_out, w_out] = out_shape;
    let mut data = vec![0.0; numel(&out_shape)];
    data.par_chunks_mut(h_out * w_out)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let (n, c) = (slice / c_out, slice % c_out);
            for h in 0..h_out {
                for w in 0..w_out {
                    let x = lhs[tiled_offset(&a_shape, n, c, h, w)];
                    let y = rhs[tiled_offset(&b_shape, n, c, h, w)];
                    chunk[h * w_out + w] = op(x, y);
                }
            }
        });
    Tensor::from_vec(out_shape, data)
}

/// In-place variant of [`binary_tiled`]. Writes into `a`'s own (unshared) buffer
/// when `a` is the larger operand and reallocates otherwise.
pub fn binary_tiled_inplace<F>(op_name: &str, a: &mut Tensor, b: &Tensor, op: F) -> Result<(), Error>
where
    F: Fn(Elem, Elem) -> Elem + Sync + Send,
{
    let (a_shape, b_shape) = (a.shape(), b.shape());
    let (_, lhs_is_big) = tile_shapes(op_name, &a_shape, &b_shape)?;
    if !lhs_is_big {
        *a = binary_tiled(op_name, a, b, op)?;
        return Ok(());
    }
    let rhs = b.as_slice()?;
    let [_, c_out, h_out, w_out] = a_shape;
    let lhs = a.as_mut_slice()?;
    if lhs.len() == rhs.len() {
        lhs.par_iter_mut()
            .zip(rhs.par_iter())
            .for_each(|(x, &y)| *x = op(*x, y));
        return Ok(());
    }
    lhs.par_chunks_mut(h_out * w_out)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let (n, c) = (slice / c_out, slice % c_out);
            for h in 0..h_out {
                for w in 0..w_out {
                    let idx = h * w_out + w;
                    chunk[idx] = op(chunk[idx], rhs[tiled_offset(&b_shape, n, c, h, w)]);
                }
            }
        });
    Ok(())
}

/// Materializes the tiling of `t` over `shape`.
pub fn tile_to(t: &Tensor, shape: Shape) -> Result<Tensor, Error> {
    let src = t.as_slice()?;
    let src_shape = t.shape();
    if src_shape == shape {
        return Ok(t.clone());
    }
    if !tiles_into(&shape, &src_shape) {
        return Err(Error::IncompatibleShapes {
            op: "tile_to".to_string(),
            shape_a: src_shape.to_vec(),
            shape_b: shape.to_vec(),
        });
    }
    let [_, c_out, h_out, w_out] = shape;
    let mut data = vec![0.0; numel(&shape)];
    data.par_chunks_mut(h_out * w_out)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let (n, c) = (slice / c_out, slice % c_out);
            for h in 0..h_out {
                for w in 0..w_out {
                    chunk[h * w_out + w] = src[tiled_offset(&src_shape, n, c, h, w)];
                }
            }
        });
    Tensor::from_vec(shape, data)
}

/// Batched matrix multiply: every (batch, channel) slice of `a` (H x W) times the
/// matching slice of `b` (W x W'), one task per slice.
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor, Error> {
    let [an, ac, m, k] = a.shape();
    let [bn, bc, bk, p] = b.shape();
    if an != bn || ac != bc || k != bk {
        return Err(Error::IncompatibleShapes {
            op: "matmul".to_string(),
            shape_a: a.shape().to_vec(),
            shape_b: b.shape().to_vec(),
        });
    }
    let lhs = a.as_slice()?;
    let rhs = b.as_slice()?;
    let mut data = vec![0.0; an * ac * m * p];
    data.par_chunks_mut(m * p)
        .enumerate()
        .try_for_each(|(slice, chunk)| -> Result<(), Error> {
            let a_view = ArrayView2::from_shape((m, k), &lhs[slice * m * k..(slice + 1) * m * k])
                .map_err(nd_err)?;
            let b_view = ArrayView2::from_shape((k, p), &rhs[slice * k * p..(slice + 1) * k * p])
                .map_err(nd_err)?;
            let mut out = ArrayViewMut2::from_shape((m, p), chunk).map_err(nd_err)?;
            general_mat_mul(1.0, &a_view, &b_view, 0.0, &mut out);
            Ok(())
        })?;
    Tensor::from_vec([an, ac, m, p], data)
}

/// Transposes one row-major `rows x cols` matrix in place by following
/// permutation cycles. Element `i` moves to `(i * rows) % (len - 1)`.
fn transpose_cycles(buf: &mut [Elem], rows: usize, cols: usize) {
    if rows <= 1 || cols <= 1 {
        return;
    }
    let last = rows * cols - 1;
    for start in 1..last {
        // Rotate each cycle once, from its smallest index.
        let mut next = (start * rows) % last;
        while next > start {
            next = (next * rows) % last;
        }
        if next != start {
            continue;
        }
        let mut carried = buf[start];
        let mut pos = (start * rows) % last;
        loop {
            std::mem::swap(&mut buf[pos], &mut carried);
            if pos == start {
                break;
            }
            pos = (pos * rows) % last;
        }
    }
}

/// Swaps H and W of every slice in place, one task per slice.
pub fn transpose_inplace(t: &mut Tensor) -> Result<(), Error> {
    let [n, c, h, w] = t.shape();
    let buf = t.as_mut_slice()?;
    buf.par_chunks_mut(h * w)
        .for_each(|chunk| transpose_cycles(chunk, h, w));
    t.relabel([n, c, w, h])
}

fn resolve_ranges(shape: &Shape, ranges: &[(isize, isize); 4]) -> Result<[(usize, usize); 4], Error> {
    let mut out = [(0, 0); 4];
    for axis in 0..4 {
        let (start, end) = ranges[axis];
        let size = shape[axis];
        let err = Error::SliceOutOfRange {
            axis,
            start,
            end,
            size,
        };
        let lo = resolve_bound(start, size).ok_or_else(|| err.clone())?;
        let hi = resolve_bound(end, size).ok_or_else(|| err.clone())?;
        if lo >= hi {
            return Err(err);
        }
        out[axis] = (lo, hi);
    }
    Ok(out)
}

/// Copies the half-open sub-block described by `ranges` into a fresh tensor.
pub fn slice(t: &Tensor, ranges: &[(isize, isize); 4]) -> Result<Tensor, Error> {
    let shape = t.shape();
    let r = resolve_ranges(&shape, ranges)?;
    let view = ArrayView4::from_shape(shape, t.as_slice()?).map_err(nd_err)?;
    let sub = view.slice(s![r[0].0..r[0].1, r[1].0..r[1].1, r[2].0..r[2].1, r[3].0..r[3].1]);
    let out_shape = [r[0].1 - r[0].0, r[1].1 - r[1].0, r[2].1 - r[2].0, r[3].1 - r[3].0];
    Tensor::from_vec(out_shape, sub.iter().copied().collect())
}

/// Writes `src` into the sub-block of `t` described by `ranges`.
pub fn assign_slice(t: &mut Tensor, ranges: &[(isize, isize); 4], src: &Tensor) -> Result<(), Error> {
    let shape = t.shape();
    let r = resolve_ranges(&shape, ranges)?;
    let extent = [r[0].1 - r[0].0, r[1].1 - r[1].0, r[2].1 - r[2].0, r[3].1 - r[3].0];
    if extent != src.shape() {
        return Err(Error::ShapeMismatch {
            expected: extent.to_vec(),
            actual: src.shape().to_vec(),
        });
    }
    let src_view = ArrayView4::from_shape(extent, src.as_slice()?).map_err(nd_err)?;
    let mut view = ArrayViewMut4::from_shape(shape, t.as_mut_slice()?).map_err(nd_err)?;
    view.slice_mut(s![r[0].0..r[0].1, r[1].0..r[1].1, r[2].0..r[2].1, r[3].0..r[3].1])
        .assign(&src_view);
    Ok(())
}

/// Concatenates along channel (1), height (2) or width (3) into a fresh tensor,
/// one task per batch index.
pub fn concat(a: &Tensor, b: &Tensor, axis: usize) -> Result<Tensor, Error> {
    if !(1..=3).contains(&axis) {
        return Err(Error::InvalidAxis(axis as isize));
    }
    let (a_shape, b_shape) = (a.shape(), b.shape());
    let mismatch = (0..4).any(|i| i != axis && a_shape[i] != b_shape[i]);
    if mismatch {
        return Err(Error::IncompatibleShapes {
            op: format!("concat(axis={})", axis),
            shape_a: a_shape.to_vec(),
            shape_b: b_shape.to_vec(),
        });
    }
    let lhs = a.as_slice()?;
    let rhs = b.as_slice()?;
    let mut out_shape = a_shape;
    out_shape[axis] += b_shape[axis];

    // Within one batch: `outer` runs of `a_run` elements from a then `b_run` from b.
    let outer: usize = a_shape[1..axis].iter().product();
    let a_run: usize = a_shape[axis..].iter().product();
    let b_run: usize = b_shape[axis..].iter().product();
    let (a_batch, b_batch) = (outer * a_run, outer * b_run);

    let mut data = vec![0.0; numel(&out_shape)];
    data.par_chunks_mut(a_batch + b_batch)
        .enumerate()
        .for_each(|(n, chunk)| {
            for o in 0..outer {
                let dst = o * (a_run + b_run);
                let a_src = n * a_batch + o * a_run;
                let b_src = n * b_batch + o * b_run;
                chunk[dst..dst + a_run].copy_from_slice(&lhs[a_src..a_src + a_run]);
                chunk[dst + a_run..dst + a_run + b_run].copy_from_slice(&rhs[b_src..b_src + b_run]);
            }
        });
    Tensor::from_vec(out_shape, data)
}

/// Sums along `axis` (0..=3), keeping it with size 1; `-1` sums everything to 1x1x1x1.
pub fn sum_by_dim(t: &Tensor, axis: isize) -> Result<Tensor, Error> {
    let data = t.as_slice()?;
    if axis == -1 {
        return Ok(Tensor::scalar(data.par_iter().sum()));
    }
    if !(0..=3).contains(&axis) {
        return Err(Error::InvalidAxis(axis));
    }
    let ax = axis as usize;
    let shape = t.shape();
    let view = ArrayView4::from_shape(shape, data).map_err(nd_err)?;
    let summed = view.sum_axis(Axis(ax));
    let mut out_shape = shape;
    out_shape[ax] = 1;
    Tensor::from_vec(out_shape, summed.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_cycles_rectangular() {
        // 2x3 -> 3x2
        let mut buf = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        transpose_cycles(&mut buf, 2, 3);
        assert_eq!(buf, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_cycles_square() {
        let mut buf: Vec<Elem> = (0..9).map(|x| x as Elem).collect();
        transpose_cycles(&mut buf, 3, 3);
        assert_eq!(buf, vec![0.0, 3.0, 6.0, 1.0, 4.0, 7.0, 2.0, 5.0, 8.0]);
    }

    #[test]
    fn test_tiled_offset_wraps_each_axis() {
        let shape = [1, 1, 2, 2];
        assert_eq!(tiled_offset(&shape, 3, 2, 3, 2), 2);
        assert_eq!(tiled_offset(&shape, 0, 0, 1, 1), 3);
    }
}
