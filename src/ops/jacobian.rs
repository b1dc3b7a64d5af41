//! Builders for local Jacobian matrices and the slice-wise chain rule.
//!
//! A Jacobian tensor has shape `(N, C, rows, cols)`: for every (batch, channel)
//! slice, `rows` index output elements of that slice and `cols` index input
//! elements. Tensors whose N or C is smaller than the iteration grid are
//! reused by index modulo, which is how batch- and channel-broadcast operands
//! are expressed.

use crate::error::Error;
use crate::tensor::{Elem, Shape, Tensor};
use crate::util::{numel, tiles_into};

use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2};
use rayon::prelude::*;

/// `(N, C, size, size)` with `value` on every diagonal.
pub fn diagonal(n: usize, c: usize, size: usize, value: Elem) -> Result<Tensor, Error> {
    let mut out = Tensor::zeros([n, c, size, size])?;
    out.as_mut_slice()?
        .par_chunks_mut(size * size)
        .for_each(|chunk| {
            for i in 0..size {
                chunk[i * size + i] = value;
            }
        });
    Ok(out)
}

pub fn identity(n: usize, c: usize, size: usize) -> Result<Tensor, Error> {
    diagonal(n, c, size, 1.0)
}

/// Places `repeats` copies of each slice of `block` along the diagonal of that
/// slice, i.e. `I_repeats (x) block` per slice.
pub fn diagonal_blocks(block: &Tensor, repeats: usize) -> Result<Tensor, Error> {
    let src = block.as_slice()?;
    let [n, c, bh, bw] = block.shape();
    let (rows, cols) = (repeats * bh, repeats * bw);
    let mut out = Tensor::zeros([n, c, rows, cols])?;
    out.as_mut_slice()?
        .par_chunks_mut(rows * cols)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let b = &src[slice * bh * bw..(slice + 1) * bh * bw];
            for r in 0..repeats {
                for i in 0..bh {
                    let dst = (r * bh + i) * cols + r * bw;
                    chunk[dst..dst + bw].copy_from_slice(&b[i * bw..(i + 1) * bw]);
                }
            }
        });
    Ok(out)
}

/// Per-slice diagonal matrix whose diagonal is the flattened slice of `entries`.
pub fn diagonal_entries(entries: &Tensor) -> Result<Tensor, Error> {
    let src = entries.as_slice()?;
    let [n, c, h, w] = entries.shape();
    let size = h * w;
    let mut out = Tensor::zeros([n, c, size, size])?;
    out.as_mut_slice()?
        .par_chunks_mut(size * size)
        .enumerate()
        .for_each(|(slice, chunk)| {
            for i in 0..size {
                chunk[i * size + i] = src[slice * size + i];
            }
        });
    Ok(out)
}

/// Jacobian of `Y = A B` with respect to `B`, where `A` is `lhs` (m x t per
/// slice) and `B` has `k` columns.
///
/// Row `i * k + j` of the result depends on exactly one column per group of
/// `k`: entry `(i * k + j, s * k + j)` is `A[i, s]`.
pub fn special_jacobi(lhs: &Tensor, k: usize) -> Result<Tensor, Error> {
    if k == 0 {
        return Err(Error::ShapeError("special_jacobi needs k >= 1".to_string()));
    }
    let src = lhs.as_slice()?;
    let [n, c, m, t] = lhs.shape();
    let (rows, cols) = (m * k, t * k);
    let mut out = Tensor::zeros([n, c, rows, cols])?;
    out.as_mut_slice()?
        .par_chunks_mut(rows * cols)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let a = &src[slice * m * t..(slice + 1) * m * t];
            for row in 0..rows {
                let (i, j) = (row / k, row % k);
                for s in 0..t {
                    chunk[row * cols + s * k + j] = a[i * t + s];
                }
            }
        });
    Ok(out)
}

/// Local Jacobian of a tiled elementwise output with respect to one operand.
///
/// Output element `(h, w)` of slice `(n, c)` reads operand element
/// `(h % Hp, w % Wp)`; the entry is `scale[n, c, h, w]` or 1 when no scale is
/// given. Result shape is `(No, Co, Ho * Wo, Hp * Wp)`.
pub fn broadcast_jacobi(
    out_shape: Shape,
    operand_shape: Shape,
    scale: Option<&Tensor>,
) -> Result<Tensor, Error> {
    if !tiles_into(&out_shape, &operand_shape) {
        return Err(Error::IncompatibleShapes {
            op: "broadcast_jacobi".to_string(),
            shape_a: out_shape.to_vec(),
            shape_b: operand_shape.to_vec(),
        });
    }
    let scale = match scale {
        Some(s) if s.shape() != out_shape => {
            return Err(Error::ShapeMismatch {
                expected: out_shape.to_vec(),
                actual: s.shape().to_vec(),
            })
        }
        Some(s) => Some(s.as_slice()?),
        None => None,
    };
    let [n, c, ho, wo] = out_shape;
    let [_, _, hp, wp] = operand_shape;
    let (rows, cols) = (ho * wo, hp * wp);
    let mut out = Tensor::zeros([n, c, rows, cols])?;
    out.as_mut_slice()?
        .par_chunks_mut(rows * cols)
        .enumerate()
        .for_each(|(slice, chunk)| {
            for h in 0..ho {
                for w in 0..wo {
                    let row = h * wo + w;
                    let col = (h % hp) * wp + (w % wp);
                    chunk[row * cols + col] = scale.map_or(1.0, |s| s[slice * rows + row]);
                }
            }
        });
    Ok(out)
}

/// Jacobian of an operand that was combined flat with an output of equal
/// length but different shape, composed directly with the upstream rows.
///
/// Output element `i` (in buffer order) reads operand element `i`, scaled by
/// `scale[i]` when given. `upstream` must carry the output's own (N, C)
/// extents. Result shape is `(Np, Cp, R, Hp * Wp)`.
pub fn flat_jacobi(
    upstream: &Tensor,
    out_shape: Shape,
    operand_shape: Shape,
    scale: Option<&Tensor>,
) -> Result<Tensor, Error> {
    let [on, oc, oh, ow] = out_shape;
    let [_, _, rows, _] = upstream.shape();
    let out_slice = oh * ow;
    if numel(&out_shape) != numel(&operand_shape) || upstream.shape() != [on, oc, rows, out_slice] {
        return Err(Error::IncompatibleShapes {
            op: "flat_jacobi".to_string(),
            shape_a: upstream.shape().to_vec(),
            shape_b: operand_shape.to_vec(),
        });
    }
    let scale = match scale {
        Some(s) if s.len() != numel(&out_shape) => {
            return Err(Error::ShapeMismatch {
                expected: out_shape.to_vec(),
                actual: s.shape().to_vec(),
            })
        }
        Some(s) => Some(s.as_slice()?),
        None => None,
    };
    let [pn, pc, ph, pw] = operand_shape;
    let own_slice = ph * pw;
    let up = upstream.as_slice()?;
    let mut data = vec![0.0; pn * pc * rows * own_slice];
    data.par_chunks_mut(rows * own_slice)
        .enumerate()
        .for_each(|(slice, chunk)| {
            for m in 0..own_slice {
                let flat = slice * own_slice + m;
                let (out_s, out_m) = (flat / out_slice, flat % out_slice);
                let d = scale.map_or(1.0, |s| s[flat]);
                for r in 0..rows {
                    chunk[r * own_slice + m] = up[(out_s * rows + r) * out_slice + out_m] * d;
                }
            }
        });
    Tensor::from_vec([pn, pc, rows, own_slice], data)
}

/// Permutation matrix of a per-slice `h x w` transpose, shape `(1, 1, hw, hw)`.
pub fn transpose_jacobi(h: usize, w: usize) -> Result<Tensor, Error> {
    let size = h * w;
    let mut out = Tensor::zeros([1, 1, size, size])?;
    let buf = out.as_mut_slice()?;
    for i in 0..h {
        for j in 0..w {
            // Output (j, i) in a w x h matrix reads input (i, j).
            buf[(j * h + i) * size + i * w + j] = 1.0;
        }
    }
    Ok(out)
}

/// Selection matrix of a per-batch relabeling from `parent` to `child` shape.
///
/// Only layouts whose channel counts are equal, or where one side has a single
/// channel, keep the slice pairing well defined.
pub fn view_jacobi(child: Shape, parent: Shape) -> Result<Tensor, Error> {
    let [kn, kc, kh, kw] = child;
    let [pn, pc, ph, pw] = parent;
    let (mk, mp) = (kh * kw, ph * pw);
    if kn != pn || kc * mk != pc * mp {
        return Err(Error::IncompatibleShapes {
            op: "view".to_string(),
            shape_a: parent.to_vec(),
            shape_b: child.to_vec(),
        });
    }
    if kc != pc && kc != 1 && pc != 1 {
        return Err(Error::Unsupported(format!(
            "view between {} and {} channels",
            pc, kc
        )));
    }
    let grid_c = kc.max(pc);
    let mut out = Tensor::zeros([1, grid_c, mk, mp])?;
    let buf = out.as_mut_slice()?;
    for g in 0..grid_c {
        let (ck, cp) = (g % kc, g % pc);
        for r in 0..mk {
            let flat = ck * mk + r;
            if flat / mp == cp {
                buf[(g * mk + r) * mp + flat % mp] = 1.0;
            }
        }
    }
    Ok(out)
}

/// Resolves the iteration grid for a set of (N, C) extents: the maximum of
/// each, which every extent must divide.
fn pairing_grid(extents: &[(usize, usize)]) -> Result<(usize, usize), Error> {
    let gn = extents.iter().map(|e| e.0).max().unwrap_or(1);
    let gc = extents.iter().map(|e| e.1).max().unwrap_or(1);
    if extents
        .iter()
        .any(|&(n, c)| n == 0 || c == 0 || gn % n != 0 || gc % c != 0)
    {
        return Err(Error::Unsupported(format!(
            "batch/channel extents {:?} do not broadcast",
            extents
        )));
    }
    Ok((gn, gc))
}

/// Slice-wise chain rule with a dense local Jacobian.
///
/// For every grid point `(n, c)`:
/// `out[n % Nx, c % Cx] += upstream[n % Nk, c % Ck] * local[n % Nl, c % Cl]`,
/// producing a `(Nx, Cx, R, Hx * Wx)` Jacobian for a node of shape `own`.
pub fn chain_dense(upstream: &Tensor, local: &Tensor, own: Shape) -> Result<Tensor, Error> {
    let [kn, kc, rows, mk] = upstream.shape();
    let [ln, lc, lr, lcols] = local.shape();
    let [xn, xc, xh, xw] = own;
    let mx = xh * xw;
    if lr != mk || lcols != mx {
        return Err(Error::IncompatibleShapes {
            op: "chain_dense".to_string(),
            shape_a: upstream.shape().to_vec(),
            shape_b: local.shape().to_vec(),
        });
    }
    let (gn, gc) = pairing_grid(&[(kn, kc), (ln, lc), (xn, xc)])?;
    let up = upstream.as_slice()?;
    let loc = local.as_slice()?;
    let mut data = vec![0.0; xn * xc * rows * mx];
    data.par_chunks_mut(rows * mx)
        .enumerate()
        .try_for_each(|(slice, chunk)| -> Result<(), Error> {
            let (nx, cx) = (slice / xc, slice % xc);
            let mut acc = ArrayViewMut2::from_shape((rows, mx), chunk)
                .map_err(|e| Error::ShapeError(e.to_string()))?;
            for n in (nx..gn).step_by(xn) {
                for c in (cx..gc).step_by(xc) {
                    let ks = (n % kn) * kc + c % kc;
                    let ls = (n % ln) * lc + c % lc;
                    let a = ArrayView2::from_shape((rows, mk), &up[ks * rows * mk..(ks + 1) * rows * mk])
                        .map_err(|e| Error::ShapeError(e.to_string()))?;
                    let b = ArrayView2::from_shape((mk, mx), &loc[ls * mk * mx..(ls + 1) * mk * mx])
                        .map_err(|e| Error::ShapeError(e.to_string()))?;
                    general_mat_mul(1.0, &a, &b, 1.0, &mut acc);
                }
            }
            Ok(())
        })?;
    Tensor::from_vec([xn, xc, rows, mx], data)
}

/// Slice-wise chain rule with a diagonal local Jacobian: scales the upstream
/// columns by `entries` (or passes them through when `entries` is `None`).
pub fn chain_diagonal(upstream: &Tensor, entries: Option<&Tensor>, own: Shape) -> Result<Tensor, Error> {
    let [kn, kc, rows, mk] = upstream.shape();
    let [xn, xc, xh, xw] = own;
    let mx = xh * xw;
    let (en, ec) = match entries {
        Some(e) => {
            let [en, ec, eh, ew] = e.shape();
            if eh * ew != mx {
                return Err(Error::ShapeMismatch {
                    expected: vec![mx],
                    actual: vec![eh * ew],
                });
            }
            (en, ec)
        }
        None => (1, 1),
    };
    if mk != mx {
        return Err(Error::ShapeMismatch {
            expected: vec![mx],
            actual: vec![mk],
        });
    }
    let (gn, gc) = pairing_grid(&[(kn, kc), (en, ec), (xn, xc)])?;
    let up = upstream.as_slice()?;
    let diag = match entries {
        Some(e) => Some(e.as_slice()?),
        None => None,
    };
    let mut data = vec![0.0; xn * xc * rows * mx];
    data.par_chunks_mut(rows * mx)
        .enumerate()
        .for_each(|(slice, chunk)| {
            let (nx, cx) = (slice / xc, slice % xc);
            for n in (nx..gn).step_by(xn) {
                for c in (cx..gc).step_by(xc) {
                    let ks = (n % kn) * kc + c % kc;
                    let es = (n % en) * ec + c % ec;
                    let a = &up[ks * rows * mx..(ks + 1) * rows * mx];
                    for r in 0..rows {
                        for m in 0..mx {
                            let d = diag.map_or(1.0, |d| d[es * mx + m]);
                            chunk[r * mx + m] += a[r * mx + m] * d;
                        }
                    }
                }
            }
        });
    Tensor::from_vec([xn, xc, rows, mx], data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagonal_blocks_tiles_block() {
        let block = Tensor::from_vec([1, 1, 1, 2], vec![1.0, 2.0]).unwrap();
        let d = diagonal_blocks(&block, 2).unwrap();
        assert_eq!(d.shape(), [1, 1, 2, 4]);
        assert_eq!(
            d.to_vec().unwrap(),
            vec![1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0]
        );
    }

    #[test]
    fn test_special_jacobi_interleaves() {
        // A is 1x2, B has 2 columns: d(Y[0,j]) / d(B[s,j]) = A[0,s]
        let a = Tensor::from_vec([1, 1, 1, 2], vec![3.0, 4.0]).unwrap();
        let j = special_jacobi(&a, 2).unwrap();
        assert_eq!(j.shape(), [1, 1, 2, 4]);
        assert_eq!(
            j.to_vec().unwrap(),
            vec![3.0, 0.0, 4.0, 0.0, 0.0, 3.0, 0.0, 4.0]
        );
    }

    #[test]
    fn test_transpose_jacobi_is_permutation() {
        let p = transpose_jacobi(2, 3).unwrap();
        let data = p.to_vec().unwrap();
        for r in 0..6 {
            assert_eq!(data[r * 6..(r + 1) * 6].iter().sum::<Elem>(), 1.0);
        }
        // Output (0, 1) of the 3x2 result reads input (1, 0).
        assert_eq!(data[1 * 6 + 3], 1.0);
    }

    #[test]
    fn test_chain_dense_sums_broadcast_batch() {
        // Two upstream batches feeding a parent with batch 1.
        let up = Tensor::from_vec([2, 1, 1, 1], vec![2.0, 3.0]).unwrap();
        let local = Tensor::ones([1, 1, 1, 1]).unwrap();
        let out = chain_dense(&up, &local, [1, 1, 1, 1]).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![5.0]);
    }

    #[test]
    fn test_flat_jacobi_follows_buffer_order() {
        // Output (1,2,1,2) read flat from a (1,1,2,2) operand, scaled by 2..5.
        let up = identity(1, 2, 2).unwrap();
        let scale = Tensor::from_vec([1, 2, 1, 2], vec![2.0, 3.0, 4.0, 5.0]).unwrap();
        let j = flat_jacobi(&up, [1, 2, 1, 2], [1, 1, 2, 2], Some(&scale)).unwrap();
        assert_eq!(j.shape(), [1, 1, 2, 4]);
        assert_eq!(
            j.to_vec().unwrap(),
            vec![2.0, 0.0, 4.0, 0.0, 0.0, 3.0, 0.0, 5.0]
        );
    }

    #[test]
    fn test_view_jacobi_splits_channel() {
        // (1,1,2,2) viewed as (1,2,1,2): child channel 1 reads parent row 1.
        let j = view_jacobi([1, 2, 1, 2], [1, 1, 2, 2]).unwrap();
        assert_eq!(j.shape(), [1, 2, 2, 4]);
        assert_eq!(
            j.to_vec().unwrap(),
            vec![
                1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
            ]
        );
    }
}
