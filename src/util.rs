use crate::error::Error;
use crate::tensor::Shape;

/// Number of elements described by a shape.
pub fn numel(shape: &Shape) -> usize {
    shape.iter().product()
}

/// Validates that every dimension is at least one.
pub fn check_shape(shape: &Shape) -> Result<(), Error> {
    if shape.iter().any(|&d| d == 0) {
        return Err(Error::ShapeError(format!(
            "every dimension must be >= 1, got {:?}",
            shape
        )));
    }
    Ok(())
}

/// Returns true when `small` can be tiled to cover `big` exactly, axis by axis.
pub fn tiles_into(big: &Shape, small: &Shape) -> bool {
    big.iter()
        .zip(small.iter())
        .all(|(&b, &s)| s != 0 && s <= b && b % s == 0)
}

/// Resolves the larger of two shapes for a tiled elementwise operation.
///
/// Returns `(result_shape, lhs_is_big)`. Equal element counts with different
/// shapes resolve to the left-hand shape; callers treat that case as a flat
/// elementwise operation.
pub fn tile_shapes(op: &str, a: &Shape, b: &Shape) -> Result<(Shape, bool), Error> {
    let (na, nb) = (numel(a), numel(b));
    if na == nb {
        return Ok((*a, true));
    }
    let (big, small, lhs_is_big) = if na > nb { (a, b, true) } else { (b, a, false) };
    if numel(big) % numel(small) != 0 || !tiles_into(big, small) {
        return Err(Error::IncompatibleShapes {
            op: op.to_string(),
            shape_a: a.to_vec(),
            shape_b: b.to_vec(),
        });
    }
    Ok((*big, lhs_is_big))
}

/// Maps a possibly negative slice bound onto `0..=size`.
pub fn resolve_bound(bound: isize, size: usize) -> Option<usize> {
    let resolved = if bound < 0 {
        size as isize + bound
    } else {
        bound
    };
    if resolved < 0 || resolved as usize > size {
        None
    } else {
        Some(resolved as usize)
    }
}
