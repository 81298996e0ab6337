//! Shape rules shared by definition-time inference and engine execution.

use netforge_core::Shape;
use smallvec::SmallVec;

/// Numpy-style broadcast of two shapes, aligned from the right.
pub(crate) fn broadcast(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = SmallVec::with_capacity(rank);
    for i in 0..rank {
        let da = dim_from_right(a, rank - 1 - i);
        let db = dim_from_right(b, rank - 1 - i);
        let d = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
        out.push(d);
    }
    Some(Shape(out))
}

fn dim_from_right(dims: &[usize], from_right: usize) -> usize {
    if from_right < dims.len() {
        dims[dims.len() - 1 - from_right]
    } else {
        1
    }
}

/// `[..a, m, k] x [..b, k, n] -> [broadcast(a, b).., m, n]`.
pub(crate) fn matmul(a: &[usize], b: &[usize]) -> Result<Shape, String> {
    if a.len() < 2 || b.len() < 2 {
        return Err(format!(
            "matmul needs rank >= 2 operands, got {} and {}",
            Shape::from_slice(a),
            Shape::from_slice(b)
        ));
    }
    let (m, k) = (a[a.len() - 2], a[a.len() - 1]);
    let (k2, n) = (b[b.len() - 2], b[b.len() - 1]);
    if k != k2 {
        return Err(format!(
            "matmul inner dimensions differ: {} x {}",
            Shape::from_slice(a),
            Shape::from_slice(b)
        ));
    }
    let lead = broadcast(&a[..a.len() - 2], &b[..b.len() - 2]).ok_or_else(|| {
        format!(
            "matmul batch dimensions do not broadcast: {} x {}",
            Shape::from_slice(a),
            Shape::from_slice(b)
        )
    })?;
    let mut out = lead.0;
    out.push(m);
    out.push(n);
    Ok(Shape(out))
}

/// For every position of `out` (row-major), the matching flat offset into a
/// tensor of shape `src` broadcast to `out`.
pub(crate) fn broadcast_offsets(src: &[usize], out: &[usize]) -> Vec<usize> {
    let rank = out.len();
    let mut strides = vec![0usize; rank];
    let mut stride = 1;
    for i in (0..src.len()).rev() {
        let axis = rank - (src.len() - i);
        strides[axis] = if src[i] == 1 { 0 } else { stride };
        stride *= src[i];
    }

    let total: usize = out.iter().product();
    let mut offsets = Vec::with_capacity(total);
    let mut index = vec![0usize; rank];
    for _ in 0..total {
        offsets.push(index.iter().zip(&strides).map(|(i, s)| i * s).sum());
        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < out[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_aligns_right() {
        assert_eq!(broadcast(&[4, 1, 5], &[1, 1, 5]).unwrap().dims(), &[4, 1, 5]);
        assert_eq!(broadcast(&[3, 1], &[2]).unwrap().dims(), &[3, 2]);
        assert!(broadcast(&[3, 2], &[4]).is_none());
    }

    #[test]
    fn matmul_broadcasts_leading_axes() {
        assert_eq!(matmul(&[2, 1, 10], &[1, 10, 5]).unwrap().dims(), &[2, 1, 5]);
        assert!(matmul(&[1, 1, 10], &[1, 9, 5]).is_err());
        assert!(matmul(&[10], &[10, 5]).is_err());
    }

    #[test]
    fn offsets_repeat_broadcast_axes() {
        assert_eq!(broadcast_offsets(&[1, 3], &[2, 3]), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(broadcast_offsets(&[2, 1], &[2, 3]), vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(broadcast_offsets(&[], &[2]), vec![0, 0]);
    }
}
