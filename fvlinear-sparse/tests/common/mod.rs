use fvlinear_sparse::{BlockCsrMatrix, SparsityPattern};
use nalgebra::DMatrix;
use std::sync::Arc;

/// Tridiagonal block pattern with `n` block rows.
pub fn tridiagonal_pattern(n: usize) -> Arc<SparsityPattern> {
    let mut offsets = vec![0];
    let mut indices = Vec::new();
    for i in 0..n {
        let start = i.saturating_sub(1);
        let end = (i + 2).min(n);
        indices.extend(start..end);
        offsets.push(indices.len());
    }
    Arc::new(SparsityPattern::try_from_offsets_and_indices(n, n, offsets, indices).unwrap())
}

/// A diagonally dominant block tridiagonal matrix.
///
/// With `convection != 0` the matrix is nonsymmetric.
pub fn block_tridiagonal(n: usize, block_size: usize, convection: f64) -> BlockCsrMatrix<f64> {
    let mut matrix = BlockCsrMatrix::zeros(tridiagonal_pattern(n), block_size);
    for i in 0..n {
        let mut diag = DMatrix::identity(block_size, block_size) * 4.0;
        if block_size > 1 {
            diag[(0, 1)] = 0.5;
            diag[(1, 0)] = 0.5;
        }
        matrix.block_mut(i, i).unwrap().copy_from(&diag);
        if i > 0 {
            let lower = DMatrix::identity(block_size, block_size) * (-1.0 - convection);
            matrix.block_mut(i, i - 1).unwrap().copy_from(&lower);
        }
        if i + 1 < n {
            let upper = DMatrix::identity(block_size, block_size) * (-1.0 + convection);
            matrix.block_mut(i, i + 1).unwrap().copy_from(&upper);
        }
    }
    matrix
}
