use crate::Real;
use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::pattern::SparsityPattern;
use rayon::prelude::*;
use std::sync::Arc;

/// A vector made of `block_size` consecutive entries per block row.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockVector<T: Real> {
    block_size: usize,
    values: DVector<T>,
}

impl<T: Real> BlockVector<T> {
    pub fn zeros(num_blocks: usize, block_size: usize) -> Self {
        Self {
            block_size,
            values: DVector::zeros(num_blocks * block_size),
        }
    }

    /// Wraps a flat vector.
    ///
    /// # Panics
    ///
    /// Panics if the length of the vector is not a multiple of the block size.
    pub fn from_vector(values: DVector<T>, block_size: usize) -> Self {
        assert!(block_size > 0, "Block size must be positive.");
        assert_eq!(values.len() % block_size, 0, "Vector length must be a multiple of the block size.");
        Self { block_size, values }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        if self.block_size == 0 {
            0
        } else {
            self.values.len() / self.block_size
        }
    }

    pub fn block(&self, i: usize) -> DVectorView<T> {
        self.values.rows(i * self.block_size, self.block_size)
    }

    pub fn block_mut(&mut self, i: usize) -> DVectorViewMut<T> {
        self.values.rows_mut(i * self.block_size, self.block_size)
    }

    pub fn as_vector(&self) -> &DVector<T> {
        &self.values
    }

    pub fn as_vector_mut(&mut self) -> &mut DVector<T> {
        &mut self.values
    }

    pub fn into_vector(self) -> DVector<T> {
        self.values
    }

    pub fn fill_zero(&mut self) {
        self.values.fill(T::zero());
    }
}

/// A square block-sparse matrix in compressed row format.
///
/// Every structural nonzero `(i, j)` of the scalar pattern holds a dense `block_size x block_size`
/// block stored in column-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCsrMatrix<T> {
    pattern: Arc<SparsityPattern>,
    block_size: usize,
    values: Vec<T>,
}

impl<T: Real> BlockCsrMatrix<T> {
    /// Creates a matrix with all blocks set to zero.
    pub fn zeros(pattern: Arc<SparsityPattern>, block_size: usize) -> Self {
        assert_eq!(
            pattern.major_dim(),
            pattern.minor_dim(),
            "Block matrices must have a square sparsity pattern."
        );
        let values = vec![T::zero(); pattern.nnz() * block_size * block_size];
        Self {
            pattern,
            block_size,
            values,
        }
    }

    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of block rows (equal to the number of block columns).
    pub fn num_block_rows(&self) -> usize {
        self.pattern.major_dim()
    }

    /// Number of scalar rows.
    pub fn nrows(&self) -> usize {
        self.num_block_rows() * self.block_size
    }

    /// Number of stored blocks.
    pub fn nnz_blocks(&self) -> usize {
        self.pattern.nnz()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    pub fn fill_zero(&mut self) {
        self.values.fill(T::zero());
    }

    /// Index of the stored block `(i, j)`, if it is part of the pattern.
    pub fn block_index(&self, i: usize, j: usize) -> Option<usize> {
        let offset = *self.pattern.major_offsets().get(i)?;
        let lane = self.pattern.lane(i);
        lane.binary_search(&j).ok().map(|k| offset + k)
    }

    pub fn block(&self, i: usize, j: usize) -> Option<DMatrixView<T>> {
        let k = self.block_index(i, j)?;
        let bb = self.block_size * self.block_size;
        let data = &self.values[k * bb..(k + 1) * bb];
        Some(DMatrixView::from_slice(data, self.block_size, self.block_size))
    }

    pub fn block_mut(&mut self, i: usize, j: usize) -> Option<DMatrixViewMut<T>> {
        let k = self.block_index(i, j)?;
        let bb = self.block_size * self.block_size;
        let data = &mut self.values[k * bb..(k + 1) * bb];
        Some(DMatrixViewMut::from_slice(data, self.block_size, self.block_size))
    }

    pub fn diagonal_block(&self, i: usize) -> Option<DMatrixView<T>> {
        self.block(i, i)
    }

    pub fn row(&self, i: usize) -> BlockRow<T> {
        let range = self.row_value_range(i);
        BlockRow {
            block_size: self.block_size,
            col_indices: self.pattern.lane(i),
            values: &self.values[range],
        }
    }

    pub fn row_mut(&mut self, i: usize) -> BlockRowMut<T> {
        let range = self.row_value_range(i);
        BlockRowMut {
            block_size: self.block_size,
            col_indices: self.pattern.lane(i),
            values: &mut self.values[range],
        }
    }

    pub(crate) fn pattern_and_values_mut(&mut self) -> (&SparsityPattern, &mut [T]) {
        (&self.pattern, &mut self.values)
    }

    pub(crate) fn row_value_range(&self, i: usize) -> std::ops::Range<usize> {
        let offsets = self.pattern.major_offsets();
        let bb = self.block_size * self.block_size;
        offsets[i] * bb..offsets[i + 1] * bb
    }

    /// Computes `y = A x`.
    ///
    /// Block rows are processed in parallel.
    pub fn spmv(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) {
        let b = self.block_size;
        assert_eq!(x.len(), self.nrows(), "Dimension mismatch between matrix and input vector.");
        assert_eq!(y.len(), self.nrows(), "Dimension mismatch between matrix and output vector.");
        if b == 0 {
            return;
        }
        let x = x.as_slice();
        y.as_mut_slice()
            .par_chunks_mut(b)
            .enumerate()
            .with_min_len(64)
            .for_each(|(i, y_i)| {
                y_i.fill(T::zero());
                self.row(i).mul_add_into(y_i, x);
            });
    }

    /// Builds a dense representation of the matrix.
    pub fn to_dense(&self) -> DMatrix<T> {
        let b = self.block_size;
        let mut dense = DMatrix::zeros(self.nrows(), self.nrows());
        for i in 0..self.num_block_rows() {
            for (j, block) in self.row(i).iter() {
                dense.view_mut((i * b, j * b), (b, b)).copy_from(&block);
            }
        }
        dense
    }
}

/// A read-only block row.
#[derive(Debug, Clone, Copy)]
pub struct BlockRow<'a, T> {
    block_size: usize,
    col_indices: &'a [usize],
    values: &'a [T],
}

impl<'a, T: Real> BlockRow<'a, T> {
    pub fn col_indices(&self) -> &'a [usize] {
        self.col_indices
    }

    pub fn num_blocks(&self) -> usize {
        self.col_indices.len()
    }

    pub fn block_at(&self, k: usize) -> DMatrixView<'a, T> {
        let bb = self.block_size * self.block_size;
        DMatrixView::from_slice(&self.values[k * bb..(k + 1) * bb], self.block_size, self.block_size)
    }

    pub fn block_for_col(&self, j: usize) -> Option<DMatrixView<'a, T>> {
        let k = self.col_indices.binary_search(&j).ok()?;
        Some(self.block_at(k))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, DMatrixView<'a, T>)> + '_ {
        self.col_indices
            .iter()
            .enumerate()
            .map(move |(k, &j)| (j, self.block_at(k)))
    }

    /// `y += sum_j A_ij x_j` for the flat input `x`.
    pub(crate) fn mul_add_into(&self, y: &mut [T], x: &[T]) {
        let b = self.block_size;
        let bb = b * b;
        for (k, &j) in self.col_indices.iter().enumerate() {
            let block = &self.values[k * bb..(k + 1) * bb];
            let x_j = &x[j * b..(j + 1) * b];
            for (c, &x_jc) in x_j.iter().enumerate() {
                let column = &block[c * b..(c + 1) * b];
                for (y_r, &a_rc) in y.iter_mut().zip(column) {
                    *y_r += a_rc * x_jc;
                }
            }
        }
    }
}

/// A mutable block row.
#[derive(Debug)]
pub struct BlockRowMut<'a, T> {
    block_size: usize,
    col_indices: &'a [usize],
    values: &'a mut [T],
}

impl<'a, T: Real> BlockRowMut<'a, T> {
    pub(crate) fn from_parts(block_size: usize, col_indices: &'a [usize], values: &'a mut [T]) -> Self {
        debug_assert_eq!(col_indices.len() * block_size * block_size, values.len());
        Self {
            block_size,
            col_indices,
            values,
        }
    }

    pub fn col_indices(&self) -> &[usize] {
        self.col_indices
    }

    pub fn num_blocks(&self) -> usize {
        self.col_indices.len()
    }

    pub fn fill_zero(&mut self) {
        self.values.fill(T::zero());
    }

    pub fn block_mut_at(&mut self, k: usize) -> DMatrixViewMut<T> {
        let bb = self.block_size * self.block_size;
        DMatrixViewMut::from_slice(&mut self.values[k * bb..(k + 1) * bb], self.block_size, self.block_size)
    }

    pub fn block_mut_for_col(&mut self, j: usize) -> Option<DMatrixViewMut<T>> {
        let k = self.col_indices.binary_search(&j).ok()?;
        Some(self.block_mut_at(k))
    }
}
