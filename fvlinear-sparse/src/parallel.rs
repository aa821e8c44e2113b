//! Unsynchronized parallel write access to disjoint parts of block matrices and vectors.

use crate::block::BlockRowMut;
use crate::{BlockCsrMatrix, BlockVector, Real};
use nalgebra::DVectorViewMut;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::ops::Range;

/// Shared handle to a mutable slice that hands out subslices to multiple threads.
#[derive(Copy)]
pub struct ParallelSliceAccess<'a, T> {
    ptr: *mut T,
    len: usize,
    marker: PhantomData<&'a mut T>,
}

impl<'a, T> ParallelSliceAccess<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            marker: PhantomData,
        }
    }

    /// Construct a subslice for the given range.
    ///
    /// # Safety
    ///
    /// Multiple threads must not call this function with overlapping ranges without synchronization.
    pub unsafe fn subslice_mut(&self, range: Range<usize>) -> &'a mut [T] {
        let Range { start, end } = range;
        assert!(start <= end && end <= self.len, "Subslice range out of bounds.");
        std::slice::from_raw_parts_mut(self.ptr.add(start), end - start)
    }
}

impl<'a, T> Clone for ParallelSliceAccess<'a, T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            len: self.len,
            marker: PhantomData,
        }
    }
}

unsafe impl<'a, T: Send> Sync for ParallelSliceAccess<'a, T> {}
unsafe impl<'a, T: Send> Send for ParallelSliceAccess<'a, T> {}

/// Row-wise parallel access to a [`BlockCsrMatrix`].
#[derive(Clone)]
pub struct ParallelRowAccess<'a, T> {
    offsets: &'a [usize],
    indices: &'a [usize],
    block_size: usize,
    values: ParallelSliceAccess<'a, T>,
}

impl<'a, T: Real> ParallelRowAccess<'a, T> {
    pub fn new(matrix: &'a mut BlockCsrMatrix<T>) -> Self {
        let block_size = matrix.block_size();
        let (pattern, values) = matrix.pattern_and_values_mut();
        Self {
            offsets: pattern.major_offsets(),
            indices: pattern.minor_indices(),
            block_size,
            values: ParallelSliceAccess::new(values),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Mutable access to row `i`.
    ///
    /// # Safety
    ///
    /// No two threads may hold the same row at the same time.
    pub unsafe fn row_mut(&self, i: usize) -> BlockRowMut<'a, T> {
        let bb = self.block_size * self.block_size;
        let (start, end) = (self.offsets[i], self.offsets[i + 1]);
        let values = self.values.subslice_mut(start * bb..end * bb);
        BlockRowMut::from_parts(self.block_size, &self.indices[start..end], values)
    }
}

/// Block-wise parallel access to a [`BlockVector`].
#[derive(Clone)]
pub struct ParallelBlockAccess<'a, T> {
    block_size: usize,
    values: ParallelSliceAccess<'a, T>,
}

impl<'a, T: Real> ParallelBlockAccess<'a, T> {
    pub fn new(vector: &'a mut BlockVector<T>) -> Self {
        let block_size = vector.block_size();
        Self {
            block_size,
            values: ParallelSliceAccess::new(vector.as_vector_mut().as_mut_slice()),
        }
    }

    /// Mutable access to block `i`.
    ///
    /// # Safety
    ///
    /// No two threads may hold the same block at the same time.
    pub unsafe fn block_mut(&self, i: usize) -> DVectorViewMut<'a, T> {
        let b = self.block_size;
        let slice = self.values.subslice_mut(i * b..(i + 1) * b);
        DVectorViewMut::from_slice(slice, b)
    }
}

/// Checks whether the given index subsets are pairwise disjoint.
///
/// Duplicate indices within a single subset are allowed.
pub fn subsets_are_disjoint<'a, I>(subsets: I) -> bool
where
    I: IntoIterator<Item = &'a [usize]>,
{
    let mut global_index_set = HashSet::new();
    let mut local_index_set = HashSet::new();
    for subset in subsets {
        local_index_set.clear();
        local_index_set.extend(subset.iter().copied());
        for idx in &local_index_set {
            if !global_index_set.insert(*idx) {
                return false;
            }
        }
    }
    true
}
