//! Sequential block preconditioners.
//!
//! All preconditioners work on a snapshot of the matrix taken at construction time and apply
//! `y = M^{-1} x` through [`LinearOperator`].

use crate::krylov::{BoxedError, LinearOperator};
use crate::{BlockCsrMatrix, Real};
use core::fmt;
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PreconditionerError {
    MissingDiagonal { row: usize },
    SingularBlock { row: usize },
}

impl fmt::Display for PreconditionerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDiagonal { row } => write!(f, "Block row {} has no diagonal block", row),
            Self::SingularBlock { row } => write!(f, "Diagonal block of row {} is singular", row),
        }
    }
}

impl std::error::Error for PreconditionerError {}

fn invert_diagonal_blocks<T: Real>(matrix: &BlockCsrMatrix<T>) -> Result<Vec<DMatrix<T>>, PreconditionerError> {
    (0..matrix.num_block_rows())
        .map(|row| {
            let block = matrix
                .diagonal_block(row)
                .ok_or(PreconditionerError::MissingDiagonal { row })?;
            invert_block(block.clone_owned(), row)
        })
        .collect()
}

fn invert_block<T: Real>(block: DMatrix<T>, row: usize) -> Result<DMatrix<T>, PreconditionerError> {
    let inverse = block
        .try_inverse()
        .ok_or(PreconditionerError::SingularBlock { row })?;
    if inverse.iter().all(|x| x.is_finite()) {
        Ok(inverse)
    } else {
        Err(PreconditionerError::SingularBlock { row })
    }
}

/// `y_i += scale * D_i^{-1} r_i` for every block row.
fn add_scaled_block_solve<T: Real>(y: &mut DVector<T>, inv_diag: &[DMatrix<T>], r: &DVector<T>, scale: T) {
    let b = inv_diag.first().map(|d| d.nrows()).unwrap_or(0);
    for (i, d_inv) in inv_diag.iter().enumerate() {
        let r_i = r.rows(i * b, b);
        y.rows_mut(i * b, b).gemv(scale, d_inv, &r_i, T::one());
    }
}

/// Block Jacobi iteration with relaxation.
#[derive(Debug, Clone)]
pub struct BlockJacobi<T: Real> {
    matrix: BlockCsrMatrix<T>,
    inv_diag: Vec<DMatrix<T>>,
    sweeps: usize,
    relaxation: T,
}

impl<T: Real> BlockJacobi<T> {
    pub fn new(matrix: &BlockCsrMatrix<T>, sweeps: usize, relaxation: T) -> Result<Self, PreconditionerError> {
        Ok(Self {
            inv_diag: invert_diagonal_blocks(matrix)?,
            matrix: matrix.clone(),
            sweeps: sweeps.max(1),
            relaxation,
        })
    }
}

impl<T: Real> LinearOperator<T> for BlockJacobi<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError> {
        let mut result = DVector::zeros(x.len());
        let mut residual = x.clone_owned();
        for sweep in 0..self.sweeps {
            if sweep > 0 {
                // residual = x - A y
                self.matrix.spmv((&mut residual).into(), (&result).into());
                residual.zip_apply(&x, |ay_i, x_i| *ay_i = x_i - *ay_i);
            }
            add_scaled_block_solve(&mut result, &self.inv_diag, &residual, self.relaxation);
        }
        y.copy_from(&result);
        Ok(())
    }
}

/// Forward block successive over-relaxation. Block Gauss-Seidel for a relaxation of one.
#[derive(Debug, Clone)]
pub struct BlockSor<T: Real> {
    matrix: BlockCsrMatrix<T>,
    inv_diag: Vec<DMatrix<T>>,
    sweeps: usize,
    relaxation: T,
}

impl<T: Real> BlockSor<T> {
    pub fn new(matrix: &BlockCsrMatrix<T>, sweeps: usize, relaxation: T) -> Result<Self, PreconditionerError> {
        Ok(Self {
            inv_diag: invert_diagonal_blocks(matrix)?,
            matrix: matrix.clone(),
            sweeps: sweeps.max(1),
            relaxation,
        })
    }
}

impl<T: Real> LinearOperator<T> for BlockSor<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError> {
        let b = self.matrix.block_size();
        let omega = self.relaxation;
        let mut result = DVector::zeros(x.len());
        let mut defect = DVector::zeros(b);
        for _ in 0..self.sweeps {
            for i in 0..self.matrix.num_block_rows() {
                defect.copy_from(&x.rows(i * b, b));
                for (j, a_ij) in self.matrix.row(i).iter() {
                    if j != i {
                        defect.gemv(-T::one(), &a_ij, &result.rows(j * b, b), T::one());
                    }
                }
                let update = &self.inv_diag[i] * &defect;
                let mut y_i = result.rows_mut(i * b, b);
                y_i.zip_apply(&update, |y_ik, u_k| *y_ik = (T::one() - omega) * *y_ik + omega * u_k);
            }
        }
        y.copy_from(&result);
        Ok(())
    }
}

/// Block incomplete LU factorization without fill-in.
///
/// The strictly lower factor has identity diagonal blocks and shares the sparsity pattern of the
/// input matrix with the upper factor.
#[derive(Debug, Clone)]
pub struct BlockIlu0<T: Real> {
    factors: BlockCsrMatrix<T>,
    inv_diag: Vec<DMatrix<T>>,
    relaxation: T,
}

impl<T: Real> BlockIlu0<T> {
    pub fn new(matrix: &BlockCsrMatrix<T>, relaxation: T) -> Result<Self, PreconditionerError> {
        let mut factors = matrix.clone();
        let n = factors.num_block_rows();
        let mut inv_diag: Vec<DMatrix<T>> = Vec::with_capacity(n);

        for i in 0..n {
            let cols = factors.pattern().lane(i).to_vec();
            if cols.binary_search(&i).is_err() {
                return Err(PreconditionerError::MissingDiagonal { row: i });
            }
            for (pos, &k) in cols.iter().enumerate().take_while(|(_, k)| **k < i) {
                // L_ik = A_ik U_kk^{-1}
                let l_ik = match factors.block(i, k) {
                    Some(a_ik) => a_ik * &inv_diag[k],
                    None => continue,
                };
                if let Some(mut block) = factors.block_mut(i, k) {
                    block.copy_from(&l_ik);
                }
                for &j in &cols[pos + 1..] {
                    let u_kj = match factors.block(k, j) {
                        Some(u_kj) => u_kj.clone_owned(),
                        None => continue,
                    };
                    if let Some(mut a_ij) = factors.block_mut(i, j) {
                        a_ij.gemm(-T::one(), &l_ik, &u_kj, T::one());
                    }
                }
            }
            let u_ii = factors
                .diagonal_block(i)
                .ok_or(PreconditionerError::MissingDiagonal { row: i })?
                .clone_owned();
            inv_diag.push(invert_block(u_ii, i)?);
        }

        Ok(Self {
            factors,
            inv_diag,
            relaxation,
        })
    }
}

impl<T: Real> LinearOperator<T> for BlockIlu0<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError> {
        let b = self.factors.block_size();
        let n = self.factors.num_block_rows();
        let mut z = x.clone_owned();

        // Forward substitution with unit lower factor
        for i in 0..n {
            for (k, l_ik) in self.factors.row(i).iter().take_while(|(k, _)| *k < i) {
                let z_k = z.rows(k * b, b).clone_owned();
                z.rows_mut(i * b, b).gemv(-T::one(), &l_ik, &z_k, T::one());
            }
        }

        // Backward substitution with upper factor
        let mut result = DVector::zeros(x.len());
        let mut defect = DVector::zeros(b);
        for i in (0..n).rev() {
            defect.copy_from(&z.rows(i * b, b));
            for (j, u_ij) in self.factors.row(i).iter().filter(|(j, _)| *j > i) {
                defect.gemv(-T::one(), &u_ij, &result.rows(j * b, b), T::one());
            }
            result
                .rows_mut(i * b, b)
                .gemv(T::one(), &self.inv_diag[i], &defect, T::zero());
        }

        result *= self.relaxation;
        y.copy_from(&result);
        Ok(())
    }
}
