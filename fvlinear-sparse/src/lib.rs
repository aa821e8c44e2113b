//! Block-sparse linear algebra for `fvlinear`.
//!
//! Matrices store one dense `b x b` block per structural nonzero of a scalar
//! [`SparsityPattern`]. Vectors are plain `DVector`s with `b` consecutive entries per block row.

use bytemuck::Pod;
use nalgebra::RealField;

pub mod bicgstab;
pub mod block;
pub mod cg;
pub mod krylov;
pub mod parallel;
pub mod precond;

pub use block::{BlockCsrMatrix, BlockRow, BlockRowMut, BlockVector};
pub use krylov::{
    IdentityOperator, LinearOperator, ResidualReductionCriterion, ScalarProduct, SolveError, SolveErrorKind,
    SolverOutput, StandardScalarProduct, StoppingCriterion,
};
pub use nalgebra_sparse::pattern::SparsityPattern;

/// Floating point type used throughout the linear algebra.
///
/// `Pod` lets values travel over byte-oriented communication channels.
pub trait Real: RealField + Copy + Pod {}

impl<T> Real for T where T: RealField + Copy + Pod {}
