//! Parallel Newton linearization and overlapping linear solves for finite-volume discretizations.
//!
//! The [`linearizer::Linearizer`] turns a nonlinear residual into a block-sparse Jacobian and
//! residual by summing per-element contributions on a pool of worker threads. The
//! [`backend::ParallelSolverBackend`] extends the local system with an algebraic overlap across
//! processes and solves it with a preconditioned Krylov method.

pub mod backend;
pub mod comm;
pub mod context;
pub mod error;
pub mod grid;
pub mod linearizer;
pub mod local;
pub mod overlap;
pub mod overlapping;
pub mod settings;
pub mod sparsity;

mod wire;

pub extern crate fvlinear_sparse as sparse;
pub extern crate nalgebra;

pub use error::Error;
pub use fvlinear_sparse::{BlockCsrMatrix, BlockVector, Real};
