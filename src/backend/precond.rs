//! Sequential preconditioners as seen by the backend.
//!
//! The backend builds the preconditioner from the overlapping matrix of the local rank. A
//! failure to build it on any rank is reported to all ranks as a numerical issue.
use crate::settings::LinearSolverSettings;
use crate::{BlockCsrMatrix, Real};
use eyre::WrapErr;
use fvlinear_sparse::precond::{BlockIlu0, BlockJacobi, BlockSor};
use fvlinear_sparse::LinearOperator;

/// Creates and owns a local preconditioner for the lifetime of one solve.
pub trait PreconditionerWrapper<T: Real> {
    /// Builds the preconditioner for `matrix`.
    fn prepare(&mut self, matrix: &BlockCsrMatrix<T>) -> eyre::Result<()>;

    /// The preconditioner of the last successful [`prepare`](Self::prepare). `None` means
    /// that no preconditioning is applied.
    fn get(&self) -> Option<&dyn LinearOperator<T>>;

    /// Releases the preconditioner. Called after every solve.
    fn cleanup(&mut self);
}

/// Block Jacobi with `order + 1` sweeps.
#[derive(Debug)]
pub struct JacobiWrapper<T: Real> {
    order: usize,
    relaxation: T,
    preconditioner: Option<BlockJacobi<T>>,
}

impl<T: Real> JacobiWrapper<T> {
    pub fn new(order: usize, relaxation: T) -> Self {
        Self {
            order,
            relaxation,
            preconditioner: None,
        }
    }

    pub fn from_settings(settings: &LinearSolverSettings) -> Self {
        Self::new(
            settings.preconditioner_order,
            nalgebra::convert(settings.preconditioner_relaxation),
        )
    }
}

impl<T: Real> PreconditionerWrapper<T> for JacobiWrapper<T> {
    fn prepare(&mut self, matrix: &BlockCsrMatrix<T>) -> eyre::Result<()> {
        let preconditioner = BlockJacobi::new(matrix, self.order + 1, self.relaxation)
            .wrap_err("failed to set up block Jacobi preconditioner")?;
        self.preconditioner = Some(preconditioner);
        Ok(())
    }

    fn get(&self) -> Option<&dyn LinearOperator<T>> {
        self.preconditioner
            .as_ref()
            .map(|p| p as &dyn LinearOperator<T>)
    }

    fn cleanup(&mut self) {
        self.preconditioner = None;
    }
}

/// Block successive over-relaxation with `order + 1` forward sweeps. A relaxation of one gives
/// block Gauss-Seidel.
#[derive(Debug)]
pub struct SorWrapper<T: Real> {
    order: usize,
    relaxation: T,
    preconditioner: Option<BlockSor<T>>,
}

impl<T: Real> SorWrapper<T> {
    pub fn new(order: usize, relaxation: T) -> Self {
        Self {
            order,
            relaxation,
            preconditioner: None,
        }
    }

    pub fn from_settings(settings: &LinearSolverSettings) -> Self {
        Self::new(
            settings.preconditioner_order,
            nalgebra::convert(settings.preconditioner_relaxation),
        )
    }
}

impl<T: Real> PreconditionerWrapper<T> for SorWrapper<T> {
    fn prepare(&mut self, matrix: &BlockCsrMatrix<T>) -> eyre::Result<()> {
        let preconditioner = BlockSor::new(matrix, self.order + 1, self.relaxation)
            .wrap_err("failed to set up block SOR preconditioner")?;
        self.preconditioner = Some(preconditioner);
        Ok(())
    }

    fn get(&self) -> Option<&dyn LinearOperator<T>> {
        self.preconditioner
            .as_ref()
            .map(|p| p as &dyn LinearOperator<T>)
    }

    fn cleanup(&mut self) {
        self.preconditioner = None;
    }
}

/// Block incomplete LU factorization without fill-in.
#[derive(Debug)]
pub struct Ilu0Wrapper<T: Real> {
    relaxation: T,
    preconditioner: Option<BlockIlu0<T>>,
}

impl<T: Real> Ilu0Wrapper<T> {
    /// Only fill level zero is available; higher orders fall back to it.
    pub fn new(order: usize, relaxation: T) -> Self {
        if order > 0 {
            log::warn!("ILU fill level {} is not supported, using ILU(0)", order);
        }
        Self {
            relaxation,
            preconditioner: None,
        }
    }

    pub fn from_settings(settings: &LinearSolverSettings) -> Self {
        Self::new(
            settings.preconditioner_order,
            nalgebra::convert(settings.preconditioner_relaxation),
        )
    }
}

impl<T: Real> PreconditionerWrapper<T> for Ilu0Wrapper<T> {
    fn prepare(&mut self, matrix: &BlockCsrMatrix<T>) -> eyre::Result<()> {
        let preconditioner =
            BlockIlu0::new(matrix, self.relaxation).wrap_err("failed to set up block ILU(0) preconditioner")?;
        self.preconditioner = Some(preconditioner);
        Ok(())
    }

    fn get(&self) -> Option<&dyn LinearOperator<T>> {
        self.preconditioner
            .as_ref()
            .map(|p| p as &dyn LinearOperator<T>)
    }

    fn cleanup(&mut self) {
        self.preconditioner = None;
    }
}
