//! Building blocks shared by the Krylov solvers.

use crate::{BlockCsrMatrix, Real};
use core::fmt;
use nalgebra::{DMatrix, DVectorView, DVectorViewMut, Scalar};
use std::error::Error;
use std::ops::{Deref, DerefMut};

pub type BoxedError = Box<dyn Error + Send + Sync>;

pub trait LinearOperator<T: Scalar> {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Scalar,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

impl<T: Real> LinearOperator<T> for DMatrix<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError> {
        y.gemv(T::one(), self, &x, T::zero());
        Ok(())
    }
}

impl<T: Real> LinearOperator<T> for BlockCsrMatrix<T> {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError> {
        self.spmv(y, x);
        Ok(())
    }
}

pub struct IdentityOperator;

impl<T: Scalar> LinearOperator<T> for IdentityOperator {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError> {
        y.copy_from(&x);
        Ok(())
    }
}

/// Inner product used by the solvers for all reductions.
///
/// Distributed vectors need a product that counts every entry exactly once across all processes.
pub trait ScalarProduct<T: Scalar> {
    fn dot(&self, x: DVectorView<T>, y: DVectorView<T>) -> Result<T, BoxedError>;

    fn norm(&self, x: DVectorView<T>) -> Result<T, BoxedError>
    where
        T: Real,
    {
        Ok(self.dot(x, x)?.sqrt())
    }
}

impl<'a, T, S> ScalarProduct<T> for &'a S
where
    T: Scalar,
    S: ?Sized + ScalarProduct<T>,
{
    fn dot(&self, x: DVectorView<T>, y: DVectorView<T>) -> Result<T, BoxedError> {
        <S as ScalarProduct<T>>::dot(self, x, y)
    }
}

/// The Euclidean inner product of a single process.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardScalarProduct;

impl<T: Real> ScalarProduct<T> for StandardScalarProduct {
    fn dot(&self, x: DVectorView<T>, y: DVectorView<T>) -> Result<T, BoxedError> {
        Ok(x.dot(&y))
    }
}

/// Snapshot of the solver state handed to a [`StoppingCriterion`].
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceState<T> {
    pub iteration: usize,
    pub b_norm: T,
    pub initial_residual_norm: T,
    pub residual_norm: T,
}

pub trait StoppingCriterion<T: Scalar> {
    fn has_converged(&self, state: &ConvergenceState<T>) -> Result<bool, SolveErrorKind>;
}

/// Converged once `||r|| <= reduction * ||r_0||` or `||r|| <= abs_tol`.
///
/// Norms are those of the recursively updated residual.
#[derive(Debug, Clone, Copy)]
pub struct ResidualReductionCriterion<T> {
    reduction: T,
    abs_tol: T,
}

impl<T: Real> ResidualReductionCriterion<T> {
    pub fn new(reduction: T) -> Self {
        Self {
            reduction,
            abs_tol: T::zero(),
        }
    }

    pub fn with_abs_tol(self, abs_tol: T) -> Self {
        Self { abs_tol, ..self }
    }
}

impl Default for ResidualReductionCriterion<f64> {
    fn default() -> Self {
        Self::new(1e-8)
    }
}

impl<T: Real> StoppingCriterion<T> for ResidualReductionCriterion<T> {
    fn has_converged(&self, state: &ConvergenceState<T>) -> Result<bool, SolveErrorKind> {
        let r = state.residual_norm;
        if !r.is_finite() {
            return Err(SolveErrorKind::NonFiniteResidual);
        }
        Ok(r <= self.reduction * state.initial_residual_norm || r <= self.abs_tol)
    }
}

/// Relative residual tolerance `||r|| <= tol * ||b||`.
#[derive(Debug, Clone, Copy)]
pub struct RelativeResidualCriterion<T> {
    tol: T,
}

impl<T: Real> RelativeResidualCriterion<T> {
    pub fn new(tol: T) -> Self {
        Self { tol }
    }
}

impl<T: Real> StoppingCriterion<T> for RelativeResidualCriterion<T> {
    fn has_converged(&self, state: &ConvergenceState<T>) -> Result<bool, SolveErrorKind> {
        Ok(state.residual_norm <= self.tol * state.b_norm)
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum SolveErrorKind {
    OperatorError(BoxedError),
    PreconditionerError(BoxedError),
    ScalarProductError(BoxedError),
    IndefiniteOperator,
    IndefinitePreconditioner,
    /// An inner product the method divides by vanished.
    Breakdown,
    NonFiniteResidual,
    MaxIterationsReached { max_iter: usize },
}

impl SolveErrorKind {
    /// Whether the failure came from applying the operator, preconditioner or scalar product,
    /// as opposed to the iteration itself not converging.
    pub fn is_application_error(&self) -> bool {
        matches!(
            self,
            Self::OperatorError(_) | Self::PreconditionerError(_) | Self::ScalarProductError(_)
        )
    }
}

impl fmt::Display for SolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorError(err) => {
                write!(f, "Error applying operator: ")?;
                err.fmt(f)
            }
            Self::PreconditionerError(err) => {
                write!(f, "Error applying preconditioner: ")?;
                err.fmt(f)
            }
            Self::ScalarProductError(err) => {
                write!(f, "Error evaluating scalar product: ")?;
                err.fmt(f)
            }
            Self::IndefiniteOperator => write!(f, "Operator appears to be indefinite"),
            Self::IndefinitePreconditioner => write!(f, "Indefinite preconditioner"),
            Self::Breakdown => write!(f, "Solver breakdown"),
            Self::NonFiniteResidual => write!(f, "Residual norm is not finite"),
            Self::MaxIterationsReached { max_iter } => {
                write!(f, "Max iterations ({}) reached.", max_iter)
            }
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct SolveError<T> {
    pub output: SolverOutput<T>,
    pub kind: SolveErrorKind,
}

impl<T> SolveError<T> {
    pub(crate) fn new(output: SolverOutput<T>, kind: SolveErrorKind) -> Self {
        Self { output, kind }
    }
}

impl<T> fmt::Display for SolveError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Solve failed after {} iterations. ", self.output.num_iterations)?;
        write!(f, "Error: {}", self.kind)
    }
}

impl<T: fmt::Debug> std::error::Error for SolveError<T> {}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SolverOutput<T> {
    /// Number of iterations of the solver.
    pub num_iterations: usize,
    /// Norm of the initial residual.
    pub initial_residual_norm: T,
    /// Norm of the last computed residual.
    pub residual_norm: T,
}

impl<T: Real> SolverOutput<T> {
    pub(crate) fn new() -> Self {
        Self {
            num_iterations: 0,
            initial_residual_norm: T::zero(),
            residual_norm: T::zero(),
        }
    }

    /// Ratio of the final to the initial residual norm.
    pub fn reduction(&self) -> T {
        if self.initial_residual_norm == T::zero() {
            T::zero()
        } else {
            self.residual_norm / self.initial_residual_norm
        }
    }
}

#[derive(Debug)]
pub(crate) enum OwnedOrMutRef<'a, T> {
    Owned(T),
    MutRef(&'a mut T),
}

impl<'a, T> Deref for OwnedOrMutRef<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

impl<'a, T> DerefMut for OwnedOrMutRef<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

/// y = Ax
pub(crate) fn apply_operator<'a, T, A>(
    y: impl Into<DVectorViewMut<'a, T>>,
    a: &'a A,
    x: impl Into<DVectorView<'a, T>>,
) -> Result<(), BoxedError>
where
    T: Scalar,
    A: LinearOperator<T>,
{
    a.apply(y.into(), x.into())
}
