//! Contracts of the collaborators that supply the physics: element kernels, the problem and
//! auxiliary equations.
use crate::context::ElementContext;
use crate::{BlockCsrMatrix, BlockVector, Real};
use eyre::WrapErr;
use nalgebra::{DMatrix, DMatrixView, DVector, DVectorView};
use std::collections::BTreeSet;

/// Computes the residual and Jacobian contributions of a single element.
///
/// After a successful [`linearize`](Self::linearize), `residual(i)` is the residual block of the
/// `i`-th primary DOF of the context's stencil, and `jacobian(i, j)` its derivative with respect
/// to the primary variables of the `j`-th stencil DOF. Both must be pure functions of the context
/// state passed to `linearize`.
///
/// Every worker thread owns its own clone of the kernel.
pub trait LocalLinearizer<T: Real>: Send + Clone {
    /// Number of equations per DOF.
    fn num_eq(&self) -> usize;

    /// Linearizes the element described by `context`.
    ///
    /// The context may be modified temporarily, but must be restored before returning.
    fn linearize(&mut self, context: &mut ElementContext<T>) -> eyre::Result<()>;

    fn residual(&self, primary_dof: usize) -> DVectorView<T>;

    fn jacobian(&self, primary_dof: usize, dof: usize) -> DMatrixView<T>;
}

/// The residual of a single element, without derivatives.
pub trait LocalResidual<T: Real>: Send + Clone {
    fn num_eq(&self) -> usize;

    /// Writes one residual block per primary DOF of the context's stencil into `residual`.
    ///
    /// `residual` is sized and zeroed by the caller.
    fn evaluate(&self, context: &ElementContext<T>, residual: &mut BlockVector<T>) -> eyre::Result<()>;
}

/// Linearizes a [`LocalResidual`] by forward finite differences.
///
/// Each primary variable `x` is perturbed by `epsilon * max(|x|, 1)`.
#[derive(Debug, Clone)]
pub struct FiniteDifferenceLinearizer<T: Real, R> {
    local_residual: R,
    epsilon: T,
    residual: BlockVector<T>,
    perturbed_residual: BlockVector<T>,
    jacobian: DMatrix<T>,
}

impl<T: Real, R: LocalResidual<T>> FiniteDifferenceLinearizer<T, R> {
    pub fn new(local_residual: R) -> Self {
        let num_eq = local_residual.num_eq();
        Self {
            local_residual,
            epsilon: T::default_epsilon().sqrt(),
            residual: BlockVector::zeros(0, num_eq),
            perturbed_residual: BlockVector::zeros(0, num_eq),
            jacobian: DMatrix::zeros(0, 0),
        }
    }

    pub fn with_epsilon(self, epsilon: T) -> Self {
        Self { epsilon, ..self }
    }

    pub fn local_residual(&self) -> &R {
        &self.local_residual
    }
}

impl<T: Real, R: LocalResidual<T>> LocalLinearizer<T> for FiniteDifferenceLinearizer<T, R> {
    fn num_eq(&self) -> usize {
        self.local_residual.num_eq()
    }

    fn linearize(&mut self, context: &mut ElementContext<T>) -> eyre::Result<()> {
        let num_eq = self.num_eq();
        let num_primary = context.num_primary();
        let num_dofs = context.num_dofs();

        if self.residual.num_blocks() != num_primary {
            self.residual = BlockVector::zeros(num_primary, num_eq);
            self.perturbed_residual = BlockVector::zeros(num_primary, num_eq);
        }
        self.jacobian
            .resize_mut(num_primary * num_eq, num_dofs * num_eq, T::zero());

        self.residual.fill_zero();
        self.local_residual
            .evaluate(context, &mut self.residual)
            .wrap_err("Failed to evaluate unperturbed local residual")?;

        for dof in 0..num_dofs {
            for eq in 0..num_eq {
                let x = context.primary_vars(0, dof)[eq];
                let h = self.epsilon * x.abs().max(T::one());
                context.primary_vars_mut(0, dof)[eq] = x + h;

                self.perturbed_residual.fill_zero();
                let result = self
                    .local_residual
                    .evaluate(context, &mut self.perturbed_residual);
                context.primary_vars_mut(0, dof)[eq] = x;
                result.wrap_err_with(|| format!("Failed to evaluate local residual perturbed at DOF {}", dof))?;

                let mut column = self.jacobian.column_mut(dof * num_eq + eq);
                column.copy_from(self.perturbed_residual.as_vector());
                column -= self.residual.as_vector();
                column /= h;
            }
        }
        Ok(())
    }

    fn residual(&self, primary_dof: usize) -> DVectorView<T> {
        self.residual.block(primary_dof)
    }

    fn jacobian(&self, primary_dof: usize, dof: usize) -> DMatrixView<T> {
        let num_eq = self.num_eq();
        self.jacobian
            .view((primary_dof * num_eq, dof * num_eq), (num_eq, num_eq))
    }
}

/// A fixed value of the primary variables of one DOF.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint<T: Real> {
    pub values: DVector<T>,
}

impl<T: Real> Constraint<T> {
    pub fn new(values: DVector<T>) -> Self {
        Self { values }
    }
}

/// The problem being solved, as far as the linearizer is concerned.
pub trait Problem<T: Real>: Sync {
    /// Returns the constraint of the given primary DOF of the context's element, if any.
    fn constraints(&self, _context: &ElementContext<T>, _primary_dof: usize, _time_idx: usize) -> Option<Constraint<T>> {
        None
    }

    /// Hint that `element` will be linearized soon.
    fn prefetch(&self, _element: usize) {}
}

/// A problem without constraints.
#[derive(Debug, Default, Copy, Clone)]
pub struct Unconstrained;

impl<T: Real> Problem<T> for Unconstrained {}

/// Equations outside of the grid, e.g. wells, coupling to existing DOFs and possibly owning
/// additional DOFs of their own.
///
/// The DOFs of a module are numbered consecutively from its DOF offset, which the linearizer
/// assigns after all grid DOFs and the DOFs of previously registered modules.
pub trait AuxiliaryModule<T: Real>: Send {
    fn num_dofs(&self) -> usize;

    fn set_dof_offset(&mut self, offset: usize);

    fn dof_offset(&self) -> usize;

    /// Adds the couplings of the module's equations to the per-DOF neighbor sets.
    fn add_neighbors(&self, neighbors: &mut [BTreeSet<usize>]);

    /// Adds the module's contributions directly to the global system.
    fn linearize(
        &mut self,
        solution: &BlockVector<T>,
        matrix: &mut BlockCsrMatrix<T>,
        residual: &mut BlockVector<T>,
    ) -> eyre::Result<()>;
}
