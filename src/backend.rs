//! Distributed linear solves on the overlapping system.
//!
//! The native system of every rank is extended by an algebraic overlap. The Krylov method then
//! runs redundantly on all local DOFs, with every matrix-vector product and preconditioner
//! application followed by a synchronization from the masters, and all scalar products reduced
//! over the mastered DOFs only. With a local preconditioner this is a restricted additive
//! Schwarz method.
use crate::comm::{all_reduce_sum, all_succeeded, Communicator};
use crate::overlap::{BorderListCreator, Overlap};
use crate::overlapping::{sync_blocks, OverlappingMatrix, OverlappingVector};
use crate::settings::{KrylovMethod, LinearSolverSettings};
use crate::{BlockCsrMatrix, BlockVector, Error, Real};
use fvlinear_sparse::bicgstab::BiCgStab;
use fvlinear_sparse::cg::ConjugateGradient;
use fvlinear_sparse::krylov::{BoxedError, ConvergenceState};
use fvlinear_sparse::{
    IdentityOperator, LinearOperator, ResidualReductionCriterion, ScalarProduct, SolveError, SolveErrorKind,
    SolverOutput, SparsityPattern, StoppingCriterion,
};
use nalgebra::{DVectorView, DVectorViewMut};
use std::ops::Deref;
use std::sync::Arc;

mod precond;

pub use precond::{Ilu0Wrapper, JacobiWrapper, PreconditionerWrapper, SorWrapper};

/// What the backend needs to know about the distributed native system.
#[derive(Clone, Copy)]
pub struct SolveContext<'a> {
    pub border_list_creator: &'a dyn BorderListCreator,
    /// Topology sequence number of the grid the native system was built for.
    pub sequence_number: u64,
    pub comm: &'a dyn Communicator,
}

struct OverlappingSystem<T: Real> {
    sequence_number: u64,
    /// Pattern of the native matrix the overlap was derived from.
    native_pattern: Arc<SparsityPattern>,
    matrix: OverlappingMatrix<T>,
    rhs: OverlappingVector<T>,
    solution: OverlappingVector<T>,
}

/// Solves the global system assembled by all ranks.
///
/// Every call is collective. The overlapping structures are kept until the topology changes or
/// [`erase_matrix`](Self::erase_matrix) is called.
pub struct ParallelSolverBackend<T: Real, W> {
    settings: LinearSolverSettings,
    preconditioner: W,
    system: Option<OverlappingSystem<T>>,
}

impl<T: Real, W: PreconditionerWrapper<T>> ParallelSolverBackend<T, W> {
    pub fn new(settings: LinearSolverSettings, preconditioner: W) -> Result<Self, Error> {
        settings.validate()?;
        Ok(Self {
            settings,
            preconditioner,
            system: None,
        })
    }

    pub fn settings(&self) -> &LinearSolverSettings {
        &self.settings
    }

    pub fn preconditioner(&self) -> &W {
        &self.preconditioner
    }

    /// The overlap of the last prepared system.
    pub fn overlap(&self) -> Option<&Arc<Overlap>> {
        self.system.as_ref().map(|system| system.matrix.overlap())
    }

    /// The overlapping matrix of the last prepared system.
    pub fn overlapping_matrix(&self) -> Option<&OverlappingMatrix<T>> {
        self.system.as_ref().map(|system| &system.matrix)
    }

    /// Discards the overlap and all overlapping objects.
    pub fn erase_matrix(&mut self) {
        self.system = None;
    }

    fn ensure_structure(&mut self, native: &BlockCsrMatrix<T>, ctx: &SolveContext) -> Result<&mut OverlappingSystem<T>, Error> {
        let locally_up_to_date = match &self.system {
            Some(system) => {
                system.sequence_number == ctx.sequence_number
                    && system.matrix.overlap().num_native() == native.num_block_rows()
                    && system.matrix.block_size() == native.block_size()
                    && (Arc::ptr_eq(&system.native_pattern, native.pattern())
                        || *system.native_pattern == **native.pattern())
            }
            None => false,
        };
        // Rebuilding is collective, so every rank rebuilds if any rank has to
        if !all_succeeded(ctx.comm, locally_up_to_date)? {
            let border = ctx.border_list_creator.create(ctx.comm)?;
            let overlap = Arc::new(Overlap::build(
                native.pattern(),
                &border,
                self.settings.overlap_size,
                ctx.comm,
            )?);
            log::debug!(
                "Rank {} built overlap with {} domestic and {} overlap DOFs, {} peers",
                overlap.rank(),
                overlap.num_domestic(),
                overlap.num_local() - overlap.num_domestic(),
                overlap.peers().len()
            );
            let block_size = native.block_size();
            self.system = Some(OverlappingSystem {
                sequence_number: ctx.sequence_number,
                native_pattern: Arc::clone(native.pattern()),
                matrix: OverlappingMatrix::zeros(Arc::clone(&overlap), block_size),
                rhs: OverlappingVector::zeros(Arc::clone(&overlap), block_size),
                solution: OverlappingVector::zeros(overlap, block_size),
            });
        }
        self.system
            .as_mut()
            .ok_or_else(|| Error::Structure("Overlapping system is missing".to_string()))
    }

    /// Copies the native matrix into the overlapping matrix and completes the rows of shared and
    /// overlap DOFs from the other ranks. Collective.
    pub fn prepare_matrix(&mut self, native: &BlockCsrMatrix<T>, ctx: &SolveContext) -> Result<(), Error> {
        let system = self.ensure_structure(native, ctx)?;
        system.matrix.assign_from_native(native)?;
        system.matrix.sync_add(ctx.comm)?;
        system.rhs.sync(ctx.comm)
    }

    /// Sums the partial right-hand side entries of shared DOFs across ranks and writes the
    /// globally consistent values back into `rhs`. Collective.
    pub fn prepare_rhs(
        &mut self,
        native: &BlockCsrMatrix<T>,
        rhs: &mut BlockVector<T>,
        ctx: &SolveContext,
    ) -> Result<(), Error> {
        let system = self.ensure_structure(native, ctx)?;
        system.rhs.assign_add_border(rhs, ctx.comm)?;
        system.rhs.assign_to(rhs)
    }

    /// Solves the prepared system and writes the solution of all native DOFs to `x`.
    ///
    /// Returns whether the residual reduction was reached. Collective.
    pub fn solve(&mut self, x: &mut BlockVector<T>, comm: &dyn Communicator) -> Result<bool, Error> {
        let settings = &self.settings;
        let system = self.system.as_mut().ok_or_else(|| {
            Error::Configuration("The matrix must be prepared before solving".to_string())
        })?;
        let overlap = Arc::clone(system.matrix.overlap());
        let block_size = system.matrix.block_size();
        x.fill_zero();
        system.solution.fill_zero();

        let prepared = self.preconditioner.prepare(system.matrix.matrix());
        if let Err(err) = &prepared {
            log::error!("rank {} failed to create the preconditioner: {:#}", comm.rank(), err);
        }
        let preconditioner = CleanupGuard::new(&mut self.preconditioner);
        if !all_succeeded(comm, prepared.is_ok())? {
            return Err(Error::numerical_issue("Creating the preconditioner failed", prepared.err()));
        }

        let operator = OverlappingOperator {
            matrix: system.matrix.matrix(),
            overlap: &overlap,
            comm,
        };
        let scalar_product = OverlappingScalarProduct {
            overlap: &overlap,
            block_size,
            comm,
        };
        let identity = IdentityOperator;
        let local_preconditioner: &dyn LinearOperator<T> = match preconditioner.get() {
            Some(p) => p,
            None => &identity,
        };
        let preconditioner_op = OverlappingPreconditioner {
            local: local_preconditioner,
            overlap: &overlap,
            block_size,
            comm,
        };
        let criterion = ReportingCriterion {
            inner: ResidualReductionCriterion::new(nalgebra::convert(settings.tolerance))
                .with_abs_tol(nalgebra::convert(settings.abs_tolerance)),
            verbose: settings.verbosity >= 2 && comm.rank() == 0,
        };

        let b = system.rhs.values().as_vector();
        let solution = system.solution.values_mut().as_vector_mut();
        let result = match settings.method {
            KrylovMethod::BiCgStab => BiCgStab::new()
                .with_operator(&operator)
                .with_preconditioner(&preconditioner_op)
                .with_scalar_product(&scalar_product)
                .with_stopping_criterion(criterion)
                .with_max_iter(settings.max_iterations)
                .solve_with_guess(b, solution),
            KrylovMethod::Cg => ConjugateGradient::new()
                .with_operator(&operator)
                .with_preconditioner(&preconditioner_op)
                .with_scalar_product(&scalar_product)
                .with_stopping_criterion(criterion)
                .with_max_iter(settings.max_iterations)
                .solve_with_guess(b, solution),
        };
        drop(preconditioner);

        let converged = match result {
            Ok(output) => {
                report(settings, comm, &output, None);
                true
            }
            Err(SolveError { output, kind, .. }) => match kind {
                SolveErrorKind::OperatorError(err)
                | SolveErrorKind::PreconditionerError(err)
                | SolveErrorKind::ScalarProductError(err) => return Err(into_crate_error(err)),
                kind => {
                    report(settings, comm, &output, Some(&kind));
                    false
                }
            },
        };

        system.solution.assign_to(x)?;
        Ok(converged)
    }
}

fn report<T: Real>(
    settings: &LinearSolverSettings,
    comm: &dyn Communicator,
    output: &SolverOutput<T>,
    failure: Option<&SolveErrorKind>,
) {
    if settings.verbosity == 0 || comm.rank() != 0 {
        return;
    }
    match failure {
        None => log::info!(
            "{:?} converged after {} iterations, residual reduction {}",
            settings.method,
            output.num_iterations,
            output.reduction()
        ),
        Some(kind) => log::info!(
            "{:?} did not converge after {} iterations, residual reduction {}: {}",
            settings.method,
            output.num_iterations,
            output.reduction(),
            kind
        ),
    }
}

fn into_crate_error(err: BoxedError) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(err) => Error::numerical_issue("Applying the linear solver failed", Some(eyre::eyre!(err))),
    }
}

/// Calls [`PreconditionerWrapper::cleanup`] when the solve ends, however it ends.
struct CleanupGuard<'a, T: Real, W: PreconditionerWrapper<T>> {
    wrapper: &'a mut W,
    marker: std::marker::PhantomData<T>,
}

impl<'a, T: Real, W: PreconditionerWrapper<T>> CleanupGuard<'a, T, W> {
    fn new(wrapper: &'a mut W) -> Self {
        Self {
            wrapper,
            marker: std::marker::PhantomData,
        }
    }
}

impl<'a, T: Real, W: PreconditionerWrapper<T>> Deref for CleanupGuard<'a, T, W> {
    type Target = W;

    fn deref(&self) -> &W {
        self.wrapper
    }
}

impl<'a, T: Real, W: PreconditionerWrapper<T>> Drop for CleanupGuard<'a, T, W> {
    fn drop(&mut self) {
        self.wrapper.cleanup();
    }
}

fn sync_view<T: Real>(
    overlap: &Overlap,
    comm: &dyn Communicator,
    mut y: DVectorViewMut<T>,
    block_size: usize,
) -> Result<(), BoxedError> {
    sync_blocks(overlap, comm, y.as_mut_slice(), block_size).map_err(|err| Box::new(err) as BoxedError)
}

/// `y = A x` on all local DOFs, with the copies overwritten by their masters.
struct OverlappingOperator<'a, T: Real> {
    matrix: &'a BlockCsrMatrix<T>,
    overlap: &'a Overlap,
    comm: &'a dyn Communicator,
}

impl<'a, T: Real> LinearOperator<T> for OverlappingOperator<'a, T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError> {
        let n = y.len();
        self.matrix.spmv(y.rows_mut(0, n), x);
        sync_view(self.overlap, self.comm, y, self.matrix.block_size())
    }
}

/// Applies the local preconditioner and synchronizes the result.
struct OverlappingPreconditioner<'a, T: Real> {
    local: &'a dyn LinearOperator<T>,
    overlap: &'a Overlap,
    block_size: usize,
    comm: &'a dyn Communicator,
}

impl<'a, T: Real> LinearOperator<T> for OverlappingPreconditioner<'a, T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), BoxedError> {
        let n = y.len();
        self.local.apply(y.rows_mut(0, n), x)?;
        sync_view(self.overlap, self.comm, y, self.block_size)
    }
}

/// Euclidean product over the DOFs mastered by each rank, summed over all ranks.
struct OverlappingScalarProduct<'a> {
    overlap: &'a Overlap,
    block_size: usize,
    comm: &'a dyn Communicator,
}

impl<'a, T: Real> ScalarProduct<T> for OverlappingScalarProduct<'a> {
    fn dot(&self, x: DVectorView<T>, y: DVectorView<T>) -> Result<T, BoxedError> {
        let b = self.block_size;
        let mut local = T::zero();
        for i in (0..self.overlap.num_local()).filter(|&i| self.overlap.is_master(i)) {
            local += x.rows(i * b, b).dot(&y.rows(i * b, b));
        }
        all_reduce_sum(self.comm, local).map_err(|err| Box::new(err) as BoxedError)
    }
}

/// Residual reduction criterion that logs every iteration.
#[derive(Clone, Copy)]
struct ReportingCriterion<T> {
    inner: ResidualReductionCriterion<T>,
    verbose: bool,
}

impl<T: Real> StoppingCriterion<T> for ReportingCriterion<T> {
    fn has_converged(&self, state: &ConvergenceState<T>) -> Result<bool, SolveErrorKind> {
        if self.verbose {
            log::info!("iteration {}: residual norm {}", state.iteration, state.residual_norm);
        }
        self.inner.has_converged(state)
    }
}
