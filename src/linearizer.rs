//! Parallel assembly of the global Jacobian and residual.
use crate::comm::{all_succeeded, Communicator};
use crate::context::{ContextPool, ElementContext, WorkerSlot};
use crate::grid::{GridView, PartitionType};
use crate::local::{AuxiliaryModule, Constraint, LocalLinearizer, Problem};
use crate::settings::LinearizerSettings;
use crate::sparsity::{build_linear_system, num_total_dofs, LinearSystem};
use crate::{BlockCsrMatrix, BlockVector, Error, Real};
use eyre::{eyre, WrapErr};
use fvlinear_sparse::parallel::{ParallelBlockAccess, ParallelRowAccess};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// The state of the model that a linearization round is evaluated for.
pub struct ModelState<'a, T: Real> {
    pub grid: &'a dyn GridView<T>,
    pub problem: &'a dyn Problem<T>,
    pub comm: &'a dyn Communicator,
    /// Solution at every stored time level, starting with the current iterate. Each vector has
    /// one block per grid and auxiliary DOF.
    pub solution: &'a mut [BlockVector<T>],
    pub time_step_size: T,
    /// Index of the Newton iteration within the current time step.
    pub newton_iteration: usize,
}

/// Assembles the global Jacobian and residual from per-element contributions on a pool of
/// worker threads.
///
/// The linear system is allocated on the first linearization and kept for as long as the grid
/// topology does not change. Each worker owns an [`ElementContext`] and a clone of the kernel
/// prototype for the lifetime of the linearizer.
pub struct Linearizer<T: Real, K> {
    settings: LinearizerSettings,
    prototype: K,
    pool: ThreadPool,
    workers: Option<ContextPool<T, K>>,
    system: Option<LinearSystem<T>>,
    /// Whether the system holds the result of a successful round.
    consistent: bool,
    constraints: BTreeMap<usize, Constraint<T>>,
    auxiliary_modules: Vec<Box<dyn AuxiliaryModule<T>>>,
}

impl<T: Real, K: LocalLinearizer<T>> Linearizer<T, K> {
    pub fn new(prototype: K, settings: LinearizerSettings) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.num_threads.unwrap_or(0))
            .thread_name(|idx| format!("fvlinear-worker-{}", idx))
            .build()
            .map_err(|err| Error::Configuration(format!("Failed to create worker pool: {}", err)))?;
        Ok(Self {
            settings,
            prototype,
            pool,
            workers: None,
            system: None,
            consistent: false,
            constraints: BTreeMap::new(),
            auxiliary_modules: Vec::new(),
        })
    }

    pub fn settings(&self) -> &LinearizerSettings {
        &self.settings
    }

    pub fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Registers an auxiliary module. The structure of the system is rebuilt on the next
    /// linearization.
    pub fn add_auxiliary_module(&mut self, module: Box<dyn AuxiliaryModule<T>>) {
        self.auxiliary_modules.push(module);
        self.erase_matrix();
    }

    pub fn num_auxiliary_modules(&self) -> usize {
        self.auxiliary_modules.len()
    }

    pub fn auxiliary_module(&self, idx: usize) -> Option<&dyn AuxiliaryModule<T>> {
        self.auxiliary_modules.get(idx).map(|module| module.as_ref())
    }

    pub fn auxiliary_module_mut(&mut self, idx: usize) -> Option<&mut (dyn AuxiliaryModule<T> + 'static)> {
        self.auxiliary_modules.get_mut(idx).map(|module| module.as_mut())
    }

    /// The Jacobian of the last linearization, or `None` if there was none or it failed.
    pub fn matrix(&self) -> Option<&BlockCsrMatrix<T>> {
        self.system().map(|system| &system.matrix)
    }

    pub fn residual(&self) -> Option<&BlockVector<T>> {
        self.system().map(|system| &system.residual)
    }

    pub fn system(&self) -> Option<&LinearSystem<T>> {
        self.system.as_ref().filter(|_| self.consistent)
    }

    /// Discards the linear system, forcing its structure to be rebuilt on the next linearization.
    pub fn erase_matrix(&mut self) {
        self.system = None;
    }

    /// Constraints of the current time step, by DOF.
    pub fn constraints_map(&self) -> &BTreeMap<usize, Constraint<T>> {
        &self.constraints
    }

    /// Linearizes the grid and then the auxiliary equations.
    pub fn linearize(&mut self, model: &mut ModelState<'_, T>) -> Result<(), Error> {
        self.linearize_domain(model)?;
        self.linearize_auxiliary_equations(model)
    }

    /// Recomputes the Jacobian and residual of all grid elements for the current solution.
    ///
    /// Collective: returns [`Error::NumericalIssue`] on every rank if linearization failed on
    /// any rank. The system must not be used after a failed round.
    pub fn linearize_domain(&mut self, model: &mut ModelState<'_, T>) -> Result<(), Error> {
        self.prepare_system(model.grid)?;
        self.check_solution(model.grid, model.solution)?;

        let outcome = self.update_constraints(model).and_then(|_| {
            self.apply_constraints_to_solution(model.solution);
            self.linearize_elements(model.grid, model.problem, model.solution, model.time_step_size)
        });

        if let Err(err) = &outcome {
            log::error!(
                "rank {} caught an exception while linearizing: {:#}",
                model.comm.rank(),
                err
            );
        }
        if !all_succeeded(model.comm, outcome.is_ok())? {
            return Err(Error::numerical_issue(
                "A process did not succeed in linearizing the system",
                outcome.err(),
            ));
        }

        self.apply_constraints_to_linearization();
        self.consistent = true;
        Ok(())
    }

    /// Lets every auxiliary module add its contributions to the system.
    ///
    /// The outcome of every module is reduced across all ranks before the next one runs.
    pub fn linearize_auxiliary_equations(&mut self, model: &mut ModelState<'_, T>) -> Result<(), Error> {
        if self.auxiliary_modules.is_empty() {
            return Ok(());
        }
        // Without a domain round the system only holds auxiliary contributions and stays
        // inconsistent
        if self.system.is_none() {
            self.prepare_system(model.grid)?;
        }
        let system = self
            .system
            .as_mut()
            .ok_or_else(|| Error::Structure("The linear system has not been allocated".to_string()))?;
        let solution = model
            .solution
            .first()
            .ok_or_else(|| Error::Structure("The solution history is empty".to_string()))?;

        for (idx, module) in self.auxiliary_modules.iter_mut().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                module.linearize(solution, &mut system.matrix, &mut system.residual)
            }))
            .unwrap_or_else(|payload| Err(panic_report(payload)))
            .wrap_err_with(|| format!("Auxiliary module {} failed", idx));

            if let Err(err) = &outcome {
                log::error!(
                    "rank {} caught an exception while linearizing an auxiliary equation: {:#}",
                    model.comm.rank(),
                    err
                );
            }
            if !all_succeeded(model.comm, outcome.is_ok())? {
                self.consistent = false;
                return Err(Error::numerical_issue(
                    "Linearization of an auxiliary equation failed",
                    outcome.err(),
                ));
            }
        }
        Ok(())
    }

    /// Rebuilds the system if it is missing or the topology changed, and zeroes it otherwise.
    fn prepare_system(&mut self, grid: &dyn GridView<T>) -> Result<(), Error> {
        let up_to_date = matches!(
            &self.system,
            Some(system) if system.sequence_number == grid.sequence_number()
        );
        self.consistent = false;
        if up_to_date {
            if let Some(system) = self.system.as_mut() {
                system.fill_zero();
            }
        } else {
            self.system = None;
            let num_eq = self.prototype.num_eq();
            let system = build_linear_system(grid, &mut self.auxiliary_modules, num_eq)?;
            if !system.primary_rows_disjoint && !self.settings.use_linearization_lock {
                log::warn!("Elements share primary DOFs; serializing accumulation behind the linearization lock");
            }
            self.system = Some(system);
        }
        if self.workers.is_none() {
            self.workers = Some(ContextPool::new(self.num_workers(), &self.prototype));
        }
        Ok(())
    }

    fn check_solution(&self, grid: &dyn GridView<T>, solution: &[BlockVector<T>]) -> Result<(), Error> {
        let num_dofs = num_total_dofs(grid, &self.auxiliary_modules);
        let num_eq = self.prototype.num_eq();
        if solution.is_empty() {
            return Err(Error::Structure("The solution history is empty".to_string()));
        }
        for (time_idx, vector) in solution.iter().enumerate() {
            if vector.num_blocks() != num_dofs || vector.block_size() != num_eq {
                return Err(Error::Structure(format!(
                    "Solution at time level {} has {} blocks of size {}, expected {} blocks of size {}",
                    time_idx,
                    vector.num_blocks(),
                    vector.block_size(),
                    num_dofs,
                    num_eq
                )));
            }
        }
        Ok(())
    }

    /// Queries the problem for the constraints of all primary DOFs. Constraints only change
    /// between time steps, so this only happens on the first Newton iteration.
    fn update_constraints(&mut self, model: &ModelState<'_, T>) -> eyre::Result<()> {
        if !self.settings.enable_constraints || model.newton_iteration != 0 {
            return Ok(());
        }
        self.constraints.clear();
        let workers = self
            .workers
            .as_ref()
            .ok_or_else(|| eyre!("Worker contexts have not been allocated"))?;
        let (grid, problem, time_step_size) = (model.grid, model.problem, model.time_step_size);
        let solution: &[BlockVector<T>] = model.solution;
        let settings = &self.settings;
        let num_eq = self.prototype.num_eq();
        let found = Mutex::new(Vec::new());

        for_each_element(&self.pool, grid.num_elements(), |worker, element| {
            if !is_linearized(settings, grid, element) {
                return Ok(());
            }
            let mut slot = workers.slot(worker);
            let context = &mut slot.context;
            context.update(grid, element, solution, time_step_size);
            let mut local = Vec::new();
            for primary in 0..context.num_primary() {
                if let Some(constraint) = problem.constraints(context, primary, 0) {
                    let dof = context.global_dof(primary);
                    if constraint.values.len() != num_eq {
                        return Err(eyre!(
                            "Constraint of DOF {} has {} values, expected {}",
                            dof,
                            constraint.values.len(),
                            num_eq
                        ));
                    }
                    local.push((dof, constraint));
                }
            }
            found.lock().append(&mut local);
            Ok(())
        })?;

        let mut found = found.into_inner();
        found.sort_by_key(|(dof, _)| *dof);
        self.constraints.extend(found);
        log::debug!("Found {} constrained DOFs", self.constraints.len());
        Ok(())
    }

    fn apply_constraints_to_solution(&self, solution: &mut [BlockVector<T>]) {
        for (&dof, constraint) in &self.constraints {
            for vector in solution.iter_mut().take(2) {
                vector.block_mut(dof).copy_from(&constraint.values);
            }
        }
    }

    fn apply_constraints_to_linearization(&mut self) {
        if let Some(system) = self.system.as_mut() {
            for &dof in self.constraints.keys() {
                let mut row = system.matrix.row_mut(dof);
                row.fill_zero();
                if let Some(mut diagonal) = row.block_mut_for_col(dof) {
                    diagonal.fill_with_identity();
                }
                system.residual.block_mut(dof).fill(T::zero());
            }
        }
    }

    fn linearize_elements(
        &mut self,
        grid: &dyn GridView<T>,
        problem: &dyn Problem<T>,
        solution: &[BlockVector<T>],
        time_step_size: T,
    ) -> eyre::Result<()> {
        let settings = &self.settings;
        let workers = self
            .workers
            .as_ref()
            .ok_or_else(|| eyre!("Worker contexts have not been allocated"))?;
        let system = self
            .system
            .as_mut()
            .ok_or_else(|| eyre!("The linear system has not been allocated"))?;
        let use_lock = settings.use_linearization_lock || !system.primary_rows_disjoint;
        let accumulator = Accumulator::new(&mut system.matrix, &mut system.residual, use_lock);

        let should_linearize = |element| is_linearized(settings, grid, element);
        let prefetch = |element| {
            if should_linearize(element) {
                problem.prefetch(element);
            }
        };

        for_each_element_with_prefetch(&self.pool, grid.num_elements(), prefetch, |worker, element| {
            if !should_linearize(element) {
                return Ok(());
            }
            let mut slot = workers.slot(worker);
            let WorkerSlot { context, kernel } = &mut *slot;
            context.update(grid, element, solution, time_step_size);
            kernel
                .linearize(context)
                .wrap_err_with(|| format!("Failed to linearize element {}", element))?;
            accumulator.accumulate(context, kernel)
        })
    }
}

fn is_linearized<T: Real>(settings: &LinearizerSettings, grid: &dyn GridView<T>, element: usize) -> bool {
    settings.linearize_non_local_elements || grid.partition_type(element) == PartitionType::Interior
}

/// Runs `f(worker, element)` for every element on all workers of `pool`.
///
/// Workers claim elements from a shared cursor. The first fault (error or panic) is kept and
/// stops the claiming of further elements; concurrent faults on other workers are discarded.
fn for_each_element<F>(pool: &ThreadPool, num_elements: usize, f: F) -> eyre::Result<()>
where
    F: Fn(usize, usize) -> eyre::Result<()> + Sync,
{
    for_each_element_with_prefetch(pool, num_elements, |_| {}, f)
}

fn for_each_element_with_prefetch<P, F>(pool: &ThreadPool, num_elements: usize, prefetch: P, f: F) -> eyre::Result<()>
where
    P: Fn(usize) + Sync,
    F: Fn(usize, usize) -> eyre::Result<()> + Sync,
{
    let cursor = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let fault: Mutex<Option<eyre::Report>> = Mutex::new(None);

    pool.broadcast(|broadcast| {
        let worker = broadcast.index();
        let outcome = catch_unwind(AssertUnwindSafe(|| -> eyre::Result<()> {
            let mut next = cursor.fetch_add(1, Ordering::Relaxed);
            while next < num_elements && !stop.load(Ordering::Relaxed) {
                let element = next;
                next = cursor.fetch_add(1, Ordering::Relaxed);
                if next < num_elements {
                    prefetch(next);
                }
                f(worker, element)?;
            }
            Ok(())
        }))
        .unwrap_or_else(|payload| Err(panic_report(payload)));

        if let Err(err) = outcome {
            stop.store(true, Ordering::Relaxed);
            let mut fault = fault.lock();
            if fault.is_none() {
                *fault = Some(err);
            }
        }
    });

    match fault.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn panic_report(payload: Box<dyn Any + Send>) -> eyre::Report {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    eyre!("Panicked: {}", message)
}

/// Adds local contributions to the global system from several threads at once.
enum Accumulator<'a, T: Real> {
    /// Rows are written without synchronization. Only sound if no two elements share a primary DOF.
    Disjoint {
        rows: ParallelRowAccess<'a, T>,
        residual: ParallelBlockAccess<'a, T>,
    },
    Locked(Mutex<(&'a mut BlockCsrMatrix<T>, &'a mut BlockVector<T>)>),
}

impl<'a, T: Real> Accumulator<'a, T> {
    fn new(matrix: &'a mut BlockCsrMatrix<T>, residual: &'a mut BlockVector<T>, use_lock: bool) -> Self {
        if use_lock {
            Self::Locked(Mutex::new((matrix, residual)))
        } else {
            Self::Disjoint {
                rows: ParallelRowAccess::new(matrix),
                residual: ParallelBlockAccess::new(residual),
            }
        }
    }

    fn accumulate<K: LocalLinearizer<T>>(&self, context: &ElementContext<T>, kernel: &K) -> eyre::Result<()> {
        match self {
            Self::Disjoint { rows, residual } => {
                for i in 0..context.num_primary() {
                    let dof = context.global_dof(i);
                    // SAFETY: the sets of primary DOFs of all elements are pairwise disjoint,
                    // so no other worker accesses this row or residual block.
                    let mut row = unsafe { rows.row_mut(dof) };
                    let mut residual_block = unsafe { residual.block_mut(dof) };
                    add_contribution(context, kernel, i, &mut row, &mut residual_block)?;
                }
            }
            Self::Locked(system) => {
                let mut guard = system.lock();
                let (matrix, residual) = &mut *guard;
                for i in 0..context.num_primary() {
                    let dof = context.global_dof(i);
                    let mut residual_block = residual.block_mut(dof);
                    add_contribution(context, kernel, i, &mut matrix.row_mut(dof), &mut residual_block)?;
                }
            }
        }
        Ok(())
    }
}

fn add_contribution<T: Real, K: LocalLinearizer<T>>(
    context: &ElementContext<T>,
    kernel: &K,
    primary: usize,
    row: &mut fvlinear_sparse::BlockRowMut<'_, T>,
    residual: &mut nalgebra::DVectorViewMut<'_, T>,
) -> eyre::Result<()> {
    *residual += kernel.residual(primary);
    for j in 0..context.num_dofs() {
        let col = context.global_dof(j);
        let mut block = row.block_mut_for_col(col).ok_or_else(|| {
            eyre!(
                "Coupling between DOFs {} and {} is missing from the sparsity pattern",
                context.global_dof(primary),
                col
            )
        })?;
        block += kernel.jacobian(primary, j);
    }
    Ok(())
}
