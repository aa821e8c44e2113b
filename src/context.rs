//! Per-worker scratch state for evaluating single elements.
use crate::grid::{ElementStencil, GridView};
use crate::local::LocalLinearizer;
use crate::{BlockVector, Real};
use nalgebra::{DVectorView, DVectorViewMut};
use parking_lot::{Mutex, MutexGuard};

/// Everything a local kernel needs to know about one element: its stencil, geometry and the
/// primary variables of all stencil DOFs at every stored time level.
///
/// Time level 0 is the current solution, level 1 the solution at the beginning of the time step.
#[derive(Debug, Clone)]
pub struct ElementContext<T: Real> {
    stencil: ElementStencil<T>,
    primary_vars: Vec<BlockVector<T>>,
    time_step_size: T,
    num_eq: usize,
}

impl<T: Real> ElementContext<T> {
    pub fn new(num_eq: usize) -> Self {
        Self {
            stencil: ElementStencil::default(),
            primary_vars: Vec::new(),
            time_step_size: T::zero(),
            num_eq,
        }
    }

    /// Binds the context to `element`, gathering its stencil and the stencil's primary variables
    /// from every entry of `solution_history`.
    pub fn update(
        &mut self,
        grid: &dyn GridView<T>,
        element: usize,
        solution_history: &[BlockVector<T>],
        time_step_size: T,
    ) {
        grid.populate_stencil(element, &mut self.stencil);
        self.time_step_size = time_step_size;

        let num_dofs = self.stencil.num_dofs();
        self.primary_vars
            .resize_with(solution_history.len(), || BlockVector::zeros(0, self.num_eq));
        for (vars, solution) in self.primary_vars.iter_mut().zip(solution_history) {
            if vars.num_blocks() != num_dofs {
                *vars = BlockVector::zeros(num_dofs, self.num_eq);
            }
            for (local, &dof) in self.stencil.dofs().iter().enumerate() {
                vars.block_mut(local).copy_from(&solution.block(dof));
            }
        }
    }

    pub fn element(&self) -> usize {
        self.stencil.element()
    }

    pub fn stencil(&self) -> &ElementStencil<T> {
        &self.stencil
    }

    pub fn num_eq(&self) -> usize {
        self.num_eq
    }

    pub fn num_primary(&self) -> usize {
        self.stencil.num_primary()
    }

    pub fn num_dofs(&self) -> usize {
        self.stencil.num_dofs()
    }

    /// Process-wide DOF index of a stencil DOF.
    pub fn global_dof(&self, local_dof: usize) -> usize {
        self.stencil.dofs()[local_dof]
    }

    pub fn history_size(&self) -> usize {
        self.primary_vars.len()
    }

    pub fn time_step_size(&self) -> T {
        self.time_step_size
    }

    pub fn primary_vars(&self, time_idx: usize, local_dof: usize) -> DVectorView<T> {
        self.primary_vars[time_idx].block(local_dof)
    }

    pub fn primary_vars_mut(&mut self, time_idx: usize, local_dof: usize) -> DVectorViewMut<T> {
        self.primary_vars[time_idx].block_mut(local_dof)
    }
}

/// The state owned by a single worker thread.
#[derive(Debug)]
pub(crate) struct WorkerSlot<T: Real, K> {
    pub context: ElementContext<T>,
    pub kernel: K,
}

/// One [`WorkerSlot`] per worker of a thread pool, indexed by worker index.
///
/// Each slot is only ever locked by the worker it belongs to, so the locks are uncontended.
#[derive(Debug)]
pub(crate) struct ContextPool<T: Real, K> {
    slots: Vec<Mutex<WorkerSlot<T, K>>>,
}

impl<T: Real, K: LocalLinearizer<T>> ContextPool<T, K> {
    pub fn new(num_workers: usize, prototype: &K) -> Self {
        let slots = (0..num_workers)
            .map(|_| {
                Mutex::new(WorkerSlot {
                    context: ElementContext::new(prototype.num_eq()),
                    kernel: prototype.clone(),
                })
            })
            .collect();
        Self { slots }
    }

    pub fn num_workers(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, worker: usize) -> MutexGuard<'_, WorkerSlot<T, K>> {
        self.slots[worker].lock()
    }
}
