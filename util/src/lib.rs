//! Test fixtures: a two-point flux diffusion model on the structured grid, problems with
//! boundary constraints, misbehaving kernels and in-process ranks.
use eyre::eyre;
use fvlinear::comm::ThreadComm;
use fvlinear::context::ElementContext;
use fvlinear::grid::{ElementStencil, GridView, PartitionType, StructuredGrid};
use fvlinear::local::{AuxiliaryModule, Constraint, LocalLinearizer, LocalResidual, Problem};
use fvlinear::{BlockCsrMatrix, BlockVector, Real};
use nalgebra::{DMatrix, DMatrixView, DVector, DVectorView};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Poor man's approx assertion for matrices
#[macro_export]
macro_rules! assert_approx_matrix_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let diff = $x - $y;

        let max_absdiff = diff.abs().max();
        let approx_eq = max_absdiff <= $tol;

        if !approx_eq {
            println!("abstol: {:e}", $tol);
            println!("left: {}", $x);
            println!("right: {}", $y);
            println!("diff: {:e}", diff);
        }
        assert!(approx_eq);
    }};
}

/// Residual of `-div(grad u) + reaction * u^3 = source` for every component, discretized by
/// two-point fluxes. Components are decoupled.
fn tpfa_residual<T: Real>(context: &ElementContext<T>, num_eq: usize, source: T, reaction: T, residual: &mut DVector<T>) {
    let volume = context.stencil().volume(0);
    for eq in 0..num_eq {
        let u = context.primary_vars(0, 0)[eq];
        let mut r = volume * (reaction * u * u * u - source);
        for face in context.stencil().faces() {
            let u_ext = context.primary_vars(0, face.exterior)[eq];
            r += face.transmissibility * (u - u_ext);
        }
        residual[eq] = r;
    }
}

/// Analytically linearized two-point flux diffusion with an optional cubic reaction term.
#[derive(Debug, Clone)]
pub struct TpfaDiffusion<T: Real> {
    num_eq: usize,
    source: T,
    reaction: T,
    residual: DVector<T>,
    /// One `num_eq x num_eq` block per stencil DOF, side by side.
    jacobian: DMatrix<T>,
}

impl<T: Real> TpfaDiffusion<T> {
    pub fn new(num_eq: usize) -> Self {
        Self {
            num_eq,
            source: T::zero(),
            reaction: T::zero(),
            residual: DVector::zeros(num_eq),
            jacobian: DMatrix::zeros(num_eq, 0),
        }
    }

    pub fn with_source(self, source: T) -> Self {
        Self { source, ..self }
    }

    pub fn with_reaction(self, reaction: T) -> Self {
        Self { reaction, ..self }
    }
}

impl<T: Real> LocalLinearizer<T> for TpfaDiffusion<T> {
    fn num_eq(&self) -> usize {
        self.num_eq
    }

    fn linearize(&mut self, context: &mut ElementContext<T>) -> eyre::Result<()> {
        let n = self.num_eq;
        tpfa_residual(context, n, self.source, self.reaction, &mut self.residual);
        self.jacobian = DMatrix::zeros(n, n * context.num_dofs());
        let volume = context.stencil().volume(0);
        let three = T::one() + T::one() + T::one();
        for eq in 0..n {
            let u = context.primary_vars(0, 0)[eq];
            self.jacobian[(eq, eq)] += three * volume * self.reaction * u * u;
            for face in context.stencil().faces() {
                self.jacobian[(eq, eq)] += face.transmissibility;
                self.jacobian[(eq, face.exterior * n + eq)] -= face.transmissibility;
            }
        }
        Ok(())
    }

    fn residual(&self, _primary_dof: usize) -> DVectorView<T> {
        self.residual.rows(0, self.num_eq)
    }

    fn jacobian(&self, _primary_dof: usize, dof: usize) -> DMatrixView<T> {
        self.jacobian.view((0, dof * self.num_eq), (self.num_eq, self.num_eq))
    }
}

/// The residual of [`TpfaDiffusion`], for linearization by finite differences.
#[derive(Debug, Clone)]
pub struct TpfaResidual<T: Real> {
    pub num_eq: usize,
    pub source: T,
    pub reaction: T,
}

impl<T: Real> LocalResidual<T> for TpfaResidual<T> {
    fn num_eq(&self) -> usize {
        self.num_eq
    }

    fn evaluate(&self, context: &ElementContext<T>, residual: &mut BlockVector<T>) -> eyre::Result<()> {
        let mut block = DVector::zeros(self.num_eq);
        tpfa_residual(context, self.num_eq, self.source, self.reaction, &mut block);
        residual.block_mut(0).copy_from(&block);
        Ok(())
    }
}

/// How a [`FaultyKernel`] misbehaves.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    Error,
    Panic,
    /// Returns an error on the element and on every element after it.
    ErrorFromElement,
}

/// Delegates to [`TpfaDiffusion`], but fails on one element or a range of them.
#[derive(Debug, Clone)]
pub struct FaultyKernel<T: Real> {
    pub inner: TpfaDiffusion<T>,
    pub element: usize,
    pub fault: Fault,
}

impl<T: Real> LocalLinearizer<T> for FaultyKernel<T> {
    fn num_eq(&self) -> usize {
        self.inner.num_eq()
    }

    fn linearize(&mut self, context: &mut ElementContext<T>) -> eyre::Result<()> {
        let element = context.element();
        match self.fault {
            Fault::Error if element == self.element => eyre::bail!("negative saturation in element {}", element),
            Fault::Panic if element == self.element => panic!("kernel blew up in element {}", element),
            Fault::ErrorFromElement if element >= self.element => {
                eyre::bail!("negative saturation in element {}", element)
            }
            _ => self.inner.linearize(context),
        }
    }

    fn residual(&self, primary_dof: usize) -> DVectorView<T> {
        self.inner.residual(primary_dof)
    }

    fn jacobian(&self, primary_dof: usize, dof: usize) -> DMatrixView<T> {
        self.inner.jacobian(primary_dof, dof)
    }
}

/// `u(x, y) = a + b x + c y`, which two-point fluxes reproduce exactly on a uniform grid.
#[derive(Debug, Copy, Clone)]
pub struct LinearField<T> {
    pub a: T,
    pub b: T,
    pub c: T,
}

impl<T: Real> LinearField<T> {
    pub fn evaluate(&self, point: [T; 2]) -> T {
        self.a + self.b * point[0] + self.c * point[1]
    }
}

/// Fixes the cells on the domain boundary to a [`LinearField`] and counts constraint queries.
#[derive(Debug)]
pub struct DirichletProblem<T: Real> {
    values: Vec<Option<DVector<T>>>,
    queries: AtomicUsize,
    prefetches: AtomicUsize,
}

impl<T: Real> DirichletProblem<T> {
    pub fn new(grid: &StructuredGrid<T>, field: LinearField<T>, num_eq: usize) -> Self {
        let values = (0..grid.num_dofs())
            .map(|dof| {
                grid.is_boundary_cell(dof)
                    .then(|| DVector::from_element(num_eq, field.evaluate(grid.cell_center(dof))))
            })
            .collect();
        Self {
            values,
            queries: AtomicUsize::new(0),
            prefetches: AtomicUsize::new(0),
        }
    }

    pub fn num_constraint_queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn num_prefetches(&self) -> usize {
        self.prefetches.load(Ordering::SeqCst)
    }
}

impl<T: Real> Problem<T> for DirichletProblem<T> {
    fn constraints(&self, context: &ElementContext<T>, primary_dof: usize, _time_idx: usize) -> Option<Constraint<T>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.values[context.global_dof(primary_dof)]
            .clone()
            .map(Constraint::new)
    }

    fn prefetch(&self, _element: usize) {
        self.prefetches.fetch_add(1, Ordering::SeqCst);
    }
}

/// Evaluates `field` at every cell center of `grid`.
pub fn interpolate<T: Real>(grid: &StructuredGrid<T>, field: LinearField<T>, num_eq: usize) -> BlockVector<T> {
    let mut vector = BlockVector::zeros(grid.num_dofs(), num_eq);
    for dof in 0..grid.num_dofs() {
        vector
            .block_mut(dof)
            .fill(field.evaluate(grid.cell_center(dof)));
    }
    vector
}

/// Runs `f` on `num_ranks` connected in-process ranks, each on its own thread, and returns the
/// results in rank order.
pub fn run_on_ranks<R, F>(num_ranks: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(&ThreadComm) -> R + Sync,
{
    let comms = ThreadComm::create(num_ranks);
    std::thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| scope.spawn(move || f(&comm)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank panicked"))
            .collect()
    })
}

/// Presents every element of the wrapped grid twice, so that each primary DOF belongs to two
/// elements.
pub struct DuplicatedGrid<G> {
    pub inner: G,
}

impl<T: Real, G: GridView<T>> GridView<T> for DuplicatedGrid<G> {
    fn num_elements(&self) -> usize {
        2 * self.inner.num_elements()
    }

    fn num_dofs(&self) -> usize {
        self.inner.num_dofs()
    }

    fn num_global_dofs(&self) -> usize {
        self.inner.num_global_dofs()
    }

    fn partition_type(&self, element: usize) -> PartitionType {
        self.inner
            .partition_type(element % self.inner.num_elements())
    }

    fn populate_stencil(&self, element: usize, stencil: &mut ElementStencil<T>) {
        self.inner
            .populate_stencil(element % self.inner.num_elements(), stencil)
    }

    fn global_dof_index(&self, dof: usize) -> usize {
        self.inner.global_dof_index(dof)
    }

    fn dof_owner(&self, dof: usize) -> usize {
        self.inner.dof_owner(dof)
    }

    fn sequence_number(&self) -> u64 {
        self.inner.sequence_number()
    }
}

/// A well with a single DOF of its own, connected to one grid cell.
///
/// The well equation is `u_well - u_cell = 0`, and the well injects `rate` into the cell.
#[derive(Debug, Clone)]
pub struct WellModule<T> {
    pub cell: usize,
    pub rate: T,
    pub fail: bool,
    offset: usize,
}

impl<T: Real> WellModule<T> {
    pub fn new(cell: usize, rate: T) -> Self {
        Self {
            cell,
            rate,
            fail: false,
            offset: usize::MAX,
        }
    }
}

fn add_to_block<T: Real>(matrix: &mut BlockCsrMatrix<T>, i: usize, j: usize, value: T) -> eyre::Result<()> {
    let mut block = matrix
        .block_mut(i, j)
        .ok_or_else(|| eyre!("missing coupling ({}, {})", i, j))?;
    for k in 0..block.nrows() {
        block[(k, k)] += value;
    }
    Ok(())
}

impl<T: Real> AuxiliaryModule<T> for WellModule<T> {
    fn num_dofs(&self) -> usize {
        1
    }

    fn set_dof_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    fn dof_offset(&self) -> usize {
        self.offset
    }

    fn add_neighbors(&self, neighbors: &mut [BTreeSet<usize>]) {
        neighbors[self.offset].insert(self.cell);
        neighbors[self.cell].insert(self.offset);
    }

    fn linearize(
        &mut self,
        solution: &BlockVector<T>,
        matrix: &mut BlockCsrMatrix<T>,
        residual: &mut BlockVector<T>,
    ) -> eyre::Result<()> {
        if self.fail {
            eyre::bail!("well {} cannot be operated", self.offset);
        }
        let well = self.offset;
        let difference = solution.block(well) - solution.block(self.cell);
        let mut well_residual = residual.block_mut(well);
        well_residual += &difference;
        residual
            .block_mut(self.cell)
            .add_scalar_mut(-self.rate);
        add_to_block(matrix, well, well, T::one())?;
        add_to_block(matrix, well, self.cell, -T::one())
    }
}
