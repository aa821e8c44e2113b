//! Construction of the coupling structure of the global system.
use crate::grid::{ElementStencil, GridView};
use crate::local::AuxiliaryModule;
use crate::{BlockCsrMatrix, BlockVector, Error, Real};
use fvlinear_sparse::parallel::subsets_are_disjoint;
use fvlinear_sparse::SparsityPattern;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The global Jacobian and residual of one process, together with the topology they were built
/// for.
#[derive(Debug, Clone)]
pub struct LinearSystem<T: Real> {
    pub matrix: BlockCsrMatrix<T>,
    pub residual: BlockVector<T>,
    /// Sequence number of the grid topology the structure was derived from.
    pub sequence_number: u64,
    /// Whether no DOF is a primary DOF of more than one element.
    pub primary_rows_disjoint: bool,
}

impl<T: Real> LinearSystem<T> {
    pub fn fill_zero(&mut self) {
        self.matrix.fill_zero();
        self.residual.fill_zero();
    }
}

/// Number of grid DOFs plus the DOFs of all auxiliary modules.
pub fn num_total_dofs<T: Real>(grid: &dyn GridView<T>, auxiliary_modules: &[Box<dyn AuxiliaryModule<T>>]) -> usize {
    grid.num_dofs()
        + auxiliary_modules
            .iter()
            .map(|module| module.num_dofs())
            .sum::<usize>()
}

/// Assigns consecutive DOF ranges after the grid DOFs to the auxiliary modules.
pub fn assign_auxiliary_dof_offsets<T: Real>(grid: &dyn GridView<T>, auxiliary_modules: &mut [Box<dyn AuxiliaryModule<T>>]) {
    let mut offset = grid.num_dofs();
    for module in auxiliary_modules {
        module.set_dof_offset(offset);
        offset += module.num_dofs();
    }
}

/// Computes the set of coupled DOFs of every DOF.
///
/// The primary DOFs of every element couple to all DOFs of its stencil and every DOF couples to
/// itself. Auxiliary modules then add their own couplings. Also returns whether the primary DOF
/// sets of the elements are pairwise disjoint.
pub fn build_neighbor_sets<T: Real>(
    grid: &dyn GridView<T>,
    auxiliary_modules: &[Box<dyn AuxiliaryModule<T>>],
) -> Result<(Vec<BTreeSet<usize>>, bool), Error> {
    let num_dofs = num_total_dofs(grid, auxiliary_modules);
    let mut neighbors: Vec<_> = (0..num_dofs).map(|i| BTreeSet::from([i])).collect();

    let mut stencil = ElementStencil::default();
    let mut primary_sets = Vec::with_capacity(grid.num_elements());
    for element in 0..grid.num_elements() {
        grid.populate_stencil(element, &mut stencil);
        if let Some(&dof) = stencil.dofs().iter().find(|&&dof| dof >= grid.num_dofs()) {
            return Err(Error::Structure(format!(
                "Stencil of element {} refers to DOF {}, but the grid only has {} DOFs",
                element,
                dof,
                grid.num_dofs()
            )));
        }
        for &i in stencil.primary_dofs() {
            neighbors[i].extend(stencil.dofs().iter().copied());
        }
        primary_sets.push(stencil.primary_dofs().to_vec());
    }
    let primary_rows_disjoint = subsets_are_disjoint(primary_sets.iter().map(Vec::as_slice));

    for module in auxiliary_modules {
        module.add_neighbors(&mut neighbors);
    }
    for (i, row) in neighbors.iter().enumerate() {
        if let Some(&j) = row.range(num_dofs..).next() {
            return Err(Error::Structure(format!(
                "Auxiliary coupling ({}, {}) is outside of the {} DOFs of the system",
                i, j, num_dofs
            )));
        }
    }

    Ok((neighbors, primary_rows_disjoint))
}

pub fn pattern_from_neighbor_sets(neighbors: &[BTreeSet<usize>]) -> Result<SparsityPattern, Error> {
    let num_rows = neighbors.len();
    let mut offsets = Vec::with_capacity(num_rows + 1);
    let mut column_indices = Vec::with_capacity(neighbors.iter().map(BTreeSet::len).sum());
    offsets.push(0);
    for row in neighbors {
        column_indices.extend(row.iter().copied());
        offsets.push(column_indices.len());
    }
    SparsityPattern::try_from_offsets_and_indices(num_rows, num_rows, offsets, column_indices)
        .map_err(|err| Error::Structure(format!("Invalid sparsity pattern: {}", err)))
}

/// Allocates a zeroed system with exactly the couplings of [`build_neighbor_sets`].
pub fn build_linear_system<T: Real>(
    grid: &dyn GridView<T>,
    auxiliary_modules: &mut [Box<dyn AuxiliaryModule<T>>],
    num_eq: usize,
) -> Result<LinearSystem<T>, Error> {
    assign_auxiliary_dof_offsets(grid, auxiliary_modules);
    let (neighbors, primary_rows_disjoint) = build_neighbor_sets(grid, auxiliary_modules)?;
    let pattern = Arc::new(pattern_from_neighbor_sets(&neighbors)?);
    let num_dofs = neighbors.len();
    log::debug!(
        "Built sparsity pattern with {} DOFs and {} coupled DOF pairs",
        num_dofs,
        pattern.nnz()
    );
    Ok(LinearSystem {
        matrix: BlockCsrMatrix::zeros(pattern, num_eq),
        residual: BlockVector::zeros(num_dofs, num_eq),
        sequence_number: grid.sequence_number(),
        primary_rows_disjoint,
    })
}
