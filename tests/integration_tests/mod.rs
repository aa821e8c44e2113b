use fvlinear::backend::{Ilu0Wrapper, ParallelSolverBackend, SolveContext};
use fvlinear::comm::Communicator;
use fvlinear::grid::{GridView, PartitionType, StructuredGrid};
use fvlinear::linearizer::{Linearizer, ModelState};
use fvlinear::local::{LocalLinearizer, Problem};
use fvlinear::overlap::CellBorderListCreator;
use fvlinear::settings::{LinearSolverSettings, LinearizerSettings};
use fvlinear::{BlockVector, Error};

mod newton;

const NX: usize = 6;
const NY: usize = 4;

/// The stripe of the `NX x NY` unit-cell grid stored on this rank, with one overlap column.
fn stripe(comm: &dyn Communicator) -> StructuredGrid<f64> {
    StructuredGrid::partitioned(NX, NY, [NX as f64, NY as f64], comm.rank(), comm.size(), 1)
}

fn solver_settings() -> LinearSolverSettings {
    LinearSolverSettings {
        tolerance: 1e-12,
        overlap_size: 1,
        ..LinearSolverSettings::default()
    }
}

fn linearizer_settings() -> LinearizerSettings {
    LinearizerSettings {
        enable_constraints: true,
        num_threads: Some(2),
        ..LinearizerSettings::default()
    }
}

/// Performs one Newton update of `solution` in place and returns whether the linear solve
/// converged.
fn newton_step<K: LocalLinearizer<f64>>(
    linearizer: &mut Linearizer<f64, K>,
    backend: &mut ParallelSolverBackend<f64, Ilu0Wrapper<f64>>,
    grid: &StructuredGrid<f64>,
    problem: &dyn Problem<f64>,
    comm: &dyn Communicator,
    solution: &mut [BlockVector<f64>],
    newton_iteration: usize,
) -> Result<bool, Error> {
    let mut model = ModelState {
        grid,
        problem,
        comm,
        solution: &mut *solution,
        time_step_size: 1.0,
        newton_iteration,
    };
    linearizer.linearize(&mut model)?;

    let system = linearizer
        .system()
        .ok_or_else(|| Error::Structure("no system after linearization".to_string()))?;
    let creator = CellBorderListCreator::<f64>::new(grid, system.matrix.pattern());
    let ctx = SolveContext {
        border_list_creator: &creator,
        sequence_number: grid.sequence_number(),
        comm,
    };
    let mut rhs = system.residual.clone();
    backend.prepare_matrix(&system.matrix, &ctx)?;
    backend.prepare_rhs(&system.matrix, &mut rhs, &ctx)?;

    let mut update = BlockVector::zeros(rhs.num_blocks(), rhs.block_size());
    let converged = backend.solve(&mut update, comm)?;
    *solution[0].as_vector_mut() -= update.as_vector();
    Ok(converged)
}

/// Values of the owned cells as `(global index, value)` pairs.
fn owned_values(grid: &StructuredGrid<f64>, vector: &BlockVector<f64>) -> Vec<(usize, f64)> {
    (0..grid.num_dofs())
        .filter(|&dof| grid.partition_type(dof) == PartitionType::Interior)
        .map(|dof| (grid.global_dof_index(dof), vector.block(dof)[0]))
        .collect()
}
