use super::{linearizer_settings, newton_step, owned_values, solver_settings, stripe, NX, NY};
use fvlinear::backend::{Ilu0Wrapper, ParallelSolverBackend};
use fvlinear::comm::{all_reduce_max, Communicator, SerialComm};
use fvlinear::grid::{GridView, PartitionType, StructuredGrid};
use fvlinear::linearizer::{Linearizer, ModelState};
use fvlinear::BlockVector;
use std::collections::BTreeMap;
use util::{interpolate, run_on_ranks, DirichletProblem, LinearField, TpfaDiffusion};

fn field() -> LinearField<f64> {
    LinearField { a: 2.0, b: 0.75, c: -0.5 }
}

fn new_backend() -> ParallelSolverBackend<f64, Ilu0Wrapper<f64>> {
    let settings = solver_settings();
    let wrapper = Ilu0Wrapper::from_settings(&settings);
    ParallelSolverBackend::new(settings, wrapper).unwrap()
}

/// Solves the reaction-diffusion problem with Newton's method and returns the owned values by
/// global index together with the number of iterations.
fn solve_nonlinear(grid: &StructuredGrid<f64>, comm: &dyn Communicator) -> (BTreeMap<usize, f64>, usize) {
    let problem = DirichletProblem::new(grid, field(), 1);
    let kernel = TpfaDiffusion::new(1).with_reaction(0.5).with_source(2.0);
    let mut linearizer = Linearizer::new(kernel, linearizer_settings()).unwrap();
    let mut backend = new_backend();
    let mut solution = vec![BlockVector::zeros(grid.num_dofs(), 1)];

    for iteration in 0..20 {
        let previous = solution[0].clone();
        let converged = newton_step(
            &mut linearizer,
            &mut backend,
            grid,
            &problem,
            comm,
            &mut solution,
            iteration,
        )
        .unwrap();
        assert!(converged);

        let local_change = owned_values(grid, &solution[0])
            .iter()
            .zip(owned_values(grid, &previous))
            .map(|((_, new), (_, old))| (new - old).abs())
            .fold(0.0, f64::max);
        let change = all_reduce_max(comm, local_change).unwrap();
        if change < 1e-11 {
            return (owned_values(grid, &solution[0]).into_iter().collect(), iteration);
        }
    }
    panic!("Newton's method did not converge");
}

#[test]
fn one_newton_step_recovers_linear_field_on_two_ranks() {
    let results = run_on_ranks(2, |comm| {
        let grid = stripe(comm);
        let problem = DirichletProblem::new(&grid, field(), 1);
        let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), linearizer_settings()).unwrap();
        let mut backend = new_backend();
        let mut solution = vec![BlockVector::zeros(grid.num_dofs(), 1)];
        let converged = newton_step(&mut linearizer, &mut backend, &grid, &problem, comm, &mut solution, 0).unwrap();

        let exact = interpolate(&grid, field(), 1);
        let error = owned_values(&grid, &solution[0])
            .iter()
            .zip(owned_values(&grid, &exact))
            .map(|((_, computed), (_, expected))| (computed - expected).abs())
            .fold(0.0, f64::max);
        (converged, error, owned_values(&grid, &solution[0]).len())
    });

    let mut num_owned = 0;
    for (converged, error, owned) in results {
        assert!(converged);
        assert!(error < 1e-8, "max error {:e}", error);
        num_owned += owned;
    }
    assert_eq!(num_owned, NX * NY);
}

#[test]
fn parallel_newton_matches_serial_newton() {
    let serial_grid = StructuredGrid::new(NX, NY, [NX as f64, NY as f64]);
    let (serial, serial_iterations) = solve_nonlinear(&serial_grid, &SerialComm);
    assert!(serial_iterations > 1);

    let results = run_on_ranks(2, |comm| solve_nonlinear(&stripe(comm), comm));

    let mut parallel = BTreeMap::new();
    for (values, iterations) in results {
        assert!(iterations.abs_diff(serial_iterations) <= 1);
        parallel.extend(values);
    }
    assert_eq!(parallel.len(), serial.len());
    for (gid, value) in &serial {
        assert!((parallel[gid] - value).abs() < 1e-9, "DOF {}: {} vs {}", gid, parallel[gid], value);
    }
}

#[test]
fn owned_rows_match_serial_rows() {
    let field = field();
    let serial_grid = StructuredGrid::new(NX, NY, [NX as f64, NY as f64]);
    let mut serial_linearizer = Linearizer::new(TpfaDiffusion::new(1).with_reaction(1.0), linearizer_settings()).unwrap();
    let problem = DirichletProblem::new(&serial_grid, field, 1);
    let mut solution = vec![interpolate(&serial_grid, field, 1)];
    let mut model = ModelState {
        grid: &serial_grid,
        problem: &problem,
        comm: &SerialComm,
        solution: &mut solution,
        time_step_size: 1.0,
        newton_iteration: 0,
    };
    serial_linearizer.linearize(&mut model).unwrap();
    let serial = serial_linearizer.system().unwrap();

    run_on_ranks(2, |comm| {
        let grid = stripe(comm);
        let problem = DirichletProblem::new(&grid, field, 1);
        let mut linearizer = Linearizer::new(TpfaDiffusion::new(1).with_reaction(1.0), linearizer_settings()).unwrap();
        let mut solution = vec![interpolate(&grid, field, 1)];
        let mut model = ModelState {
            grid: &grid,
            problem: &problem,
            comm,
            solution: &mut solution,
            time_step_size: 1.0,
            newton_iteration: 0,
        };
        linearizer.linearize(&mut model).unwrap();
        let system = linearizer.system().unwrap();

        for dof in (0..grid.num_dofs()).filter(|&dof| grid.partition_type(dof) == PartitionType::Interior) {
            let gid = grid.global_dof_index(dof);
            assert_eq!(system.residual.block(dof), serial.residual.block(gid));
            let row = system.matrix.row(dof);
            let serial_row = serial.matrix.row(gid);
            assert_eq!(row.num_blocks(), serial_row.num_blocks());
            for (col, block) in row.iter() {
                let serial_block = serial_row.block_for_col(grid.global_dof_index(col)).unwrap();
                assert_eq!(block, serial_block);
            }
        }
    });
}
