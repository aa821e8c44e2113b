use super::{linearize_serial, linearize_with, unit_grid};
use fvlinear::comm::{Communicator, SerialComm};
use fvlinear::context::ElementContext;
use fvlinear::grid::{GridView, StructuredGrid};
use fvlinear::linearizer::{Linearizer, ModelState};
use fvlinear::local::{Constraint, FiniteDifferenceLinearizer, Problem, Unconstrained};
use fvlinear::settings::LinearizerSettings;
use fvlinear::{BlockVector, Error};
use nalgebra::{DMatrix, DVector};
use util::{
    assert_approx_matrix_eq, interpolate, run_on_ranks, DirichletProblem, DuplicatedGrid, Fault, FaultyKernel,
    LinearField, TpfaDiffusion, TpfaResidual, WellModule,
};

fn field() -> LinearField<f64> {
    LinearField { a: 1.0, b: 2.0, c: -0.5 }
}

fn settings_with_threads(num_threads: usize) -> LinearizerSettings {
    LinearizerSettings {
        num_threads: Some(num_threads),
        ..LinearizerSettings::default()
    }
}

/// The matrix of two-point fluxes on a grid of unit cells.
fn graph_laplacian(nx: usize, ny: usize) -> DMatrix<f64> {
    let n = nx * ny;
    let mut laplacian = DMatrix::zeros(n, n);
    for j in 0..ny {
        for i in 0..nx {
            let a = j * nx + i;
            let mut couple = |b: usize| {
                laplacian[(a, a)] += 1.0;
                laplacian[(a, b)] -= 1.0;
            };
            if i > 0 {
                couple(a - 1);
            }
            if i + 1 < nx {
                couple(a + 1);
            }
            if j > 0 {
                couple(a - nx);
            }
            if j + 1 < ny {
                couple(a + nx);
            }
        }
    }
    laplacian
}

#[test]
fn diffusion_assembles_graph_laplacian() {
    let grid = unit_grid(4, 3);
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings_with_threads(3)).unwrap();
    let mut solution = vec![interpolate(&grid, field(), 1)];
    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution).unwrap();

    let laplacian = graph_laplacian(4, 3);
    let matrix = linearizer.matrix().unwrap().to_dense();
    assert_approx_matrix_eq!(&matrix, &laplacian, abstol = 1e-14);

    let expected_residual = &laplacian * solution[0].as_vector();
    let residual = linearizer.residual().unwrap().as_vector();
    assert_approx_matrix_eq!(residual, &expected_residual, abstol = 1e-12);
}

#[test]
fn erased_system_is_rebuilt_identically() {
    let grid = unit_grid(3, 3);
    let kernel = TpfaDiffusion::new(2).with_reaction(0.5).with_source(1.0);
    let mut linearizer = Linearizer::new(kernel, settings_with_threads(2)).unwrap();
    let mut solution = vec![interpolate(&grid, field(), 2)];

    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution).unwrap();
    let first_matrix = linearizer.matrix().unwrap().clone();
    let first_residual = linearizer.residual().unwrap().clone();

    linearizer.erase_matrix();
    assert!(linearizer.matrix().is_none());
    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution).unwrap();

    assert_eq!(linearizer.matrix().unwrap().pattern(), first_matrix.pattern());
    assert_eq!(linearizer.matrix().unwrap().values(), first_matrix.values());
    assert_eq!(linearizer.residual().unwrap(), &first_residual);
}

#[test]
fn repeated_linearization_does_not_accumulate() {
    let grid = unit_grid(3, 3);
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings_with_threads(2)).unwrap();
    let mut solution = vec![interpolate(&grid, field(), 1)];

    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution).unwrap();
    let first = linearizer.matrix().unwrap().to_dense();
    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution).unwrap();
    assert_eq!(linearizer.matrix().unwrap().to_dense(), first);
}

#[test]
fn topology_change_rebuilds_the_structure() {
    let mut grid = unit_grid(3, 3);
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings_with_threads(2)).unwrap();
    let mut solution = vec![interpolate(&grid, field(), 1)];
    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution).unwrap();
    assert_eq!(linearizer.system().unwrap().sequence_number, 0);

    grid.bump_sequence_number();
    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution).unwrap();
    assert_eq!(linearizer.system().unwrap().sequence_number, 1);
    assert_eq!(linearizer.matrix().unwrap().to_dense(), graph_laplacian(3, 3));
}

#[test]
fn constrained_rows_become_identity() {
    let grid = unit_grid(3, 3);
    let problem = DirichletProblem::new(&grid, field(), 2);
    let settings = LinearizerSettings {
        enable_constraints: true,
        ..settings_with_threads(2)
    };
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(2), settings).unwrap();
    let mut solution = vec![BlockVector::zeros(9, 2), BlockVector::zeros(9, 2)];
    linearize_serial(&mut linearizer, &grid, &problem, &mut solution).unwrap();

    // Every cell but the center touches the boundary
    let constraints = linearizer.constraints_map();
    assert_eq!(constraints.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 5, 6, 7, 8]);

    let matrix = linearizer.matrix().unwrap();
    let residual = linearizer.residual().unwrap();
    for (&dof, constraint) in constraints {
        let exact = field().evaluate(grid.cell_center(dof));
        assert_eq!(constraint.values, DVector::from_element(2, exact));
        for vector in &solution {
            assert_eq!(vector.block(dof), DVector::from_element(2, exact));
        }

        let row = matrix.row(dof);
        for (col, block) in row.iter() {
            if col == dof {
                assert_eq!(block, DMatrix::identity(2, 2));
            } else {
                assert_eq!(block, DMatrix::zeros(2, 2));
            }
        }
        assert_eq!(residual.block(dof), DVector::zeros(2));
    }

    // The center equation is untouched
    assert_eq!(matrix.block(4, 4).unwrap(), DMatrix::identity(2, 2) * 4.0);
    assert_eq!(matrix.block(4, 1).unwrap(), DMatrix::identity(2, 2) * -1.0);
}

#[test]
fn constraints_are_only_queried_on_first_newton_iteration() {
    let grid = unit_grid(3, 3);
    let problem = DirichletProblem::new(&grid, field(), 1);
    let settings = LinearizerSettings {
        enable_constraints: true,
        ..settings_with_threads(2)
    };
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings).unwrap();
    let mut solution = vec![BlockVector::zeros(9, 1)];

    linearize_with(&mut linearizer, &grid, &problem, &SerialComm, &mut solution, 0).unwrap();
    assert_eq!(problem.num_constraint_queries(), 9);
    linearize_with(&mut linearizer, &grid, &problem, &SerialComm, &mut solution, 1).unwrap();
    linearize_with(&mut linearizer, &grid, &problem, &SerialComm, &mut solution, 2).unwrap();
    assert_eq!(problem.num_constraint_queries(), 9);
    assert_eq!(linearizer.constraints_map().len(), 8);

    linearize_with(&mut linearizer, &grid, &problem, &SerialComm, &mut solution, 0).unwrap();
    assert_eq!(problem.num_constraint_queries(), 18);
}

#[test]
fn constraints_are_ignored_unless_enabled() {
    let grid = unit_grid(3, 3);
    let problem = DirichletProblem::new(&grid, field(), 1);
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings_with_threads(2)).unwrap();
    let mut solution = vec![BlockVector::zeros(9, 1)];
    linearize_serial(&mut linearizer, &grid, &problem, &mut solution).unwrap();

    assert_eq!(problem.num_constraint_queries(), 0);
    assert!(linearizer.constraints_map().is_empty());
    assert_eq!(linearizer.matrix().unwrap().to_dense(), graph_laplacian(3, 3));
}

#[test]
fn failing_element_is_a_numerical_issue() {
    for fault in [Fault::Error, Fault::Panic] {
        let grid = unit_grid(4, 4);
        let kernel = FaultyKernel {
            inner: TpfaDiffusion::new(1),
            element: 5,
            fault,
        };
        let mut linearizer = Linearizer::new(kernel, settings_with_threads(3)).unwrap();
        let mut solution = vec![BlockVector::zeros(16, 1)];
        let result = linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution);

        match result {
            Err(Error::NumericalIssue { message, cause }) => {
                assert_eq!(message, "A process did not succeed in linearizing the system");
                let cause = cause.expect("the local fault is attached");
                assert!(format!("{:#}", cause).contains("element 5"));
            }
            other => panic!("expected a numerical issue, got {:?}", other),
        }
        assert!(linearizer.matrix().is_none());
        assert!(linearizer.residual().is_none());
    }
}

#[test]
fn concurrent_faults_yield_a_single_error() {
    let grid = unit_grid(10, 10);
    let kernel = FaultyKernel {
        inner: TpfaDiffusion::new(1),
        element: 20,
        fault: Fault::ErrorFromElement,
    };
    let mut linearizer = Linearizer::new(kernel, settings_with_threads(4)).unwrap();
    let mut solution = vec![BlockVector::zeros(100, 1)];

    for _ in 0..5 {
        let result = linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution);
        match result {
            Err(Error::NumericalIssue { cause: Some(cause), .. }) => {
                let report = format!("{:#}", cause);
                assert_eq!(report.matches("negative saturation").count(), 1, "{}", report);
            }
            other => panic!("expected a numerical issue, got {:?}", other),
        }
        assert!(linearizer.matrix().is_none());
    }
}

#[test]
fn fault_on_one_rank_fails_every_rank() {
    let results = run_on_ranks(2, |comm| {
        let grid = StructuredGrid::partitioned(4, 3, [4.0, 3.0], comm.rank(), comm.size(), 1);
        // Local DOF 1 of rank 1 is the owned cell (2, 0)
        let kernel = FaultyKernel {
            inner: TpfaDiffusion::new(1),
            element: if comm.rank() == 1 { 1 } else { usize::MAX },
            fault: Fault::Error,
        };
        let mut linearizer = Linearizer::new(kernel, settings_with_threads(2)).unwrap();
        let mut solution = vec![BlockVector::zeros(grid.num_dofs(), 1)];
        let result = linearize_with(&mut linearizer, &grid, &Unconstrained, comm, &mut solution, 0);
        let outcome = match result {
            Err(Error::NumericalIssue { cause, .. }) => Some(cause.is_some()),
            _ => None,
        };
        (outcome, linearizer.matrix().is_none())
    });

    for (rank, (outcome, matrix_is_none)) in results.into_iter().enumerate() {
        assert_eq!(outcome, Some(rank == 1), "rank {}", rank);
        assert!(matrix_is_none);
    }
}

/// Constrains every DOF with a block of the wrong size.
struct OversizedConstraints;

impl Problem<f64> for OversizedConstraints {
    fn constraints(&self, _context: &ElementContext<f64>, _primary_dof: usize, _time_idx: usize) -> Option<Constraint<f64>> {
        Some(Constraint::new(DVector::from_element(2, 1.0)))
    }
}

#[test]
fn constraint_of_wrong_size_is_a_numerical_issue_on_every_rank() {
    let settings = LinearizerSettings {
        enable_constraints: true,
        ..settings_with_threads(2)
    };
    let results = run_on_ranks(2, |comm| {
        let grid = StructuredGrid::partitioned(4, 3, [4.0, 3.0], comm.rank(), comm.size(), 1);
        let problem: &dyn Problem<f64> = if comm.rank() == 0 {
            &OversizedConstraints
        } else {
            &Unconstrained
        };
        let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings.clone()).unwrap();
        let mut solution = vec![BlockVector::zeros(grid.num_dofs(), 1)];
        match linearize_with(&mut linearizer, &grid, problem, comm, &mut solution, 0) {
            Err(Error::NumericalIssue { cause, .. }) => cause.map(|cause| format!("{:#}", cause)),
            other => panic!("expected a numerical issue, got {:?}", other),
        }
    });

    let cause = results[0].as_deref().expect("rank 0 carries the cause");
    assert!(cause.contains("has 2 values, expected 1"), "{}", cause);
    assert!(results[1].is_none());
}

#[test]
fn locked_and_unguarded_accumulation_agree() {
    let grid = unit_grid(6, 5);
    let solution = interpolate(&grid, field(), 2);
    let kernel = TpfaDiffusion::new(2).with_reaction(0.25).with_source(3.0);

    let mut results = Vec::new();
    for use_linearization_lock in [false, true] {
        let settings = LinearizerSettings {
            use_linearization_lock,
            ..settings_with_threads(4)
        };
        let mut linearizer = Linearizer::new(kernel.clone(), settings).unwrap();
        let mut history = vec![solution.clone()];
        linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut history).unwrap();
        results.push(linearizer.system().unwrap().clone());
    }

    assert_eq!(results[0].matrix.values(), results[1].matrix.values());
    assert_eq!(results[0].residual, results[1].residual);
}

#[test]
fn thread_count_does_not_change_the_result() {
    let grid = unit_grid(5, 5);
    let solution = interpolate(&grid, field(), 1);
    let kernel = TpfaDiffusion::new(1).with_reaction(1.0);

    let mut matrices = Vec::new();
    for num_threads in [1, 2, 7] {
        let mut linearizer = Linearizer::new(kernel.clone(), settings_with_threads(num_threads)).unwrap();
        assert_eq!(linearizer.num_workers(), num_threads);
        let mut history = vec![solution.clone()];
        linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut history).unwrap();
        matrices.push(linearizer.matrix().unwrap().clone());
    }
    assert_eq!(matrices[0].values(), matrices[1].values());
    assert_eq!(matrices[0].values(), matrices[2].values());
}

#[test]
fn shared_primary_dofs_are_accumulated_under_the_lock() {
    let grid = DuplicatedGrid { inner: unit_grid(4, 3) };
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings_with_threads(4)).unwrap();
    let mut solution = vec![interpolate(&grid.inner, field(), 1)];
    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut solution).unwrap();

    assert!(!linearizer.system().unwrap().primary_rows_disjoint);
    let expected = graph_laplacian(4, 3) * 2.0;
    assert_eq!(linearizer.matrix().unwrap().to_dense(), expected);
}

#[test]
fn finite_differences_approximate_the_analytic_jacobian() {
    let grid = unit_grid(4, 4);
    let solution = interpolate(&grid, field(), 1);

    let analytic = TpfaDiffusion::new(1).with_reaction(1.0).with_source(0.5);
    let mut linearizer = Linearizer::new(analytic, settings_with_threads(2)).unwrap();
    let mut history = vec![solution.clone()];
    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut history).unwrap();
    let expected = linearizer.system().unwrap().clone();

    let residual = TpfaResidual {
        num_eq: 1,
        source: 0.5,
        reaction: 1.0,
    };
    let mut fd_linearizer = Linearizer::new(FiniteDifferenceLinearizer::new(residual), settings_with_threads(2)).unwrap();
    let mut history = vec![solution];
    linearize_serial(&mut fd_linearizer, &grid, &Unconstrained, &mut history).unwrap();
    let system = fd_linearizer.system().unwrap();

    assert_approx_matrix_eq!(&system.matrix.to_dense(), &expected.matrix.to_dense(), abstol = 1e-5);
    assert_approx_matrix_eq!(system.residual.as_vector(), expected.residual.as_vector(), abstol = 1e-12);
}

#[test]
fn auxiliary_module_contributes_to_the_system() {
    let grid = unit_grid(3, 3);
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings_with_threads(2)).unwrap();
    linearizer.add_auxiliary_module(Box::new(WellModule::new(4, 2.0)));
    assert_eq!(linearizer.num_auxiliary_modules(), 1);

    let mut solution = BlockVector::zeros(10, 1);
    solution.block_mut(4).fill(3.0);
    solution.block_mut(9).fill(5.0);
    let mut history = vec![solution];
    linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut history).unwrap();

    assert_eq!(linearizer.auxiliary_module(0).unwrap().dof_offset(), 9);
    let matrix = linearizer.matrix().unwrap();
    let residual = linearizer.residual().unwrap();
    assert_eq!(matrix.block(9, 9).unwrap()[(0, 0)], 1.0);
    assert_eq!(matrix.block(9, 4).unwrap()[(0, 0)], -1.0);
    assert_eq!(matrix.block(4, 9).unwrap()[(0, 0)], 0.0);
    assert_eq!(matrix.block(4, 4).unwrap()[(0, 0)], 4.0);
    // The center cell has four neighbors at zero
    assert_eq!(residual.block(4)[0], 4.0 * 3.0 - 2.0);
    assert_eq!(residual.block(9)[0], 5.0 - 3.0);
}

#[test]
fn auxiliary_equations_alone_do_not_make_the_system_consistent() {
    let grid = unit_grid(3, 3);
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings_with_threads(2)).unwrap();
    linearizer.add_auxiliary_module(Box::new(WellModule::new(4, 2.0)));
    let mut solution = vec![BlockVector::zeros(10, 1)];

    let mut model = ModelState {
        grid: &grid,
        problem: &Unconstrained,
        comm: &SerialComm,
        solution: &mut solution,
        time_step_size: 1.0,
        newton_iteration: 0,
    };
    linearizer.linearize_auxiliary_equations(&mut model).unwrap();
    assert!(linearizer.matrix().is_none());
    assert!(linearizer.residual().is_none());

    linearizer.linearize(&mut model).unwrap();
    assert!(linearizer.matrix().is_some());
}

#[test]
fn failing_auxiliary_module_is_a_numerical_issue() {
    let grid = unit_grid(3, 3);
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings_with_threads(2)).unwrap();
    let mut well = WellModule::new(4, 2.0);
    well.fail = true;
    linearizer.add_auxiliary_module(Box::new(well));

    let mut history = vec![BlockVector::zeros(10, 1)];
    let result = linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut history);
    match result {
        Err(Error::NumericalIssue { message, cause }) => {
            assert_eq!(message, "Linearization of an auxiliary equation failed");
            assert!(cause.is_some());
        }
        other => panic!("expected a numerical issue, got {:?}", other),
    }
    assert!(linearizer.matrix().is_none());
}

#[test]
fn non_local_elements_are_only_linearized_on_request() {
    // Rank 0 of 2 owns columns 0 and 1 and stores column 2 as overlap
    let grid = StructuredGrid::partitioned(4, 2, [4.0, 2.0], 0, 2, 1);
    assert_eq!(grid.num_dofs(), 6);
    let overlap_dof = grid.local_dof(2, 0).unwrap();
    let owned_dof = grid.local_dof(1, 0).unwrap();

    for linearize_non_local_elements in [false, true] {
        let settings = LinearizerSettings {
            linearize_non_local_elements,
            ..settings_with_threads(2)
        };
        let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings).unwrap();
        let mut history = vec![interpolate(&grid, field(), 1)];
        linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut history).unwrap();

        let matrix = linearizer.matrix().unwrap();
        // Column 1 has neighbors left, right and above
        assert_eq!(matrix.block(owned_dof, owned_dof).unwrap()[(0, 0)], 3.0);
        let overlap_diagonal = matrix.block(overlap_dof, overlap_dof).unwrap()[(0, 0)];
        if linearize_non_local_elements {
            // Only the left and upper neighbors of the overlap cell are stored locally
            assert_eq!(overlap_diagonal, 2.0);
        } else {
            assert_eq!(overlap_diagonal, 0.0);
        }
    }
}

#[test]
fn prefetch_is_announced_for_upcoming_elements() {
    let grid = unit_grid(3, 3);
    let problem = DirichletProblem::new(&grid, field(), 1);
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(1), settings_with_threads(1)).unwrap();
    let mut history = vec![BlockVector::zeros(9, 1)];
    linearize_serial(&mut linearizer, &grid, &problem, &mut history).unwrap();
    // The first element is claimed without a preceding hint
    assert_eq!(problem.num_prefetches(), 8);
}

#[test]
fn mismatched_solution_is_a_structure_error() {
    let grid = unit_grid(3, 3);
    let mut linearizer = Linearizer::new(TpfaDiffusion::new(2), settings_with_threads(1)).unwrap();

    let mut wrong_size = vec![BlockVector::zeros(8, 2)];
    let result = linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut wrong_size);
    assert!(matches!(result, Err(Error::Structure(_))));

    let mut wrong_block_size = vec![BlockVector::zeros(9, 1)];
    let result = linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut wrong_block_size);
    assert!(matches!(result, Err(Error::Structure(_))));

    let result = linearize_serial(&mut linearizer, &grid, &Unconstrained, &mut []);
    assert!(matches!(result, Err(Error::Structure(_))));
}
