use super::{chain_system, linearize_with, unit_grid};
use fvlinear::comm::{Communicator, SerialComm};
use fvlinear::grid::{GridView, StructuredGrid};
use fvlinear::linearizer::Linearizer;
use fvlinear::local::Unconstrained;
use fvlinear::overlap::{BorderListCreator, CellBorderListCreator, Overlap};
use fvlinear::overlapping::{OverlappingMatrix, OverlappingVector};
use fvlinear::settings::LinearizerSettings;
use fvlinear::{BlockCsrMatrix, BlockVector, Error};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;
use util::{interpolate, run_on_ranks, LinearField, TpfaDiffusion};

fn field() -> LinearField<f64> {
    LinearField { a: 0.5, b: 1.0, c: 2.0 }
}

fn linearized_system(grid: &StructuredGrid<f64>, comm: &dyn Communicator) -> (BlockCsrMatrix<f64>, BlockVector<f64>) {
    let settings = LinearizerSettings {
        num_threads: Some(2),
        ..LinearizerSettings::default()
    };
    let kernel = TpfaDiffusion::new(1).with_reaction(1.0);
    let mut linearizer = Linearizer::new(kernel, settings).unwrap();
    let mut solution = vec![interpolate(grid, field(), 1)];
    linearize_with(&mut linearizer, grid, &Unconstrained, comm, &mut solution, 0).unwrap();
    let system = linearizer.system().unwrap();
    (system.matrix.clone(), system.residual.clone())
}

/// The overlapping matrix in global numbering, with `NaN` where no block is stored.
fn to_global_dense(matrix: &OverlappingMatrix<f64>, num_global: usize) -> DMatrix<f64> {
    let overlap = matrix.overlap();
    let mut dense = DMatrix::from_element(num_global, num_global, f64::NAN);
    for local in 0..overlap.num_local() {
        for (col, block) in matrix.matrix().row(local).iter() {
            dense[(overlap.global_index(local), overlap.global_index(col))] = block[(0, 0)];
        }
    }
    dense
}

#[test]
fn serial_overlapping_system_equals_native_system() {
    let grid = unit_grid(3, 4);
    let (native, residual) = linearized_system(&grid, &SerialComm);
    let border = CellBorderListCreator::<f64>::new(&grid, native.pattern())
        .create(&SerialComm)
        .unwrap();
    let overlap = Arc::new(Overlap::build(native.pattern(), &border, 2, &SerialComm).unwrap());

    let mut matrix = OverlappingMatrix::<f64>::zeros(Arc::clone(&overlap), 1);
    matrix.assign_from_native(&native).unwrap();
    matrix.sync_add(&SerialComm).unwrap();
    assert_eq!(matrix.matrix().to_dense(), native.to_dense());

    let mut vector = OverlappingVector::<f64>::zeros(overlap, 1);
    vector.assign_add_border(&residual, &SerialComm).unwrap();
    let mut copy = BlockVector::zeros(residual.num_blocks(), 1);
    vector.assign_to(&mut copy).unwrap();
    assert_eq!(copy, residual);
    assert_eq!(vector.values(), &residual);
}

#[test]
fn partial_rows_of_shared_dofs_are_summed() {
    let results = run_on_ranks(2, |comm| {
        let (native, mut rhs, border) = chain_system(comm.rank());
        let border = border.create(comm).unwrap();
        let overlap = Arc::new(Overlap::build(native.pattern(), &border, 1, comm).unwrap());

        let mut matrix = OverlappingMatrix::<f64>::zeros(Arc::clone(&overlap), 1);
        matrix.assign_from_native(&native).unwrap();
        matrix.sync_add(comm).unwrap();

        let mut vector = OverlappingVector::<f64>::zeros(Arc::clone(&overlap), 1);
        vector.assign_add_border(&rhs, comm).unwrap();
        vector.assign_to(&mut rhs).unwrap();
        (to_global_dense(&matrix, 3), rhs, overlap)
    });

    // The chain couples neighbors only, so the corners are not stored
    let expected = DMatrix::from_row_slice(3, 3, &[2.0, -1.0, f64::NAN, -1.0, 2.0, -1.0, f64::NAN, -1.0, 2.0]);
    for (dense, _, _) in &results {
        for (value, expected) in dense.iter().zip(expected.iter()) {
            assert!(value == expected || (value.is_nan() && expected.is_nan()), "{} vs {}", value, expected);
        }
    }
    assert_eq!(results[0].1.as_vector(), &DVector::from_column_slice(&[1.0, 30.0]));
    assert_eq!(results[1].1.as_vector(), &DVector::from_column_slice(&[30.0, 2.0]));

    // DOF 1 is mastered by the lower rank
    let (_, _, overlap0) = &results[0];
    let (_, _, overlap1) = &results[1];
    let shared0 = overlap0.local_index(1).unwrap();
    let shared1 = overlap1.local_index(1).unwrap();
    assert!(overlap0.is_master(shared0));
    assert!(overlap1.is_shared_copy(shared1));
    assert_eq!(overlap0.holders(shared0), &[1]);
    assert_eq!(overlap1.border_distance(overlap1.local_index(0).unwrap()), 1);
}

#[test]
fn overlap_rows_are_copied_from_their_masters() {
    let (nx, ny) = (6, 3);
    let global_grid = StructuredGrid::new(nx, ny, [nx as f64, ny as f64]);
    let (global_matrix, global_residual) = linearized_system(&global_grid, &SerialComm);
    let global_dense = global_matrix.to_dense();

    for overlap_size in [1, 2] {
        let results = run_on_ranks(3, |comm| {
            let grid = StructuredGrid::partitioned(nx, ny, [nx as f64, ny as f64], comm.rank(), comm.size(), 1);
            let (native, mut residual) = linearized_system(&grid, comm);
            let border = CellBorderListCreator::<f64>::new(&grid, native.pattern())
                .create(comm)
                .unwrap();
            let overlap = Arc::new(Overlap::build(native.pattern(), &border, overlap_size, comm).unwrap());

            let mut matrix = OverlappingMatrix::<f64>::zeros(Arc::clone(&overlap), 1);
            matrix.assign_from_native(&native).unwrap();
            matrix.sync_add(comm).unwrap();

            let mut vector = OverlappingVector::<f64>::zeros(overlap, 1);
            vector.assign_add_border(&residual, comm).unwrap();
            vector.assign_to(&mut residual).unwrap();
            let residual_by_gid: Vec<(usize, f64)> = (0..grid.num_dofs())
                .map(|dof| (grid.global_dof_index(dof), residual.block(dof)[0]))
                .collect();
            (to_global_dense(&matrix, nx * ny), residual_by_gid)
        });

        for (dense, residual) in &results {
            for (value, expected) in dense.iter().zip(global_dense.iter()) {
                if !value.is_nan() {
                    assert_eq!(value, expected);
                }
            }
            // Every native DOF, including the grid overlap, carries the value of its owner
            for &(gid, value) in residual {
                assert_eq!(value, global_residual.block(gid)[0]);
            }
        }
    }
}

#[test]
fn native_system_must_match_the_overlap() {
    let grid = unit_grid(3, 3);
    let (native, residual) = linearized_system(&grid, &SerialComm);
    let border = CellBorderListCreator::<f64>::new(&grid, native.pattern())
        .create(&SerialComm)
        .unwrap();
    let overlap = Arc::new(Overlap::build(native.pattern(), &border, 1, &SerialComm).unwrap());

    let mut matrix = OverlappingMatrix::<f64>::zeros(Arc::clone(&overlap), 2);
    assert!(matches!(matrix.assign_from_native(&native), Err(Error::Structure(_))));

    let mut vector = OverlappingVector::<f64>::zeros(overlap, 1);
    let short = BlockVector::zeros(residual.num_blocks() - 1, 1);
    assert!(matches!(vector.assign_add_border(&short, &SerialComm), Err(Error::Structure(_))));
}
