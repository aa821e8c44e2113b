use crate::grid::{ElementStencil, GridView, PartitionType, StencilFace};
use crate::Real;

/// A uniform two-dimensional grid of `nx x ny` cells with one DOF per cell.
///
/// When distributed, columns of cells are split into contiguous stripes along `x`. Every rank
/// additionally stores `overlap` columns of its neighbors, classified as
/// [`PartitionType::Overlap`].
#[derive(Debug, Clone)]
pub struct StructuredGrid<T> {
    nx: usize,
    ny: usize,
    cell_size: [T; 2],
    rank: usize,
    num_ranks: usize,
    /// Range of global columns stored locally.
    local_columns: (usize, usize),
    /// Range of global columns owned by this rank.
    owned_columns: (usize, usize),
    sequence_number: u64,
}

fn owned_range(nx: usize, rank: usize, num_ranks: usize) -> (usize, usize) {
    (rank * nx / num_ranks, (rank + 1) * nx / num_ranks)
}

impl<T: Real> StructuredGrid<T> {
    /// A grid held entirely by a single process.
    pub fn new(nx: usize, ny: usize, extent: [T; 2]) -> Self {
        Self::partitioned(nx, ny, extent, 0, 1, 0)
    }

    /// The part of a grid stored on `rank` out of `num_ranks`.
    ///
    /// # Panics
    ///
    /// Panics if there are more ranks than columns or if `rank` is out of range.
    pub fn partitioned(nx: usize, ny: usize, extent: [T; 2], rank: usize, num_ranks: usize, overlap: usize) -> Self {
        assert!(num_ranks > 0 && rank < num_ranks, "Invalid rank.");
        assert!(num_ranks <= nx, "Each rank must own at least one column.");
        let owned_columns = owned_range(nx, rank, num_ranks);
        let local_columns = (
            owned_columns.0.saturating_sub(overlap),
            (owned_columns.1 + overlap).min(nx),
        );
        let hx = extent[0] / T::from_usize(nx).unwrap_or_else(T::one);
        let hy = extent[1] / T::from_usize(ny).unwrap_or_else(T::one);
        Self {
            nx,
            ny,
            cell_size: [hx, hy],
            rank,
            num_ranks,
            local_columns,
            owned_columns,
            sequence_number: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn cells_per_dim(&self) -> [usize; 2] {
        [self.nx, self.ny]
    }

    pub fn cell_size(&self) -> [T; 2] {
        self.cell_size
    }

    fn num_local_columns(&self) -> usize {
        self.local_columns.1 - self.local_columns.0
    }

    /// Global `(i, j)` cell coordinates of a local DOF.
    pub fn global_cell(&self, dof: usize) -> (usize, usize) {
        let local_nx = self.num_local_columns();
        (self.local_columns.0 + dof % local_nx, dof / local_nx)
    }

    /// Local DOF of the global cell `(i, j)`, if stored on this process.
    pub fn local_dof(&self, i: usize, j: usize) -> Option<usize> {
        if i < self.local_columns.0 || i >= self.local_columns.1 || j >= self.ny {
            None
        } else {
            Some(j * self.num_local_columns() + (i - self.local_columns.0))
        }
    }

    pub fn cell_center(&self, dof: usize) -> [T; 2] {
        let (i, j) = self.global_cell(dof);
        let half = T::from_f64(0.5).unwrap_or_else(T::zero);
        let [hx, hy] = self.cell_size;
        [
            (T::from_usize(i).unwrap_or_else(T::zero) + half) * hx,
            (T::from_usize(j).unwrap_or_else(T::zero) + half) * hy,
        ]
    }

    /// Whether the cell touches the boundary of the whole domain.
    pub fn is_boundary_cell(&self, dof: usize) -> bool {
        let (i, j) = self.global_cell(dof);
        i == 0 || j == 0 || i + 1 == self.nx || j + 1 == self.ny
    }

    /// Marks a topology change, e.g. after adaptation.
    pub fn bump_sequence_number(&mut self) {
        self.sequence_number += 1;
    }
}

impl<T: Real> GridView<T> for StructuredGrid<T> {
    fn num_elements(&self) -> usize {
        self.num_local_columns() * self.ny
    }

    fn num_dofs(&self) -> usize {
        self.num_elements()
    }

    fn num_global_dofs(&self) -> usize {
        self.nx * self.ny
    }

    fn partition_type(&self, element: usize) -> PartitionType {
        let (i, _) = self.global_cell(element);
        if i >= self.owned_columns.0 && i < self.owned_columns.1 {
            PartitionType::Interior
        } else {
            PartitionType::Overlap
        }
    }

    fn populate_stencil(&self, element: usize, stencil: &mut ElementStencil<T>) {
        let [hx, hy] = self.cell_size;
        let volume = hx * hy;
        stencil.reset(element);
        stencil.push_primary_dof(element, volume);

        let (i, j) = self.global_cell(element);
        let neighbors = [
            (i.checked_sub(1), Some(j), hy / hx),
            (Some(i + 1), Some(j), hy / hx),
            (Some(i), j.checked_sub(1), hx / hy),
            (Some(i), Some(j + 1), hx / hy),
        ];
        for (ni, nj, transmissibility) in neighbors {
            if let Some(neighbor) = ni.zip(nj).and_then(|(ni, nj)| self.local_dof(ni, nj)) {
                let exterior = stencil.push_dof(neighbor, volume);
                stencil.push_face(StencilFace {
                    interior: 0,
                    exterior,
                    transmissibility,
                });
            }
        }
    }

    fn global_dof_index(&self, dof: usize) -> usize {
        let (i, j) = self.global_cell(dof);
        j * self.nx + i
    }

    fn dof_owner(&self, dof: usize) -> usize {
        let (i, _) = self.global_cell(dof);
        (0..self.num_ranks)
            .find(|&rank| {
                let (begin, end) = owned_range(self.nx, rank, self.num_ranks);
                i >= begin && i < end
            })
            .unwrap_or(self.rank)
    }

    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}
