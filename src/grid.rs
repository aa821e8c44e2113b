//! The mesh as seen by the linearizer and the overlap builder.
use crate::Real;

mod structured;

pub use structured::StructuredGrid;

/// Classification of an element with respect to the local process' partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PartitionType {
    Interior,
    Border,
    Overlap,
    Ghost,
}

/// A face between two DOFs of a stencil, given by their local stencil indices.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct StencilFace<T> {
    pub interior: usize,
    pub exterior: usize,
    /// Geometric transmissibility factor (face area over center distance).
    pub transmissibility: T,
}

/// The DOFs coupled through a single element.
///
/// The first [`num_primary`](Self::num_primary) DOFs are the element's primary DOFs, whose
/// equations the element contributes to.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementStencil<T> {
    element: usize,
    num_primary: usize,
    dofs: Vec<usize>,
    volumes: Vec<T>,
    faces: Vec<StencilFace<T>>,
}

impl<T: Real> Default for ElementStencil<T> {
    fn default() -> Self {
        Self {
            element: usize::MAX,
            num_primary: 0,
            dofs: Vec::new(),
            volumes: Vec::new(),
            faces: Vec::new(),
        }
    }
}

impl<T: Real> ElementStencil<T> {
    /// Clears the stencil so it can be populated for `element`.
    pub fn reset(&mut self, element: usize) {
        self.element = element;
        self.num_primary = 0;
        self.dofs.clear();
        self.volumes.clear();
        self.faces.clear();
    }

    /// Appends a primary DOF. Primary DOFs must be added before all other DOFs.
    pub fn push_primary_dof(&mut self, dof: usize, volume: T) -> usize {
        assert_eq!(
            self.num_primary,
            self.dofs.len(),
            "Primary DOFs must precede all secondary DOFs."
        );
        self.num_primary += 1;
        self.push_dof(dof, volume)
    }

    /// Appends a secondary DOF and returns its local index.
    pub fn push_dof(&mut self, dof: usize, volume: T) -> usize {
        self.dofs.push(dof);
        self.volumes.push(volume);
        self.dofs.len() - 1
    }

    pub fn push_face(&mut self, face: StencilFace<T>) {
        self.faces.push(face);
    }

    pub fn element(&self) -> usize {
        self.element
    }

    pub fn num_primary(&self) -> usize {
        self.num_primary
    }

    pub fn num_dofs(&self) -> usize {
        self.dofs.len()
    }

    /// Process-local DOF indices, primary DOFs first.
    pub fn dofs(&self) -> &[usize] {
        &self.dofs
    }

    pub fn primary_dofs(&self) -> &[usize] {
        &self.dofs[..self.num_primary]
    }

    pub fn volume(&self, local_dof: usize) -> T {
        self.volumes[local_dof]
    }

    pub fn faces(&self) -> &[StencilFace<T>] {
        &self.faces
    }
}

/// The local process' view of a (possibly distributed) grid.
///
/// DOFs are numbered locally in `0..num_dofs()`; every local DOF also has a process-independent
/// global index and an owning rank.
pub trait GridView<T: Real>: Sync {
    fn num_elements(&self) -> usize;

    fn num_dofs(&self) -> usize;

    /// Number of DOFs of the whole distributed grid.
    fn num_global_dofs(&self) -> usize;

    fn partition_type(&self, element: usize) -> PartitionType;

    fn populate_stencil(&self, element: usize, stencil: &mut ElementStencil<T>);

    fn global_dof_index(&self, dof: usize) -> usize;

    /// The rank owning the DOF. A DOF owned by another rank is only a copy on this process.
    fn dof_owner(&self, dof: usize) -> usize;

    /// Changes whenever the topology of the grid changes.
    fn sequence_number(&self) -> u64;
}
