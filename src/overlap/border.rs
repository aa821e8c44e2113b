use crate::comm::{agree, all_gather, Communicator};
use crate::grid::GridView;
use crate::wire::{WireReader, WireWriter};
use crate::{Error, Real};
use fvlinear_sparse::SparsityPattern;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// A native DOF that another rank also knows about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BorderIndex {
    pub local_index: usize,
    pub peer_rank: usize,
    pub global_index: usize,
    /// `0` if the DOF is a domestic DOF of the peer as well, i.e. both ranks assemble partial
    /// rows for it. Otherwise the graph distance at which the peer stores a non-owned copy.
    pub border_distance: usize,
}

/// A native DOF whose equation is owned by another rank. Its local row is ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlackListEntry {
    pub local_index: usize,
    pub owner_rank: usize,
}

/// The partition metadata of the native DOFs of one rank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BorderData {
    /// Global index of every native DOF.
    pub global_indices: Vec<usize>,
    pub border: Vec<BorderIndex>,
    pub black_list: Vec<BlackListEntry>,
}

/// Produces the [`BorderData`] of the local rank. Collective.
pub trait BorderListCreator {
    fn create(&self, comm: &dyn Communicator) -> Result<BorderData, Error>;
}

/// Border data for cell-centred grids, where every DOF is owned by exactly one rank.
///
/// DOFs owned by other ranks are black-listed. Owners learn at which distance their DOFs are
/// copied by other ranks. Auxiliary DOFs, which follow the grid DOFs in the native system, are
/// owned by the local rank and get global indices after all grid DOFs, ordered by rank.
pub struct CellBorderListCreator<'a, T: Real> {
    grid: &'a dyn GridView<T>,
    pattern: &'a SparsityPattern,
}

impl<'a, T: Real> CellBorderListCreator<'a, T> {
    pub fn new(grid: &'a dyn GridView<T>, native_pattern: &'a SparsityPattern) -> Self {
        Self {
            grid,
            pattern: native_pattern,
        }
    }
}

/// Breadth-first graph distances from `seeds` along the rows of `pattern`.
pub(crate) fn graph_distances(pattern: &SparsityPattern, seeds: impl IntoIterator<Item = usize>) -> Vec<Option<usize>> {
    let mut distances = vec![None; pattern.major_dim()];
    let mut queue = VecDeque::new();
    for seed in seeds {
        if distances[seed].is_none() {
            distances[seed] = Some(0);
            queue.push_back(seed);
        }
    }
    while let Some(i) = queue.pop_front() {
        let next = distances[i].map_or(0, |d| d + 1);
        for &j in pattern.lane(i) {
            if distances[j].is_none() {
                distances[j] = Some(next);
                queue.push_back(j);
            }
        }
    }
    distances
}

impl<'a, T: Real> BorderListCreator for CellBorderListCreator<'a, T> {
    fn create(&self, comm: &dyn Communicator) -> Result<BorderData, Error> {
        let rank = comm.rank();
        let num_grid_dofs = self.grid.num_dofs();
        let num_native = self.pattern.major_dim();
        let num_aux = num_native.checked_sub(num_grid_dofs).ok_or_else(|| {
            Error::Structure(format!(
                "Native system has {} DOFs, but the grid alone has {}",
                num_native, num_grid_dofs
            ))
        });
        let num_aux = agree(comm, num_aux, "Counting auxiliary DOFs")?;

        let mut writer = WireWriter::new();
        writer.write_usize(num_aux);
        let aux_counts = all_gather(comm, writer.into_bytes())?
            .iter()
            .map(|bytes| WireReader::new(bytes).read_usize())
            .collect::<Result<Vec<_>, _>>()?;
        let aux_base = self.grid.num_global_dofs() + aux_counts[..rank].iter().sum::<usize>();

        let global_indices: Vec<usize> = (0..num_grid_dofs)
            .map(|dof| self.grid.global_dof_index(dof))
            .chain(aux_base..aux_base + num_aux)
            .collect();

        let black_list: Vec<_> = (0..num_grid_dofs)
            .map(|dof| BlackListEntry {
                local_index: dof,
                owner_rank: self.grid.dof_owner(dof),
            })
            .filter(|entry| entry.owner_rank != rank)
            .collect();

        let mut is_domestic = vec![true; num_native];
        for entry in &black_list {
            is_domestic[entry.local_index] = false;
        }
        let distances = graph_distances(self.pattern, (0..num_native).filter(|&i| is_domestic[i]));

        // Tell the owners of our copies how far from our partition the copies are
        let mut messages: Vec<_> = (0..comm.size()).map(|_| (Vec::new(), Vec::new())).collect();
        let mut owners_known = Ok(());
        for entry in &black_list {
            if let Some(distance) = distances[entry.local_index] {
                match messages.get_mut(entry.owner_rank) {
                    Some((gids, dists)) => {
                        gids.push(global_indices[entry.local_index]);
                        dists.push(distance);
                    }
                    None => {
                        owners_known = Err(Error::Structure(format!(
                            "DOF {} is owned by unknown rank {}",
                            entry.local_index, entry.owner_rank
                        )))
                    }
                }
            }
        }
        agree(comm, owners_known, "Locating DOF owners")?;
        let messages = messages
            .into_iter()
            .map(|(gids, dists)| {
                let mut writer = WireWriter::new();
                writer.write_usizes(&gids);
                writer.write_usizes(&dists);
                writer.into_bytes()
            })
            .collect();

        let local_of_global: FxHashMap<usize, usize> = global_indices
            .iter()
            .enumerate()
            .map(|(local, &global)| (global, local))
            .collect();

        let received = comm.all_to_all(messages)?;
        let border = received
            .iter()
            .enumerate()
            .map(|(peer_rank, bytes)| {
                let mut reader = WireReader::new(bytes);
                let gids = reader.read_usizes()?;
                let dists = reader.read_usizes()?;
                gids.into_iter()
                    .zip(dists)
                    .map(|(global_index, border_distance)| {
                        let local_index = *local_of_global.get(&global_index).ok_or_else(|| {
                            Error::Structure(format!(
                                "Rank {} holds a copy of DOF {} which rank {} does not have",
                                peer_rank, global_index, rank
                            ))
                        })?;
                        Ok(BorderIndex {
                            local_index,
                            peer_rank,
                            global_index,
                            border_distance,
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()
            })
            .collect::<Result<Vec<_>, Error>>()
            .map(|border| border.into_iter().flatten().collect());
        let border = agree(comm, border, "Collecting the border list")?;

        Ok(BorderData {
            global_indices,
            border,
            black_list,
        })
    }
}
