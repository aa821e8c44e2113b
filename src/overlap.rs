//! Algebraic overlap of a distributed system.
//!
//! Starting from the native DOFs of every rank, the visible index set is grown by a number of
//! graph layers along the global sparsity pattern. Every visible DOF has exactly one master rank
//! whose values are authoritative; the other ranks holding the DOF receive them through
//! synchronization.
use crate::comm::{agree, Communicator};
use crate::sparsity::pattern_from_neighbor_sets;
use crate::wire::{WireReader, WireWriter};
use crate::Error;
use fvlinear_sparse::SparsityPattern;
use itertools::Itertools;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

mod border;

pub use border::{BlackListEntry, BorderData, BorderIndex, BorderListCreator, CellBorderListCreator};

/// Coupled DOFs of a row: global index and master rank of every column.
type GlobalRow = Vec<(usize, usize)>;

/// The overlapping index space of one rank.
///
/// Local indices enumerate the domestic DOFs first, in native order, followed by the overlap
/// DOFs ordered by border distance and global index.
#[derive(Debug, Clone)]
pub struct Overlap {
    rank: usize,
    overlap_size: usize,
    num_domestic: usize,
    global_indices: Vec<usize>,
    global_to_local: FxHashMap<usize, usize>,
    masters: Vec<usize>,
    distances: Vec<usize>,
    /// Other ranks holding a copy, for every DOF this rank is master of.
    holders: Vec<Vec<usize>>,
    native_to_local: Vec<Option<usize>>,
    peers: Vec<usize>,
    pattern: Arc<SparsityPattern>,
}

impl Overlap {
    /// Builds the overlap of `overlap_size` layers around the native DOFs. Collective.
    pub fn build(
        native_pattern: &SparsityPattern,
        border_data: &BorderData,
        overlap_size: usize,
        comm: &dyn Communicator,
    ) -> Result<Self, Error> {
        let rank = comm.rank();
        let size = comm.size();
        let num_native = native_pattern.major_dim();
        let native_gids = &border_data.global_indices;
        let (owners, sharers, border_peers) = agree(
            comm,
            check_border_data(border_data, num_native, rank, size),
            "Validating the border data",
        )?;

        let native_master = |i: usize| {
            owners[i].unwrap_or_else(|| sharers[i].first().map_or(rank, |&peer| peer.min(rank)))
        };
        let domestic: Vec<usize> = (0..num_native).filter(|&i| owners[i].is_none()).collect();

        let mut rows: FxHashMap<usize, GlobalRow> = FxHashMap::default();
        for &i in &domestic {
            let row = native_pattern
                .lane(i)
                .iter()
                .map(|&j| (native_gids[j], native_master(j)))
                .collect();
            rows.insert(native_gids[i], row);
        }

        merge_shared_rows(comm, &domestic, native_gids, &sharers, &native_master, &mut rows)?;

        // Grow the visible set layer by layer
        let mut distance: FxHashMap<usize, usize> = FxHashMap::default();
        let mut master: FxHashMap<usize, usize> = FxHashMap::default();
        for &i in &domestic {
            distance.insert(native_gids[i], 0);
            master.insert(native_gids[i], native_master(i));
        }
        let mut frontier: Vec<usize> = domestic.iter().map(|&i| native_gids[i]).collect();
        for layer in 1..=overlap_size {
            let mut discovered = Vec::new();
            for gid in &frontier {
                for &(col, col_master) in rows.get(gid).into_iter().flatten() {
                    if !distance.contains_key(&col) {
                        distance.insert(col, layer);
                        master.insert(col, col_master);
                        discovered.push(col);
                    }
                }
            }
            fetch_rows(comm, &discovered, &master, &mut rows)?;
            frontier = discovered;
        }

        // Announce the copies to their masters
        let mut announcements = vec![Vec::new(); size];
        let foreign = master
            .iter()
            .filter(|(_, &m)| m != rank)
            .map(|(&gid, _)| gid)
            .sorted_unstable();
        for gid in foreign {
            announcements[master[&gid]].push(gid);
        }
        let announced = exchange_indices(comm, announcements)?;

        // No collectives follow, so local failures are agreed on once at the end
        let finish = || -> Result<Self, Error> {
            let mut holders_by_gid: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
            for (src, gids) in announced.into_iter().enumerate() {
                for gid in gids {
                    if master.get(&gid) != Some(&rank) {
                        return Err(Error::Structure(format!(
                            "Rank {} announced a copy of DOF {} to rank {}, which is not its master",
                            src, gid, rank
                        )));
                    }
                    holders_by_gid.entry(gid).or_default().push(src);
                }
            }

            // Local numbering
            let mut global_indices: Vec<usize> = domestic.iter().map(|&i| native_gids[i]).collect();
            let overlap_dofs = distance
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(&gid, &d)| (d, gid))
                .sorted_unstable();
            global_indices.extend(overlap_dofs.map(|(_, gid)| gid));

            let global_to_local: FxHashMap<usize, usize> = global_indices
                .iter()
                .enumerate()
                .map(|(local, &gid)| (gid, local))
                .collect();
            if global_to_local.len() != global_indices.len() {
                return Err(Error::Structure("Native DOFs have duplicate global indices".to_string()));
            }

            let masters: Vec<usize> = global_indices.iter().map(|gid| master[gid]).collect();
            let distances: Vec<usize> = global_indices.iter().map(|gid| distance[gid]).collect();
            let holders: Vec<Vec<usize>> = global_indices
                .iter()
                .map(|gid| holders_by_gid.remove(gid).unwrap_or_default())
                .collect();
            let native_to_local = native_gids
                .iter()
                .map(|gid| global_to_local.get(gid).copied())
                .collect();

            let mut neighbors = Vec::with_capacity(global_indices.len());
            for (local, gid) in global_indices.iter().enumerate() {
                let row = rows
                    .get(gid)
                    .ok_or_else(|| Error::Structure(format!("Row of DOF {} is unknown", gid)))?;
                let mut coupled: BTreeSet<usize> = row
                    .iter()
                    .filter_map(|(col, _)| global_to_local.get(col).copied())
                    .collect();
                coupled.insert(local);
                neighbors.push(coupled);
            }
            let pattern = Arc::new(pattern_from_neighbor_sets(&neighbors)?);

            let mut peers: BTreeSet<usize> = border_peers;
            peers.extend(masters.iter().copied().filter(|&m| m != rank));
            peers.extend(holders.iter().flatten().copied());
            peers.remove(&rank);

            log::debug!(
                "rank {}: overlap with {} domestic and {} overlap DOFs, {} peers",
                rank,
                domestic.len(),
                global_indices.len() - domestic.len(),
                peers.len()
            );

            Ok(Self {
                rank,
                overlap_size,
                num_domestic: domestic.len(),
                global_indices,
                global_to_local,
                masters,
                distances,
                holders,
                native_to_local,
                peers: peers.into_iter().collect(),
                pattern,
            })
        };
        agree(comm, finish(), "Building the overlap")
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn overlap_size(&self) -> usize {
        self.overlap_size
    }

    /// Number of local DOFs, domestic and overlap.
    pub fn num_local(&self) -> usize {
        self.global_indices.len()
    }

    pub fn num_domestic(&self) -> usize {
        self.num_domestic
    }

    pub fn num_native(&self) -> usize {
        self.native_to_local.len()
    }

    pub fn global_index(&self, local: usize) -> usize {
        self.global_indices[local]
    }

    pub fn local_index(&self, global: usize) -> Option<usize> {
        self.global_to_local.get(&global).copied()
    }

    /// Local index of a native DOF, if visible.
    pub fn native_to_local(&self, native: usize) -> Option<usize> {
        self.native_to_local[native]
    }

    /// Local index of a native DOF whose row is assembled on this rank.
    pub fn native_to_domestic(&self, native: usize) -> Option<usize> {
        self.native_to_local[native].filter(|&local| local < self.num_domestic)
    }

    pub fn master_rank(&self, local: usize) -> usize {
        self.masters[local]
    }

    pub fn is_master(&self, local: usize) -> bool {
        self.masters[local] == self.rank
    }

    /// Whether the DOF is domestic here but mastered by another rank.
    pub fn is_shared_copy(&self, local: usize) -> bool {
        local < self.num_domestic && !self.is_master(local)
    }

    /// Number of graph layers between the DOF and the domestic DOFs.
    pub fn border_distance(&self, local: usize) -> usize {
        self.distances[local]
    }

    /// Ranks holding copies of a DOF this rank is master of.
    pub fn holders(&self, local: usize) -> &[usize] {
        &self.holders[local]
    }

    /// Ranks this rank exchanges DOFs with.
    pub fn peers(&self) -> &[usize] {
        &self.peers
    }

    /// Coupling structure of all local DOFs, restricted to visible columns.
    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }
}

fn write_rows<'a>(writer: &mut WireWriter, rows: impl ExactSizeIterator<Item = (usize, &'a GlobalRow)>) {
    writer.write_usize(rows.len());
    for (gid, row) in rows {
        writer.write_usize(gid);
        let (cols, masters): (Vec<usize>, Vec<usize>) = row.iter().copied().unzip();
        writer.write_usizes(&cols);
        writer.write_usizes(&masters);
    }
}

fn read_rows(bytes: &[u8]) -> Result<Vec<(usize, GlobalRow)>, Error> {
    let mut reader = WireReader::new(bytes);
    let num_rows = reader.read_usize()?;
    (0..num_rows)
        .map(|_| {
            let gid = reader.read_usize()?;
            let cols = reader.read_usizes()?;
            let masters = reader.read_usizes()?;
            if cols.len() != masters.len() {
                return Err(Error::Communication("Malformed row message".to_string()));
            }
            Ok((gid, cols.into_iter().zip(masters).collect()))
        })
        .collect()
}

fn merge_into(row: &mut GlobalRow, other: GlobalRow) {
    row.extend(other);
    row.sort_unstable_by_key(|&(col, _)| col);
    row.dedup_by_key(|&mut (col, _)| col);
}

/// Owner of every black-listed DOF, the ranks sharing every domestic DOF at distance 0 and all
/// ranks named by the border list.
type BorderSummary = (Vec<Option<usize>>, Vec<Vec<usize>>, BTreeSet<usize>);

fn check_border_data(border_data: &BorderData, num_native: usize, rank: usize, size: usize) -> Result<BorderSummary, Error> {
    if border_data.global_indices.len() != num_native {
        return Err(Error::Structure(format!(
            "Got {} global indices for {} native DOFs",
            border_data.global_indices.len(),
            num_native
        )));
    }

    let mut owners: Vec<Option<usize>> = vec![None; num_native];
    for entry in &border_data.black_list {
        if entry.local_index >= num_native || entry.owner_rank >= size || entry.owner_rank == rank {
            return Err(Error::Structure(format!("Invalid black list entry {:?}", entry)));
        }
        owners[entry.local_index] = Some(entry.owner_rank);
    }

    let mut sharers: Vec<Vec<usize>> = vec![Vec::new(); num_native];
    let mut border_peers = BTreeSet::new();
    for index in &border_data.border {
        if index.local_index >= num_native || index.peer_rank >= size || index.peer_rank == rank {
            return Err(Error::Structure(format!("Invalid border index {:?}", index)));
        }
        border_peers.insert(index.peer_rank);
        if index.border_distance == 0 {
            sharers[index.local_index].push(index.peer_rank);
        }
    }
    for peers in &mut sharers {
        peers.sort_unstable();
        peers.dedup();
    }
    Ok((owners, sharers, border_peers))
}

/// Completes the rows of DOFs that are domestic on several ranks: partial rows are merged on
/// the master and sent back to every sharer.
fn merge_shared_rows(
    comm: &dyn Communicator,
    domestic: &[usize],
    native_gids: &[usize],
    sharers: &[Vec<usize>],
    native_master: &dyn Fn(usize) -> usize,
    rows: &mut FxHashMap<usize, GlobalRow>,
) -> Result<(), Error> {
    let rank = comm.rank();
    let size = comm.size();

    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); size];
    for &i in domestic {
        let master = native_master(i);
        if master != rank {
            outgoing[master].push(native_gids[i]);
        }
    }
    let messages = outgoing
        .iter()
        .map(|gids| {
            let mut writer = WireWriter::new();
            write_rows(&mut writer, gids.iter().map(|gid| (*gid, &rows[gid])));
            writer.into_bytes()
        })
        .collect();
    let mut merged = Ok(());
    for bytes in comm.all_to_all(messages)? {
        for (gid, partial) in read_rows(&bytes)? {
            match rows.get_mut(&gid) {
                Some(row) => merge_into(row, partial),
                None => merged = Err(Error::Structure(format!("Received a partial row of unknown DOF {}", gid))),
            }
        }
    }
    agree(comm, merged, "Merging shared rows")?;

    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); size];
    for &i in domestic {
        if native_master(i) == rank {
            for &peer in &sharers[i] {
                outgoing[peer].push(native_gids[i]);
            }
        }
    }
    let messages = outgoing
        .iter()
        .map(|gids| {
            let mut writer = WireWriter::new();
            write_rows(&mut writer, gids.iter().map(|gid| (*gid, &rows[gid])));
            writer.into_bytes()
        })
        .collect();
    for bytes in comm.all_to_all(messages)? {
        for (gid, row) in read_rows(&bytes)? {
            rows.insert(gid, row);
        }
    }
    Ok(())
}

/// Requests the rows of `gids` from their masters.
fn fetch_rows(
    comm: &dyn Communicator,
    gids: &[usize],
    masters: &FxHashMap<usize, usize>,
    rows: &mut FxHashMap<usize, GlobalRow>,
) -> Result<(), Error> {
    let mut requests = vec![Vec::new(); comm.size()];
    for gid in gids {
        requests[masters[gid]].push(*gid);
    }
    let requested = exchange_indices(comm, requests)?;

    let replies = requested
        .iter()
        .enumerate()
        .map(|(src, gids)| {
            let reply = gids
                .iter()
                .map(|gid| {
                    let row = rows.get(gid).ok_or_else(|| {
                        Error::Structure(format!(
                            "Rank {} requested the row of DOF {} from rank {}, which does not have it",
                            src,
                            gid,
                            comm.rank()
                        ))
                    })?;
                    Ok((*gid, row))
                })
                .collect::<Result<Vec<_>, Error>>()?;
            let mut writer = WireWriter::new();
            write_rows(&mut writer, reply.into_iter());
            Ok(writer.into_bytes())
        })
        .collect::<Result<Vec<_>, Error>>();
    let replies = agree(comm, replies, "Answering row requests")?;

    for bytes in comm.all_to_all(replies)? {
        for (gid, row) in read_rows(&bytes)? {
            rows.insert(gid, row);
        }
    }
    Ok(())
}

fn exchange_indices(comm: &dyn Communicator, outgoing: Vec<Vec<usize>>) -> Result<Vec<Vec<usize>>, Error> {
    let messages = outgoing
        .iter()
        .map(|indices| {
            let mut writer = WireWriter::new();
            writer.write_usizes(indices);
            writer.into_bytes()
        })
        .collect();
    comm.all_to_all(messages)?
        .iter()
        .map(|bytes| WireReader::new(bytes).read_usizes())
        .collect()
}
