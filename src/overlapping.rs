//! The local system extended by the algebraic overlap.
//!
//! Two synchronizations are defined on overlapping objects:
//! - `sync_add` sums the partial values that several ranks computed for a shared DOF on its
//!   master and then performs a `sync`,
//! - `sync` overwrites every copy of a DOF with the value of its master.
use crate::comm::Communicator;
use crate::overlap::Overlap;
use crate::wire::{WireReader, WireWriter};
use crate::{BlockCsrMatrix, BlockVector, Error, Real};
use std::sync::Arc;

fn check_native(overlap: &Overlap, num_blocks: usize, block_size: usize, expected_block_size: usize) -> Result<(), Error> {
    if num_blocks != overlap.num_native() || block_size != expected_block_size {
        return Err(Error::Structure(format!(
            "Native system with {} blocks of size {} does not match the overlap ({} native DOFs, block size {})",
            num_blocks,
            block_size,
            overlap.num_native(),
            expected_block_size
        )));
    }
    Ok(())
}

fn unknown_dof(gid: usize, src: usize) -> Error {
    Error::Communication(format!("Rank {} sent values of DOF {} which is not visible here", src, gid))
}

/// Sends the blocks selected by `send_to` to the given ranks and hands every received block to
/// `receive`.
fn exchange_blocks<T: Real>(
    overlap: &Overlap,
    comm: &dyn Communicator,
    values: &[T],
    block_size: usize,
    send_to: impl Fn(usize) -> Vec<usize>,
    mut receive: impl FnMut(usize, &[T]),
) -> Result<(), Error> {
    let size = comm.size();
    let mut gids = vec![Vec::new(); size];
    let mut payload = vec![Vec::new(); size];
    for local in 0..overlap.num_local() {
        for rank in send_to(local) {
            gids[rank].push(overlap.global_index(local));
            payload[rank].extend_from_slice(&values[local * block_size..(local + 1) * block_size]);
        }
    }
    let messages = gids
        .iter()
        .zip(&payload)
        .map(|(gids, payload)| {
            let mut writer = WireWriter::new();
            writer.write_usizes(gids);
            writer.write_pod_slice(payload);
            writer.into_bytes()
        })
        .collect();

    for (src, bytes) in comm.all_to_all(messages)?.iter().enumerate() {
        let mut reader = WireReader::new(bytes);
        let gids = reader.read_usizes()?;
        let payload: Vec<T> = reader.read_pod_vec()?;
        if payload.len() != gids.len() * block_size {
            return Err(Error::Communication(format!("Malformed block message from rank {}", src)));
        }
        for (gid, block) in gids.iter().zip(payload.chunks_exact(block_size.max(1))) {
            let local = overlap.local_index(*gid).ok_or_else(|| unknown_dof(*gid, src))?;
            receive(local, block);
        }
    }
    Ok(())
}

/// Overwrites every copy of a DOF with the block of its master. Collective.
pub fn sync_blocks<T: Real>(
    overlap: &Overlap,
    comm: &dyn Communicator,
    values: &mut [T],
    block_size: usize,
) -> Result<(), Error> {
    let mut received = Vec::new();
    exchange_blocks(
        overlap,
        comm,
        values,
        block_size,
        |local| {
            if overlap.is_master(local) {
                overlap.holders(local).to_vec()
            } else {
                Vec::new()
            }
        },
        |local, block| received.push((local, block.to_vec())),
    )?;
    for (local, block) in received {
        values[local * block_size..(local + 1) * block_size].copy_from_slice(&block);
    }
    Ok(())
}

/// Adds the partial blocks of shared DOFs on their masters, then synchronizes. Collective.
pub fn sync_add_blocks<T: Real>(
    overlap: &Overlap,
    comm: &dyn Communicator,
    values: &mut [T],
    block_size: usize,
) -> Result<(), Error> {
    let mut received = Vec::new();
    exchange_blocks(
        overlap,
        comm,
        values,
        block_size,
        |local| {
            if overlap.is_shared_copy(local) {
                vec![overlap.master_rank(local)]
            } else {
                Vec::new()
            }
        },
        |local, block| received.push((local, block.to_vec())),
    )?;
    for (local, block) in received {
        for (value, addend) in values[local * block_size..(local + 1) * block_size]
            .iter_mut()
            .zip(block)
        {
            *value += addend;
        }
    }
    sync_blocks(overlap, comm, values, block_size)
}

/// A vector over the local DOFs of an [`Overlap`].
#[derive(Debug, Clone)]
pub struct OverlappingVector<T: Real> {
    overlap: Arc<Overlap>,
    values: BlockVector<T>,
}

impl<T: Real> OverlappingVector<T> {
    pub fn zeros(overlap: Arc<Overlap>, block_size: usize) -> Self {
        let values = BlockVector::zeros(overlap.num_local(), block_size);
        Self { overlap, values }
    }

    pub fn overlap(&self) -> &Arc<Overlap> {
        &self.overlap
    }

    pub fn values(&self) -> &BlockVector<T> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut BlockVector<T> {
        &mut self.values
    }

    pub fn fill_zero(&mut self) {
        self.values.fill_zero();
    }

    /// Copies the domestic entries of `native` and merges the shared ones across ranks.
    /// Collective.
    pub fn assign_add_border(&mut self, native: &BlockVector<T>, comm: &dyn Communicator) -> Result<(), Error> {
        check_native(&self.overlap, native.num_blocks(), native.block_size(), self.values.block_size())?;
        self.values.fill_zero();
        for i in 0..native.num_blocks() {
            if let Some(local) = self.overlap.native_to_domestic(i) {
                self.values.block_mut(local).copy_from(&native.block(i));
            }
        }
        self.sync_add(comm)
    }

    /// Copies the values of all visible native DOFs back into `native`.
    pub fn assign_to(&self, native: &mut BlockVector<T>) -> Result<(), Error> {
        check_native(&self.overlap, native.num_blocks(), native.block_size(), self.values.block_size())?;
        for i in 0..native.num_blocks() {
            if let Some(local) = self.overlap.native_to_local(i) {
                native.block_mut(i).copy_from(&self.values.block(local));
            }
        }
        Ok(())
    }

    pub fn sync(&mut self, comm: &dyn Communicator) -> Result<(), Error> {
        let block_size = self.values.block_size();
        sync_blocks(&self.overlap, comm, self.values.as_vector_mut().as_mut_slice(), block_size)
    }

    pub fn sync_add(&mut self, comm: &dyn Communicator) -> Result<(), Error> {
        let block_size = self.values.block_size();
        sync_add_blocks(&self.overlap, comm, self.values.as_vector_mut().as_mut_slice(), block_size)
    }
}

/// Rows of a matrix in transit: global row index, global column indices and the blocks.
struct RowMessage<T> {
    gid: usize,
    cols: Vec<usize>,
    values: Vec<T>,
}

/// A block matrix over the local DOFs of an [`Overlap`].
#[derive(Debug, Clone)]
pub struct OverlappingMatrix<T: Real> {
    overlap: Arc<Overlap>,
    matrix: BlockCsrMatrix<T>,
}

impl<T: Real> OverlappingMatrix<T> {
    pub fn zeros(overlap: Arc<Overlap>, block_size: usize) -> Self {
        let matrix = BlockCsrMatrix::zeros(Arc::clone(overlap.pattern()), block_size);
        Self { overlap, matrix }
    }

    pub fn overlap(&self) -> &Arc<Overlap> {
        &self.overlap
    }

    pub fn matrix(&self) -> &BlockCsrMatrix<T> {
        &self.matrix
    }

    pub fn block_size(&self) -> usize {
        self.matrix.block_size()
    }

    /// Copies the rows of the domestic native DOFs. Columns that are not visible are dropped.
    pub fn assign_from_native(&mut self, native: &BlockCsrMatrix<T>) -> Result<(), Error> {
        check_native(&self.overlap, native.num_block_rows(), native.block_size(), self.block_size())?;
        self.matrix.fill_zero();
        for i in 0..native.num_block_rows() {
            let local_row = match self.overlap.native_to_domestic(i) {
                Some(local_row) => local_row,
                None => continue,
            };
            let mut row = self.matrix.row_mut(local_row);
            for (j, block) in native.row(i).iter() {
                if let Some(local_col) = self.overlap.native_to_local(j) {
                    if let Some(mut target) = row.block_mut_for_col(local_col) {
                        target.copy_from(&block);
                    }
                }
            }
        }
        Ok(())
    }

    fn row_message(&self, local: usize) -> RowMessage<T> {
        let row = self.matrix.row(local);
        let mut values = Vec::with_capacity(row.num_blocks() * self.block_size() * self.block_size());
        for (_, block) in row.iter() {
            values.extend(block.iter().copied());
        }
        RowMessage {
            gid: self.overlap.global_index(local),
            cols: row
                .col_indices()
                .iter()
                .map(|&j| self.overlap.global_index(j))
                .collect(),
            values,
        }
    }

    /// Sends the rows selected by `send_to` and returns the rows received, by local row index.
    fn exchange_rows(
        &self,
        comm: &dyn Communicator,
        send_to: impl Fn(usize) -> Vec<usize>,
    ) -> Result<Vec<(usize, RowMessage<T>)>, Error> {
        let mut outgoing: Vec<Vec<RowMessage<T>>> = (0..comm.size()).map(|_| Vec::new()).collect();
        for local in 0..self.overlap.num_local() {
            for rank in send_to(local) {
                outgoing[rank].push(self.row_message(local));
            }
        }
        let messages = outgoing
            .iter()
            .map(|rows| {
                let mut writer = WireWriter::new();
                writer.write_usize(rows.len());
                for row in rows {
                    writer.write_usize(row.gid);
                    writer.write_usizes(&row.cols);
                    writer.write_pod_slice(&row.values);
                }
                writer.into_bytes()
            })
            .collect();

        let bb = self.block_size() * self.block_size();
        let mut received = Vec::new();
        for (src, bytes) in comm.all_to_all(messages)?.iter().enumerate() {
            let mut reader = WireReader::new(bytes);
            let num_rows = reader.read_usize()?;
            for _ in 0..num_rows {
                let gid = reader.read_usize()?;
                let cols = reader.read_usizes()?;
                let values: Vec<T> = reader.read_pod_vec()?;
                if values.len() != cols.len() * bb {
                    return Err(Error::Communication(format!("Malformed row message from rank {}", src)));
                }
                let local = self.overlap.local_index(gid).ok_or_else(|| unknown_dof(gid, src))?;
                received.push((local, RowMessage { gid, cols, values }));
            }
        }
        Ok(received)
    }

    /// Adds (or, if `overwrite`, assigns) the blocks of a received row to the visible columns.
    fn apply_row(&mut self, local: usize, message: &RowMessage<T>, overwrite: bool) {
        let bb = self.block_size() * self.block_size();
        let mut row = self.matrix.row_mut(local);
        if overwrite {
            row.fill_zero();
        }
        for (gid, block) in message.cols.iter().zip(message.values.chunks_exact(bb.max(1))) {
            let local_col = match self.overlap.local_index(*gid) {
                Some(local_col) => local_col,
                None => continue,
            };
            if let Some(mut target) = row.block_mut_for_col(local_col) {
                for (value, source) in target.iter_mut().zip(block) {
                    if overwrite {
                        *value = *source;
                    } else {
                        *value += *source;
                    }
                }
            }
        }
    }

    /// Overwrites the rows of all copies with the rows of their masters. Collective.
    pub fn sync(&mut self, comm: &dyn Communicator) -> Result<(), Error> {
        let overlap = Arc::clone(&self.overlap);
        let received = self.exchange_rows(comm, |local| {
            if overlap.is_master(local) {
                overlap.holders(local).to_vec()
            } else {
                Vec::new()
            }
        })?;
        for (local, message) in &received {
            self.apply_row(*local, message, true);
        }
        Ok(())
    }

    /// Sums the partial rows of shared DOFs on their masters, then synchronizes. Collective.
    pub fn sync_add(&mut self, comm: &dyn Communicator) -> Result<(), Error> {
        let overlap = Arc::clone(&self.overlap);
        let received = self.exchange_rows(comm, |local| {
            if overlap.is_shared_copy(local) {
                vec![overlap.master_rank(local)]
            } else {
                Vec::new()
            }
        })?;
        for (local, message) in &received {
            self.apply_row(*local, message, false);
        }
        self.sync(comm)
    }
}
