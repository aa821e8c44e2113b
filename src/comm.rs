//! Collective communication between the processes sharing a distributed grid.
//!
//! All operations are collective: every rank of the communicator must call them in the same order.
use crate::wire::{WireReader, WireWriter};
use crate::{Error, Real};
use parking_lot::Mutex;
use std::sync::mpsc::{channel, Receiver, Sender};

/// Message passing between a fixed set of ranks.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sends `messages[p]` to rank `p` and returns the message received from every rank.
    fn all_to_all(&self, messages: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, Error>;

    fn all_reduce_min_i32(&self, value: i32) -> Result<i32, Error> {
        let gathered = all_gather(self, value.to_le_bytes().to_vec())?;
        let mut min = i32::MAX;
        for bytes in gathered {
            let bytes: [u8; 4] = bytes
                .try_into()
                .map_err(|_| Error::Communication("Malformed reduction message".to_string()))?;
            min = min.min(i32::from_le_bytes(bytes));
        }
        Ok(min)
    }

    fn barrier(&self) -> Result<(), Error> {
        all_gather(self, Vec::new()).map(|_| ())
    }
}

/// Sends the same message to every rank and returns the messages of all ranks in rank order.
pub fn all_gather<C: Communicator + ?Sized>(comm: &C, message: Vec<u8>) -> Result<Vec<Vec<u8>>, Error> {
    comm.all_to_all(vec![message; comm.size()])
}

fn gather_values<T: Real, C: Communicator + ?Sized>(comm: &C, value: T) -> Result<Vec<T>, Error> {
    let mut writer = WireWriter::new();
    writer.write_pod_slice(&[value]);
    let mut values = Vec::with_capacity(comm.size());
    for bytes in &all_gather(comm, writer.into_bytes())? {
        values.extend(WireReader::new(bytes).read_pod_vec::<T>()?);
    }
    Ok(values)
}

/// Sums `value` over all ranks.
///
/// The contributions are added in rank order, so every rank obtains a bitwise identical result.
pub fn all_reduce_sum<T: Real, C: Communicator + ?Sized>(comm: &C, value: T) -> Result<T, Error> {
    if comm.size() == 1 {
        return Ok(value);
    }
    Ok(gather_values(comm, value)?
        .into_iter()
        .fold(T::zero(), |sum, value| sum + value))
}

/// Maximum of `value` over all ranks.
pub fn all_reduce_max<T: Real, C: Communicator + ?Sized>(comm: &C, value: T) -> Result<T, Error> {
    if comm.size() == 1 {
        return Ok(value);
    }
    Ok(gather_values(comm, value)?
        .into_iter()
        .fold(value, |max, value| max.max(value)))
}

/// Returns `true` on all ranks if `success` holds on all ranks.
pub fn all_succeeded<C: Communicator + ?Sized>(comm: &C, success: bool) -> Result<bool, Error> {
    Ok(comm.all_reduce_min_i32(i32::from(success))? == 1)
}

/// Makes a local outcome collective: it fails on every rank if it failed on any rank.
///
/// A failing rank keeps its own error, the others get an [`Error::Structure`] naming `step`.
/// Must be called before the next collective whenever a rank may bail out early.
pub fn agree<T, C: Communicator + ?Sized>(comm: &C, outcome: Result<T, Error>, step: &str) -> Result<T, Error> {
    let all_ok = all_succeeded(comm, outcome.is_ok())?;
    match outcome {
        Ok(_) if !all_ok => Err(Error::Structure(format!("{} failed on another rank", step))),
        outcome => outcome,
    }
}

/// The communicator of a single, non-distributed process.
#[derive(Debug, Default, Copy, Clone)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_to_all(&self, messages: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, Error> {
        if messages.len() != 1 {
            return Err(Error::Communication(format!(
                "Expected 1 message, got {}",
                messages.len()
            )));
        }
        Ok(messages)
    }

    fn all_reduce_min_i32(&self, value: i32) -> Result<i32, Error> {
        Ok(value)
    }
}

/// Ranks emulated by threads of the same process, connected by channels.
///
/// Each rank must be driven by its own thread.
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    senders: Vec<Sender<Vec<u8>>>,
    receivers: Vec<Mutex<Receiver<Vec<u8>>>>,
}

impl ThreadComm {
    /// Creates the communicators of `size` connected ranks, in rank order.
    pub fn create(size: usize) -> Vec<ThreadComm> {
        // channels[src][dst]
        let mut senders: Vec<Vec<Sender<Vec<u8>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Mutex<Receiver<Vec<u8>>>>> =
            (0..size).map(|_| Vec::with_capacity(size)).collect();
        for src_senders in senders.iter_mut() {
            for dst_receivers in receivers.iter_mut() {
                let (sender, receiver) = channel();
                src_senders.push(sender);
                dst_receivers.push(Mutex::new(receiver));
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| ThreadComm {
                rank,
                senders,
                receivers,
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn all_to_all(&self, messages: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, Error> {
        if messages.len() != self.size() {
            return Err(Error::Communication(format!(
                "Expected {} messages, got {}",
                self.size(),
                messages.len()
            )));
        }
        for (dst, message) in messages.into_iter().enumerate() {
            self.senders[dst]
                .send(message)
                .map_err(|_| Error::Communication(format!("Rank {} is no longer reachable", dst)))?;
        }
        self.receivers
            .iter()
            .enumerate()
            .map(|(src, receiver)| {
                receiver
                    .lock()
                    .recv()
                    .map_err(|_| Error::Communication(format!("Rank {} hung up", src)))
            })
            .collect()
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_comm::MpiComm;

#[cfg(feature = "mpi-support")]
mod mpi_comm {
    use super::Communicator;
    use crate::Error;
    use mpi::collective::SystemOperation;
    use mpi::datatype::{Partition, PartitionMut};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use mpi::Count;

    /// Ranks of an MPI communicator.
    pub struct MpiComm {
        world: SimpleCommunicator,
    }

    impl MpiComm {
        pub fn new(world: SimpleCommunicator) -> Self {
            Self { world }
        }

        pub fn world(&self) -> &SimpleCommunicator {
            &self.world
        }
    }

    fn count(len: usize) -> Result<Count, Error> {
        Count::try_from(len).map_err(|_| Error::Communication("Message exceeds the MPI count range".to_string()))
    }

    fn displacements(counts: &[Count]) -> Vec<Count> {
        counts
            .iter()
            .scan(0, |offset, &count| {
                let displacement = *offset;
                *offset += count;
                Some(displacement)
            })
            .collect()
    }

    impl Communicator for MpiComm {
        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn all_to_all(&self, messages: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, Error> {
            let size = self.size();
            if messages.len() != size {
                return Err(Error::Communication(format!(
                    "Expected {} messages, got {}",
                    size,
                    messages.len()
                )));
            }
            let send_counts = messages
                .iter()
                .map(|message| count(message.len()))
                .collect::<Result<Vec<_>, _>>()?;
            let mut recv_counts = vec![0 as Count; size];
            self.world.all_to_all_into(&send_counts[..], &mut recv_counts[..]);

            let send_buffer = messages.concat();
            let send_displs = displacements(&send_counts);
            let recv_displs = displacements(&recv_counts);
            let recv_len = recv_counts.iter().map(|&c| c as usize).sum();
            let mut recv_buffer = vec![0u8; recv_len];
            {
                let send_partition = Partition::new(&send_buffer[..], &send_counts[..], &send_displs[..]);
                let mut recv_partition =
                    PartitionMut::new(&mut recv_buffer[..], &recv_counts[..], &recv_displs[..]);
                self.world
                    .all_to_all_varcount_into(&send_partition, &mut recv_partition);
            }

            Ok(recv_counts
                .iter()
                .zip(&recv_displs)
                .map(|(&count, &displ)| recv_buffer[displ as usize..(displ + count) as usize].to_vec())
                .collect())
        }

        fn all_reduce_min_i32(&self, value: i32) -> Result<i32, Error> {
            let mut result = value;
            self.world
                .all_reduce_into(&value, &mut result, SystemOperation::min());
            Ok(result)
        }

        fn barrier(&self) -> Result<(), Error> {
            self.world.barrier();
            Ok(())
        }
    }
}
