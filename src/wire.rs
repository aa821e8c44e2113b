//! Byte encoding of the messages exchanged between processes.
//!
//! All integers travel as little-endian `u64`. Slices are prefixed by their length.
use crate::Error;
use bytemuck::Pod;
use std::mem::size_of;

#[derive(Debug, Default, Clone)]
pub(crate) struct WireWriter {
    bytes: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_usize(&mut self, value: usize) {
        let value = (value as u64).to_le();
        self.bytes.extend_from_slice(bytemuck::bytes_of(&value));
    }

    pub fn write_usizes(&mut self, values: &[usize]) {
        self.write_usize(values.len());
        for &value in values {
            self.write_usize(value);
        }
    }

    pub fn write_pod_slice<T: Pod>(&mut self, values: &[T]) {
        self.write_usize(values.len());
        self.bytes.extend_from_slice(bytemuck::cast_slice(values));
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WireReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn is_exhausted(&self) -> bool {
        self.position == self.bytes.len()
    }

    fn take(&mut self, num_bytes: usize) -> Result<&'a [u8], Error> {
        let end = self
            .position
            .checked_add(num_bytes)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| Error::Communication("Received a truncated message".to_string()))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub fn read_usize(&mut self) -> Result<usize, Error> {
        let value: u64 = bytemuck::pod_read_unaligned(self.take(size_of::<u64>())?);
        usize::try_from(u64::from_le(value))
            .map_err(|_| Error::Communication("Received an index that does not fit in usize".to_string()))
    }

    pub fn read_usizes(&mut self) -> Result<Vec<usize>, Error> {
        let len = self.read_usize()?;
        (0..len).map(|_| self.read_usize()).collect()
    }

    pub fn read_pod_vec<T: Pod>(&mut self) -> Result<Vec<T>, Error> {
        let len = self.read_usize()?;
        let num_bytes = len
            .checked_mul(size_of::<T>())
            .ok_or_else(|| Error::Communication("Received an oversized message".to_string()))?;
        let bytes = self.take(num_bytes)?;
        Ok(bytes
            .chunks_exact(size_of::<T>().max(1))
            .take(len)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}
