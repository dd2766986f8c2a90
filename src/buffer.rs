use crate::{CacheError, Result};

/// Allocate `len` zeroed bytes, reporting failure instead of aborting.
pub(crate) fn zeroed(len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| CacheError::Allocation { bytes: len })?;
    data.resize(len, 0);
    Ok(data)
}

/// Owned storage for one chunk.
///
/// `nbytes` and `alloc_size` are totals across every buffer the chunk uses.
/// A layout may hang sub-allocations off the main buffer (variable-length
/// element data, for instance) and report them here; for plain layouts both
/// track the main buffer only. Callbacks that resize the chunk take it by
/// `&mut` and update both counters.
#[derive(Debug, Default)]
pub struct ChunkBuf {
    data: Vec<u8>,
    nbytes: usize,
    alloc_size: usize,
}

impl ChunkBuf {
    /// Allocate a zeroed buffer of `size` bytes with nothing used yet.
    pub fn with_capacity(size: usize) -> Result<Self> {
        Ok(Self {
            data: zeroed(size)?,
            nbytes: 0,
            alloc_size: size,
        })
    }

    /// Copy the main buffer and its counters.
    pub fn try_clone(&self) -> Result<Self> {
        let mut data = zeroed(self.data.len())?;
        data.copy_from_slice(&self.data);
        Ok(Self {
            data,
            nbytes: self.nbytes,
            alloc_size: self.alloc_size,
        })
    }

    /// Wrap an existing vector; every byte counts as used.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data,
            nbytes: len,
            alloc_size: len,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The used prefix of the main buffer.
    pub fn used(&self) -> &[u8] {
        &self.data[..self.nbytes.min(self.data.len())]
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn alloc_size(&self) -> usize {
        self.alloc_size
    }

    pub fn set_nbytes(&mut self, nbytes: usize) {
        self.nbytes = nbytes;
    }

    /// Record totals after a callback changed the chunk's buffers.
    pub fn set_lengths(&mut self, nbytes: usize, alloc_size: usize) {
        self.nbytes = nbytes;
        self.alloc_size = alloc_size;
    }

    /// Grow or shrink the main buffer to `len` bytes, zero-filling growth.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        if len > self.data.len() {
            let extra = len - self.data.len();
            self.data
                .try_reserve_exact(extra)
                .map_err(|_| CacheError::Allocation { bytes: len })?;
        }
        let external = self.alloc_size.saturating_sub(self.data.len());
        self.data.resize(len, 0);
        self.alloc_size = len + external;
        self.nbytes = self.nbytes.min(self.alloc_size);
        Ok(())
    }

    /// Replace the contents, e.g. with a decoded or encoded image.
    pub fn replace(&mut self, data: Vec<u8>) {
        *self = Self::from_vec(data);
    }

    /// Truncate the main buffer to its used prefix and release the rest.
    pub fn shrink_to_used(&mut self) {
        self.data.truncate(self.nbytes.min(self.data.len()));
        self.data.shrink_to_fit();
        self.nbytes = self.data.len();
        self.alloc_size = self.data.len();
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Check the used/allocated invariant after `op` touched the buffer.
    pub(crate) fn check(&self, op: &'static str) -> Result<()> {
        if self.nbytes > self.alloc_size {
            return Err(CacheError::InvalidState(format!(
                "{op} left chunk with {} bytes used but only {} allocated",
                self.nbytes, self.alloc_size
            )));
        }
        Ok(())
    }
}
