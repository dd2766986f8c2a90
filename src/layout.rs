//! The capability table a storage layout implements for the cache.
//!
//! The cache never looks inside a layout's chunk index or encoding; it only
//! calls [`LayoutOps`]. Optional capabilities return
//! [`Callback::NotImplemented`] from their default implementations and the
//! cache falls back as follows:
//!
//! | callback | fallback |
//! |---|---|
//! | `decode` | on-disk bytes are the in-cache bytes |
//! | `decode_defined_values` | full `decode` |
//! | `condense` | over-allocated buffers are kept |
//! | `encode_in_place` | `encode` |
//! | `evict` | the buffer is dropped |
//! | `selection_*` / `vector_*` | cached decode + scatter / gather + encode |
//! | `scatter_mem` / `gather_mem` / `fill` | element copy with type conversion |
//! | `defined_values` | every element is defined |
//! | `erase_values` | erased elements are overwritten with the fill value |
//! | `evict_values` | the whole chunk is evicted |
//! | `delete_chunk` | operations that must delete fail with `NotSupported` |
//! | `chunk_coords` | only cached chunks are reconciled on extent changes |
//!
//! Every callback gets the dataset, chunk-local state and the `udata` the
//! layout produced in `lookup`/`new_chunk`. Callbacks must not keep
//! references to cache-owned buffers past the call, and a failed callback
//! must leave the chunk in a state where retrying is safe.

use crate::buffer::ChunkBuf;
use crate::convert::IoTypeInfo;
use crate::dataset::Dataset;
use crate::space::Selection;
use std::any::Any;
use std::error::Error;

/// Layout-owned context carried with a chunk; never inspected by the cache.
pub type Udata = Box<dyn Any + Send + Sync>;

/// Failure reported by a layout callback.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct LayoutError {
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl LayoutError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<std::io::Error> for LayoutError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source("layout I/O failed", err)
    }
}

/// Outcome of an optional callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback<T> {
    Done(T),
    NotImplemented,
}

impl<T> Callback<T> {
    pub fn is_implemented(&self) -> bool {
        matches!(self, Callback::Done(_))
    }

    pub fn done(self) -> Option<T> {
        match self {
            Callback::Done(value) => Some(value),
            Callback::NotImplemented => None,
        }
    }
}

pub type LayoutResult<T> = std::result::Result<Callback<T>, LayoutError>;

/// Whether a chunk can be transferred without going through the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectIo<T> {
    Possible(T),
    NotPossible,
}

/// One contiguous file region of a vector transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub offset: u64,
    pub len: usize,
}

/// Where a chunk lives on disk, as reported by `lookup`.
pub struct ChunkLookup {
    /// `None` if the chunk has never been allocated.
    pub addr: Option<u64>,
    pub disk_size: u64,
    /// Bytes to read when only the defined-value list is needed; zero means
    /// every value of the chunk is defined.
    pub defined_values_size: u64,
    /// Suggested buffer size for the decoded chunk.
    pub size_hint: usize,
    /// Suggested buffer size for the defined-value list alone.
    pub defined_values_size_hint: usize,
    pub udata: Option<Udata>,
}

impl ChunkLookup {
    pub fn unallocated(size_hint: usize) -> Self {
        Self {
            addr: None,
            disk_size: 0,
            defined_values_size: 0,
            size_hint,
            defined_values_size_hint: 0,
            udata: None,
        }
    }

    pub fn allocated(addr: u64, disk_size: u64, size_hint: usize) -> Self {
        Self {
            addr: Some(addr),
            disk_size,
            defined_values_size: 0,
            size_hint,
            defined_values_size_hint: 0,
            udata: None,
        }
    }

    pub fn with_udata(mut self, udata: Udata) -> Self {
        self.udata = Some(udata);
        self
    }
}

/// A freshly created, not yet indexed chunk.
pub struct NewChunk {
    pub buf: ChunkBuf,
    pub udata: Option<Udata>,
}

/// Result of encoding a chunk for disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// The used bytes of the chunk buffer are already the disk image.
    Unchanged,
    Buffer(Vec<u8>),
}

/// One chunk handed to [`LayoutOps::insert`].
///
/// `addr` holds the old address on entry and must hold the new one on
/// return. The cache writes `data` at that address once `insert` succeeds.
#[derive(Debug)]
pub struct ChunkInsert<'a> {
    pub scaled: &'a [u64],
    pub addr: Option<u64>,
    pub old_disk_size: u64,
    pub new_disk_size: u64,
    pub data: &'a [u8],
}

/// Element mapping for scatter/gather between a chunk and a memory buffer.
///
/// `selection[k]` (a chunk-local element) pairs with memory element
/// `mem_index[k]`.
#[derive(Debug, Clone, Copy)]
pub struct MemTransfer<'a> {
    pub selection: &'a Selection,
    pub mem_index: &'a [usize],
    pub types: &'a IoTypeInfo,
}

pub trait LayoutOps: Send + Sync {
    /// Find where each of `scaled` lives on disk. Returns one entry per
    /// input, in order.
    fn lookup(&self, dset: &Dataset, scaled: &[&[u64]]) -> Result<Vec<ChunkLookup>, LayoutError>;

    /// Turn the disk image in `buf` into the in-cache representation,
    /// updating `nbytes`/`alloc_size`.
    fn decode(
        &self,
        _dset: &Dataset,
        _buf: &mut ChunkBuf,
        _udata: Option<&mut Udata>,
    ) -> LayoutResult<()> {
        Ok(Callback::NotImplemented)
    }

    /// Like `decode`, but `buf` holds only the defined-value list.
    fn decode_defined_values(&self, _dset: &Dataset, _buf: &mut ChunkBuf) -> LayoutResult<()> {
        Ok(Callback::NotImplemented)
    }

    /// Create an empty chunk, written with fill values when `fill` is set
    /// (sparse layouts may ignore it). Does not touch the on-disk index.
    fn new_chunk(
        &self,
        dset: &Dataset,
        scaled: &[u64],
        fill: bool,
    ) -> Result<NewChunk, LayoutError>;

    /// Shrink the chunk's allocation down to what it uses.
    fn condense(&self, _dset: &Dataset, _buf: &mut ChunkBuf) -> LayoutResult<()> {
        Ok(Callback::NotImplemented)
    }

    /// Produce the disk image of a chunk, leaving the chunk untouched.
    fn encode(&self, dset: &Dataset, buf: &ChunkBuf) -> Result<Encoded, LayoutError>;

    /// Encode in place; afterwards the used bytes of `buf` are the disk image.
    fn encode_in_place(&self, _dset: &Dataset, _buf: &mut ChunkBuf) -> LayoutResult<()> {
        Ok(Callback::NotImplemented)
    }

    /// Release a chunk and everything it references.
    fn evict(&self, _dset: &Dataset, buf: ChunkBuf, udata: Option<Udata>) -> LayoutResult<()> {
        drop((buf, udata));
        Ok(Callback::NotImplemented)
    }

    /// (Re)allocate `chunks` in the on-disk index, writing each new address
    /// back into [`ChunkInsert::addr`].
    fn insert(&self, dset: &Dataset, chunks: &mut [ChunkInsert<'_>]) -> Result<(), LayoutError>;

    /// Describe a direct disk-to-memory read of `selection`, transformed to
    /// the on-disk element order when needed (`None` = no transform).
    fn selection_read(
        &self,
        _dset: &Dataset,
        _selection: &Selection,
        _chunk: Option<&ChunkBuf>,
        _udata: Option<&Udata>,
    ) -> LayoutResult<DirectIo<Option<Selection>>> {
        Ok(Callback::NotImplemented)
    }

    /// Describe a direct read of `selection` as file regions, one element
    /// after another in selection order.
    fn vector_read(
        &self,
        _dset: &Dataset,
        _addr: u64,
        _selection: &Selection,
        _chunk: Option<&ChunkBuf>,
        _udata: Option<&Udata>,
    ) -> LayoutResult<DirectIo<Vec<IoVec>>> {
        Ok(Callback::NotImplemented)
    }

    fn selection_write(
        &self,
        _dset: &Dataset,
        _selection: &Selection,
        _chunk: Option<&ChunkBuf>,
        _udata: Option<&Udata>,
    ) -> LayoutResult<DirectIo<Option<Selection>>> {
        Ok(Callback::NotImplemented)
    }

    fn vector_write(
        &self,
        _dset: &Dataset,
        _addr: u64,
        _selection: &Selection,
        _chunk: Option<&ChunkBuf>,
        _udata: Option<&Udata>,
    ) -> LayoutResult<DirectIo<Vec<IoVec>>> {
        Ok(Callback::NotImplemented)
    }

    /// Copy (and convert) selected chunk elements into `mem`.
    fn scatter_mem(
        &self,
        _dset: &Dataset,
        _xfer: &MemTransfer<'_>,
        _chunk: &ChunkBuf,
        _mem: &mut [u8],
    ) -> LayoutResult<()> {
        Ok(Callback::NotImplemented)
    }

    /// Copy (and convert) memory elements into the chunk, defining them.
    fn gather_mem(
        &self,
        _dset: &Dataset,
        _xfer: &MemTransfer<'_>,
        _mem: &[u8],
        _chunk: &mut ChunkBuf,
    ) -> LayoutResult<()> {
        Ok(Callback::NotImplemented)
    }

    /// Write the layout's fill value into the selected elements. Reads of
    /// undefined elements go through here, on a copy of the chunk.
    fn fill(
        &self,
        _dset: &Dataset,
        _selection: &Selection,
        _chunk: &mut ChunkBuf,
    ) -> LayoutResult<()> {
        Ok(Callback::NotImplemented)
    }

    /// The subset of `selection` currently holding defined values.
    fn defined_values(
        &self,
        _dset: &Dataset,
        _selection: &Selection,
        _chunk: &ChunkBuf,
    ) -> LayoutResult<Selection> {
        Ok(Callback::NotImplemented)
    }

    /// Undefine the selected elements. Returns `true` when nothing defined
    /// remains and the chunk should be deleted.
    fn erase_values(
        &self,
        _dset: &Dataset,
        _selection: &Selection,
        _chunk: &mut ChunkBuf,
    ) -> LayoutResult<bool> {
        Ok(Callback::NotImplemented)
    }

    /// Free the chunk's values but keep its defined-value list.
    fn evict_values(&self, _dset: &Dataset, _chunk: &mut ChunkBuf) -> LayoutResult<()> {
        Ok(Callback::NotImplemented)
    }

    /// Remove a chunk from the on-disk index and release its space.
    fn delete_chunk(
        &self,
        _dset: &Dataset,
        _scaled: &[u64],
        _addr: Option<u64>,
        _disk_size: u64,
    ) -> LayoutResult<()> {
        Ok(Callback::NotImplemented)
    }

    /// Scaled coordinates of every chunk allocated on disk.
    fn chunk_coords(&self, _dset: &Dataset) -> LayoutResult<Vec<Vec<u64>>> {
        Ok(Callback::NotImplemented)
    }
}
