//! Shared chunk cache for chunked, file-backed array storage.
//!
//! One [`Cache`] is created per open file and shared by every chunked dataset
//! in it. The cache sits between element-level read/write requests and the
//! per-layout chunk management a dataset's [`LayoutOps`] implementation
//! provides (lookup, allocation, encoding, index maintenance), keeping a
//! bounded pool of decoded chunk buffers.
//!
//! ```text
//!  read / write / direct_chunk_*         flush / flush_dset / set_extent_notify
//!            │                                         │
//!            ▼                                         ▼
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │ Cache                                                        │
//!  │   CacheIndex: (DatasetId, scaled) -> ChunkSlot, LRU ticks    │
//!  │   byte budget, pins, dirty tracking                          │
//!  └──────────────────────────────────────────────────────────────┘
//!            │ LayoutOps callbacks                      │ FileDriver
//!            ▼                                          ▼
//!   lookup / decode / encode / insert ...        raw block reads/writes
//! ```
//!
//! Destroying a cache (dropping it, or calling [`Cache::destroy`]) discards
//! every entry without flushing. Callers must [`Cache::flush`] first if dirty
//! chunks should reach the file.

mod buffer;
mod cache;
mod convert;
mod dataset;
mod entry;
mod extent;
mod file;
mod flush;
mod index;
mod io;
mod layout;
mod metrics;
mod space;

#[cfg(test)]
mod test_layout;

pub use buffer::ChunkBuf;
pub use cache::{Cache, CacheBuilder, CacheConfig};
pub use convert::{IoTypeInfo, TypeConversion};
pub use dataset::{Dataset, DatasetId};
pub use entry::Defined;
pub use file::{FileDriver, MemFile};
pub use index::ChunkKey;
pub use io::{ReadRequest, WriteRequest};
pub use layout::{
    Callback, ChunkInsert, ChunkLookup, DirectIo, Encoded, IoVec, LayoutError, LayoutOps,
    LayoutResult, MemTransfer, NewChunk, Udata,
};
pub use metrics::{CacheMetrics, Counter, Gauge};
pub use space::{ChunkPiece, Hyperslab, Selection};

/// Errors surfaced by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A chunk buffer could not be allocated
    #[error("unable to allocate {bytes} bytes for chunk buffer")]
    Allocation { bytes: usize },

    /// A layout callback reported failure
    #[error("layout callback `{op}` failed")]
    Layout {
        op: &'static str,
        #[source]
        source: LayoutError,
    },

    /// An internal invariant does not hold
    #[error("invalid cache state: {0}")]
    InvalidState(String),

    /// The operation needs a callback the layout does not implement
    #[error("layout does not implement `{op}`")]
    NotSupported { op: &'static str },

    /// The caller's request is malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Raw block transfer through the file driver failed
    #[error("file driver I/O failed")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub(crate) fn layout(op: &'static str) -> impl FnOnce(LayoutError) -> CacheError {
        move |source| CacheError::Layout { op, source }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
