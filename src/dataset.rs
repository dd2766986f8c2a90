use crate::layout::LayoutOps;
use crate::space::chunk_nelem;
use crate::{CacheError, Result};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Identity of a dataset within one file, assigned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(pub u64);

/// A chunked dataset as the cache sees it.
///
/// The extent is mutable (see [`Dataset::set_extent`]); chunk shape, element
/// size, fill value and layout are fixed for the dataset's lifetime.
pub struct Dataset {
    id: DatasetId,
    dims: RwLock<Vec<u64>>,
    chunk_dims: Vec<u64>,
    elem_size: usize,
    fill_value: Vec<u8>,
    layout: Arc<dyn LayoutOps>,
}

impl Dataset {
    /// Describe a dataset whose file element size is `elem_size` bytes.
    ///
    /// The fill value defaults to all-zero bytes.
    pub fn new(
        id: DatasetId,
        dims: Vec<u64>,
        chunk_dims: Vec<u64>,
        elem_size: usize,
        layout: Arc<dyn LayoutOps>,
    ) -> Result<Self> {
        if chunk_dims.is_empty() || chunk_dims.len() != dims.len() {
            return Err(CacheError::InvalidRequest(format!(
                "chunk rank {} must be non-zero and match dataset rank {}",
                chunk_dims.len(),
                dims.len()
            )));
        }
        if chunk_dims.contains(&0) || elem_size == 0 {
            return Err(CacheError::InvalidRequest(
                "chunk dimensions and element size must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            id,
            dims: RwLock::new(dims),
            chunk_dims,
            elem_size,
            fill_value: vec![0; elem_size],
            layout,
        })
    }

    pub fn with_fill_value(mut self, fill_value: Vec<u8>) -> Result<Self> {
        if fill_value.len() != self.elem_size {
            return Err(CacheError::InvalidRequest(format!(
                "fill value is {} bytes, element size is {}",
                fill_value.len(),
                self.elem_size
            )));
        }
        self.fill_value = fill_value;
        Ok(self)
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn rank(&self) -> usize {
        self.chunk_dims.len()
    }

    /// Current extent.
    pub fn dims(&self) -> Vec<u64> {
        self.dims.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Change the extent, returning the previous one.
    ///
    /// Callers follow this with [`crate::Cache::set_extent_notify`] so cached
    /// and on-disk chunks are reconciled with the new shape.
    pub fn set_extent(&self, dims: Vec<u64>) -> Result<Vec<u64>> {
        if dims.len() != self.rank() {
            return Err(CacheError::InvalidRequest(format!(
                "new extent has rank {}, dataset rank is {}",
                dims.len(),
                self.rank()
            )));
        }
        let mut guard = self.dims.write().unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::replace(&mut *guard, dims))
    }

    pub fn chunk_dims(&self) -> &[u64] {
        &self.chunk_dims
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn fill_value(&self) -> &[u8] {
        &self.fill_value
    }

    pub fn layout(&self) -> &dyn LayoutOps {
        self.layout.as_ref()
    }

    pub fn chunk_nelem(&self) -> u64 {
        chunk_nelem(&self.chunk_dims)
    }

    /// Size in bytes of a fully populated, decoded chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_nelem() as usize * self.elem_size
    }

    /// Convert a chunk's element offset into scaled chunk-grid coordinates.
    pub fn scaled_for_offset(&self, offset: &[u64]) -> Result<Vec<u64>> {
        if offset.len() != self.rank() {
            return Err(CacheError::InvalidRequest(format!(
                "chunk offset has rank {}, dataset rank is {}",
                offset.len(),
                self.rank()
            )));
        }
        offset
            .iter()
            .zip(&self.chunk_dims)
            .map(|(&o, &c)| {
                if o % c != 0 {
                    Err(CacheError::InvalidRequest(format!(
                        "offset {o} is not aligned to chunk dimension {c}"
                    )))
                } else {
                    Ok(o / c)
                }
            })
            .collect()
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("dims", &self.dims())
            .field("chunk_dims", &self.chunk_dims)
            .field("elem_size", &self.elem_size)
            .finish_non_exhaustive()
    }
}
