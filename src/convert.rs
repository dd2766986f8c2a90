//! Memory/file type handling and the copy paths used when a layout does not
//! provide its own scatter, gather or fill.

use crate::dataset::Dataset;
use crate::layout::MemTransfer;
use crate::{CacheError, Result};
use std::fmt;
use std::sync::Arc;

/// Element-wise conversion between the file type and the memory type.
///
/// Each call converts exactly one element.
pub trait TypeConversion: Send + Sync {
    fn file_to_mem(&self, file: &[u8], mem: &mut [u8]);

    fn mem_to_file(&self, mem: &[u8], file: &mut [u8]);
}

/// Memory-side type information for a batch of requests.
#[derive(Clone)]
pub struct IoTypeInfo {
    mem_elem_size: usize,
    conversion: Option<Arc<dyn TypeConversion>>,
}

impl IoTypeInfo {
    /// Memory type identical to the file type.
    pub fn native(elem_size: usize) -> Self {
        Self {
            mem_elem_size: elem_size,
            conversion: None,
        }
    }

    pub fn converted(mem_elem_size: usize, conversion: Arc<dyn TypeConversion>) -> Self {
        Self {
            mem_elem_size,
            conversion: Some(conversion),
        }
    }

    pub fn mem_elem_size(&self) -> usize {
        self.mem_elem_size
    }

    pub fn needs_conversion(&self) -> bool {
        self.conversion.is_some()
    }

    pub(crate) fn check(&self, dset: &Dataset) -> Result<()> {
        if self.conversion.is_none() && self.mem_elem_size != dset.elem_size() {
            return Err(CacheError::InvalidRequest(format!(
                "memory element size {} differs from file element size {} without a conversion",
                self.mem_elem_size,
                dset.elem_size()
            )));
        }
        Ok(())
    }

    pub fn to_mem(&self, file: &[u8], mem: &mut [u8]) {
        match &self.conversion {
            Some(conv) => conv.file_to_mem(file, mem),
            None => mem.copy_from_slice(file),
        }
    }

    pub fn to_file(&self, mem: &[u8], file: &mut [u8]) {
        match &self.conversion {
            Some(conv) => conv.mem_to_file(mem, file),
            None => file.copy_from_slice(mem),
        }
    }
}

impl fmt::Debug for IoTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoTypeInfo")
            .field("mem_elem_size", &self.mem_elem_size)
            .field("conversion", &self.conversion.is_some())
            .finish()
    }
}

fn out_of_bounds(what: &str, index: u64) -> CacheError {
    CacheError::InvalidState(format!("{what} element {index} lies outside its buffer"))
}

/// Copy selected chunk elements into memory, converting each one.
pub(crate) fn scatter(
    chunk: &[u8],
    elem: usize,
    xfer: &MemTransfer<'_>,
    mem: &mut [u8],
) -> Result<()> {
    let melem = xfer.types.mem_elem_size();
    for (idx, &mi) in xfer.selection.iter().zip(xfer.mem_index) {
        let src = idx as usize * elem;
        let dst = mi * melem;
        let src = chunk
            .get(src..src + elem)
            .ok_or_else(|| out_of_bounds("chunk", idx))?;
        let dst = mem
            .get_mut(dst..dst + melem)
            .ok_or_else(|| out_of_bounds("memory", mi as u64))?;
        xfer.types.to_mem(src, dst);
    }
    Ok(())
}

/// Copy memory elements into the selected chunk elements, converting each one.
pub(crate) fn gather(
    mem: &[u8],
    xfer: &MemTransfer<'_>,
    elem: usize,
    chunk: &mut [u8],
) -> Result<()> {
    let melem = xfer.types.mem_elem_size();
    for (idx, &mi) in xfer.selection.iter().zip(xfer.mem_index) {
        let src = mi * melem;
        let dst = idx as usize * elem;
        let src = mem
            .get(src..src + melem)
            .ok_or_else(|| out_of_bounds("memory", mi as u64))?;
        let dst = chunk
            .get_mut(dst..dst + elem)
            .ok_or_else(|| out_of_bounds("chunk", idx))?;
        xfer.types.to_file(src, dst);
    }
    Ok(())
}

/// Write the fill value into the selected chunk elements.
pub(crate) fn fill_chunk(
    chunk: &mut [u8],
    fill: &[u8],
    selection: impl Iterator<Item = u64>,
) -> Result<()> {
    let elem = fill.len();
    for idx in selection {
        let at = idx as usize * elem;
        chunk
            .get_mut(at..at + elem)
            .ok_or_else(|| out_of_bounds("chunk", idx))?
            .copy_from_slice(fill);
    }
    Ok(())
}

/// Write the fill value, converted to the memory type, at `mem_index`.
pub(crate) fn fill_mem(
    mem: &mut [u8],
    fill: &[u8],
    types: &IoTypeInfo,
    mem_index: impl Iterator<Item = usize>,
) -> Result<()> {
    let melem = types.mem_elem_size();
    let mut converted = vec![0u8; melem];
    types.to_mem(fill, &mut converted);
    for mi in mem_index {
        let at = mi * melem;
        mem.get_mut(at..at + melem)
            .ok_or_else(|| out_of_bounds("memory", mi as u64))?
            .copy_from_slice(&converted);
    }
    Ok(())
}
