//! Element-level read/write dispatch and raw chunk transfers.
//!
//! Every request is split into per-chunk pieces. For each piece the engine
//! tries, in order:
//!
//! 1. a direct transfer between disk and user memory, when direct I/O is
//!    enabled, no type conversion is needed and the layout agrees;
//! 2. the cached path: materialise the chunk, then scatter (read) or gather
//!    (write) through the layout or the built-in element copy.
//!
//! A failing piece aborts the whole call. Pieces already transferred stay
//! transferred.

use crate::buffer::{ChunkBuf, zeroed};
use crate::cache::Cache;
use crate::convert::{IoTypeInfo, fill_mem, gather, scatter};
use crate::dataset::Dataset;
use crate::entry::{Defined, PinGuard};
use crate::index::ChunkKey;
use crate::layout::{Callback, ChunkInsert, ChunkLookup, DirectIo, IoVec, MemTransfer, Udata};
use crate::space::{ChunkPiece, Hyperslab, Selection, decompose};
use crate::{CacheError, Result};
use std::sync::Arc;
use tracing::{debug, trace};

/// Read the elements of `selection` into `buf`, packed in row-major order
/// of the selection.
pub struct ReadRequest<'a> {
    pub dataset: &'a Arc<Dataset>,
    pub selection: Hyperslab,
    pub buf: &'a mut [u8],
}

/// Write the elements packed in `buf` to `selection`.
pub struct WriteRequest<'a> {
    pub dataset: &'a Arc<Dataset>,
    pub selection: Hyperslab,
    pub buf: &'a [u8],
}

/// A direct transfer the layout agreed to.
enum DirectPlan {
    /// Element `k` of the selection (or its on-disk reordering) lives at
    /// `addr + index * elem_size`.
    Selection(Option<Selection>),
    Vector(Vec<IoVec>),
}

fn pieces(
    dset: &Dataset,
    selection: &Hyperslab,
    buf_len: usize,
    types: &IoTypeInfo,
) -> Result<Vec<ChunkPiece>> {
    types.check(dset)?;
    selection.validate(&dset.dims())?;
    let expected = selection.nelem() as usize * types.mem_elem_size();
    if buf_len != expected {
        return Err(CacheError::InvalidRequest(format!(
            "memory buffer holds {buf_len} bytes, selection needs {expected}"
        )));
    }
    Ok(decompose(selection, dset.chunk_dims()))
}

/// Group parallel chunk/memory indices into runs contiguous in both.
fn runs<'a>(
    selection: impl Iterator<Item = u64> + 'a,
    mem_index: &'a [usize],
) -> impl Iterator<Item = (u64, usize, usize)> + 'a {
    let mut pairs = selection.zip(mem_index.iter().copied()).peekable();
    std::iter::from_fn(move || {
        let (idx, mi) = pairs.next()?;
        let mut len = 1;
        while let Some(&(next_idx, next_mi)) = pairs.peek() {
            if next_idx != idx + len as u64 || next_mi != mi + len {
                break;
            }
            pairs.next();
            len += 1;
        }
        Some((idx, mi, len))
    })
}

/// Byte range of `count` memory elements starting at element `mi`.
fn mem_range(
    mem_len: usize,
    mi: usize,
    elem: usize,
    count: usize,
) -> Result<std::ops::Range<usize>> {
    let start = mi * elem;
    let end = start + elem * count;
    if end > mem_len {
        return Err(CacheError::InvalidState(format!(
            "memory element {mi} lies outside the request buffer"
        )));
    }
    Ok(start..end)
}

impl Cache {
    /// Read a batch of requests.
    pub fn read(&self, requests: &mut [ReadRequest<'_>], types: &IoTypeInfo) -> Result<()> {
        for req in requests.iter_mut() {
            let dset = req.dataset;
            let pieces = pieces(dset, &req.selection, req.buf.len(), types)?;
            let lookups = self.lookup_missing(dset, &pieces)?;
            for (piece, lookup) in pieces.iter().zip(lookups) {
                self.read_piece(dset, piece, lookup, types, req.buf)?;
            }
        }
        Ok(())
    }

    /// Write a batch of requests.
    pub fn write(&self, requests: &[WriteRequest<'_>], types: &IoTypeInfo) -> Result<()> {
        for req in requests {
            let dset = req.dataset;
            let pieces = pieces(dset, &req.selection, req.buf.len(), types)?;
            let lookups = self.lookup_missing(dset, &pieces)?;
            for (piece, lookup) in pieces.iter().zip(lookups) {
                self.write_piece(dset, piece, lookup, types, req.buf)?;
            }
        }
        Ok(())
    }

    /// Read a chunk's on-disk bytes as stored, flushing its cached copy first
    /// if that is dirty.
    ///
    /// `offset` is the element coordinate of the chunk's first element.
    pub fn direct_chunk_read(&self, dset: &Arc<Dataset>, offset: &[u64]) -> Result<Vec<u8>> {
        let scaled = dset.scaled_for_offset(offset)?;
        self.flush_chunk(dset, &scaled)?;

        let lookup = self.lookup_one(dset, &scaled)?;
        let Some(addr) = lookup.addr else {
            return Err(CacheError::InvalidRequest(format!(
                "chunk at {offset:?} is not allocated"
            )));
        };
        let len = usize::try_from(lookup.disk_size).map_err(|_| {
            CacheError::InvalidState(format!("chunk size {} overflows", lookup.disk_size))
        })?;
        let mut data = zeroed(len)?;
        self.file.read_at(addr, &mut data)?;
        trace!(dataset = dset.id().0, ?scaled, len, "direct chunk read");
        Ok(data)
    }

    /// Store `data` as a chunk's on-disk bytes, discarding any cached copy.
    pub fn direct_chunk_write(
        &self,
        dset: &Arc<Dataset>,
        offset: &[u64],
        data: &[u8],
    ) -> Result<()> {
        let scaled = dset.scaled_for_offset(offset)?;
        let key = ChunkKey::new(dset.id(), scaled.clone());
        {
            let mut index = self.index();
            if let Some(slot) = index.find(&key).cloned() {
                if slot.pin_count() > 0 {
                    return Err(CacheError::InvalidState(format!(
                        "chunk at {offset:?} is in use"
                    )));
                }
                index.remove(&key);
                self.release(&mut slot.lock())?;
                self.metrics.evictions.increment();
                self.update_gauges(&index);
            }
        }

        let lookup = self.lookup_one(dset, &scaled)?;
        let mut chunk = [ChunkInsert {
            scaled: &scaled,
            addr: lookup.addr,
            old_disk_size: lookup.disk_size,
            new_disk_size: data.len() as u64,
            data,
        }];
        dset.layout()
            .insert(dset, &mut chunk)
            .map_err(CacheError::layout("insert"))?;
        self.metrics.inserts.increment();
        let addr = chunk[0].addr.ok_or_else(|| {
            CacheError::InvalidState("insert left the chunk without an address".to_string())
        })?;
        self.file.write_at(addr, data)?;
        debug!(dataset = dset.id().0, ?scaled, addr, len = data.len(), "direct chunk write");
        Ok(())
    }

    /// Batch-lookup every piece not cached at the time of the call.
    fn lookup_missing(
        &self,
        dset: &Dataset,
        pieces: &[ChunkPiece],
    ) -> Result<Vec<Option<ChunkLookup>>> {
        let missing: Vec<usize> = {
            let index = self.index();
            (0..pieces.len())
                .filter(|&i| !index.contains(&ChunkKey::new(dset.id(), pieces[i].scaled.clone())))
                .collect()
        };
        let scaled: Vec<&[u64]> = missing.iter().map(|&i| pieces[i].scaled.as_slice()).collect();
        let found = self.lookup(dset, &scaled)?;

        let mut lookups: Vec<Option<ChunkLookup>> = (0..pieces.len()).map(|_| None).collect();
        for (i, lookup) in missing.into_iter().zip(found) {
            lookups[i] = Some(lookup);
        }
        Ok(lookups)
    }

    fn read_piece(
        &self,
        dset: &Arc<Dataset>,
        piece: &ChunkPiece,
        lookup: Option<ChunkLookup>,
        types: &IoTypeInfo,
        mem: &mut [u8],
    ) -> Result<()> {
        let key = ChunkKey::new(dset.id(), piece.scaled.clone());
        let direct = self.config.direct_io && !types.needs_conversion();

        let pinned = self.index().pin(&key);
        if let Some(pin) = pinned {
            self.metrics.hits.increment();
            if direct && self.read_resident_direct(dset, &pin, piece, mem)? {
                return Ok(());
            }
            self.read_cached(dset, &pin, piece, types, mem)?;
            return self.settle(&pin);
        }

        self.metrics.misses.increment();
        let lookup = match lookup {
            Some(lookup) => lookup,
            None => self.lookup_one(dset, &piece.scaled)?,
        };
        let Some(addr) = lookup.addr else {
            trace!(dataset = dset.id().0, scaled = ?piece.scaled, "unallocated chunk read as fill");
            return fill_mem(mem, dset.fill_value(), types, piece.mem_index.iter().copied());
        };
        let udata = lookup.udata.as_ref();
        if direct
            && let Some(plan) = self.plan(dset, addr, &piece.selection, None, udata, false)?
        {
            return self.direct_read(dset, addr, &plan, piece, mem);
        }

        let entry = self.materialise(dset, &piece.scaled, lookup, true)?;
        let pin = {
            let mut index = self.index();
            self.install(&mut index, entry)?
        };
        self.read_cached(dset, &pin, piece, types, mem)?;
        self.settle(&pin)
    }

    fn write_piece(
        &self,
        dset: &Arc<Dataset>,
        piece: &ChunkPiece,
        mut lookup: Option<ChunkLookup>,
        types: &IoTypeInfo,
        mem: &[u8],
    ) -> Result<()> {
        let key = ChunkKey::new(dset.id(), piece.scaled.clone());
        let direct = self.config.direct_io && !types.needs_conversion();

        let pinned = self.index().pin(&key);
        if let Some(pin) = pinned {
            self.metrics.hits.increment();
            let bypass = direct
                && self.resident_write_is_direct(dset, &pin, piece)?
                && self.evict_sole(&pin)?;
            if !bypass {
                self.write_cached(dset, &pin, piece, types, mem)?;
                return self.settle(&pin);
            }
            // the cached copy is gone; the chunk may have moved on disk
            lookup = None;
        } else {
            self.metrics.misses.increment();
        }

        let lookup = match lookup {
            Some(lookup) => lookup,
            None => self.lookup_one(dset, &piece.scaled)?,
        };
        let udata = lookup.udata.as_ref();
        if direct
            && let Some(addr) = lookup.addr
            && let Some(plan) = self.plan(dset, addr, &piece.selection, None, udata, true)?
        {
            return self.direct_write(dset, addr, &plan, piece, mem);
        }

        let entry = if piece.selection.is_all(dset.chunk_nelem()) {
            // every element gets overwritten; skip reading the old image
            let (addr, disk_size) = (lookup.addr, lookup.disk_size);
            let mut entry =
                self.materialise(dset, &piece.scaled, ChunkLookup { addr: None, ..lookup }, false)?;
            entry.addr = addr;
            entry.disk_size = disk_size;
            entry
        } else {
            self.materialise(dset, &piece.scaled, lookup, true)?
        };
        let pin = {
            let mut index = self.index();
            self.install(&mut index, entry)?
        };
        self.write_cached(dset, &pin, piece, types, mem)?;
        self.settle(&pin)
    }

    /// Ask the layout whether `selection` can move without the chunk buffer.
    fn plan(
        &self,
        dset: &Dataset,
        addr: u64,
        selection: &Selection,
        chunk: Option<&ChunkBuf>,
        udata: Option<&Udata>,
        write: bool,
    ) -> Result<Option<DirectPlan>> {
        let layout = dset.layout();
        let by_selection = if write {
            layout
                .selection_write(dset, selection, chunk, udata)
                .map_err(CacheError::layout("selection_write"))?
        } else {
            layout
                .selection_read(dset, selection, chunk, udata)
                .map_err(CacheError::layout("selection_read"))?
        };
        match by_selection {
            Callback::Done(DirectIo::Possible(order)) => {
                return Ok(Some(DirectPlan::Selection(order)));
            }
            Callback::Done(DirectIo::NotPossible) => return Ok(None),
            Callback::NotImplemented => {}
        }

        let by_vector = if write {
            layout
                .vector_write(dset, addr, selection, chunk, udata)
                .map_err(CacheError::layout("vector_write"))?
        } else {
            layout
                .vector_read(dset, addr, selection, chunk, udata)
                .map_err(CacheError::layout("vector_read"))?
        };
        Ok(match by_vector {
            Callback::Done(DirectIo::Possible(iov)) => Some(DirectPlan::Vector(iov)),
            _ => None,
        })
    }

    fn direct_read(
        &self,
        dset: &Dataset,
        addr: u64,
        plan: &DirectPlan,
        piece: &ChunkPiece,
        mem: &mut [u8],
    ) -> Result<()> {
        let elem = dset.elem_size();
        match plan {
            DirectPlan::Selection(order) => {
                let on_disk = order.as_ref().unwrap_or(&piece.selection);
                check_order(on_disk, piece)?;
                for (idx, mi, len) in runs(on_disk.iter(), &piece.mem_index) {
                    let range = mem_range(mem.len(), mi, elem, len)?;
                    self.file.read_at(addr + idx * elem as u64, &mut mem[range])?;
                }
            }
            DirectPlan::Vector(iov) => {
                let mut staging = zeroed(piece.selection.len() * elem)?;
                check_vector(iov, staging.len())?;
                let mut at = 0;
                for v in iov {
                    self.file.read_at(v.offset, &mut staging[at..at + v.len])?;
                    at += v.len;
                }
                for (k, &mi) in piece.mem_index.iter().enumerate() {
                    let range = mem_range(mem.len(), mi, elem, 1)?;
                    mem[range].copy_from_slice(&staging[k * elem..(k + 1) * elem]);
                }
            }
        }
        self.metrics.bypass_reads.increment();
        trace!(dataset = dset.id().0, scaled = ?piece.scaled, "direct read");
        Ok(())
    }

    fn direct_write(
        &self,
        dset: &Dataset,
        addr: u64,
        plan: &DirectPlan,
        piece: &ChunkPiece,
        mem: &[u8],
    ) -> Result<()> {
        let elem = dset.elem_size();
        match plan {
            DirectPlan::Selection(order) => {
                let on_disk = order.as_ref().unwrap_or(&piece.selection);
                check_order(on_disk, piece)?;
                for (idx, mi, len) in runs(on_disk.iter(), &piece.mem_index) {
                    let range = mem_range(mem.len(), mi, elem, len)?;
                    self.file.write_at(addr + idx * elem as u64, &mem[range])?;
                }
            }
            DirectPlan::Vector(iov) => {
                let mut staging = zeroed(piece.mem_index.len() * elem)?;
                for (k, &mi) in piece.mem_index.iter().enumerate() {
                    let range = mem_range(mem.len(), mi, elem, 1)?;
                    staging[k * elem..(k + 1) * elem].copy_from_slice(&mem[range]);
                }
                check_vector(iov, staging.len())?;
                let mut at = 0;
                for v in iov {
                    self.file.write_at(v.offset, &staging[at..at + v.len])?;
                    at += v.len;
                }
            }
        }
        self.metrics.bypass_writes.increment();
        trace!(dataset = dset.id().0, scaled = ?piece.scaled, "direct write");
        Ok(())
    }

    /// Serve a read of a resident chunk straight from disk if the layout
    /// allows it, flushing the cached copy first when dirty.
    ///
    /// Chunks never written to disk are always served from the cache.
    fn read_resident_direct(
        &self,
        dset: &Dataset,
        pin: &PinGuard,
        piece: &ChunkPiece,
        mem: &mut [u8],
    ) -> Result<bool> {
        let mut guard = pin.lock();
        let entry = &mut *guard;
        let Some(addr) = entry.addr else {
            return Ok(false);
        };
        if entry.dirty {
            let chunk = entry.values_resident.then_some(&entry.buf);
            if self
                .plan(dset, addr, &piece.selection, chunk, entry.udata.as_ref(), false)?
                .is_none()
            {
                return Ok(false);
            }
            self.persist(&mut [&mut *entry], false)?;
        }
        let Some(addr) = entry.addr else {
            return Ok(false);
        };
        let chunk = entry.values_resident.then_some(&entry.buf);
        match self.plan(dset, addr, &piece.selection, chunk, entry.udata.as_ref(), false)? {
            Some(plan) => {
                self.direct_read(dset, addr, &plan, piece, mem)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn resident_write_is_direct(
        &self,
        dset: &Dataset,
        pin: &PinGuard,
        piece: &ChunkPiece,
    ) -> Result<bool> {
        let guard = pin.lock();
        let Some(addr) = guard.addr else {
            return Ok(false);
        };
        let chunk = guard.values_resident.then_some(&guard.buf);
        Ok(self
            .plan(dset, addr, &piece.selection, chunk, guard.udata.as_ref(), true)?
            .is_some())
    }

    /// Flush and evict a resident chunk ahead of a direct write, unless
    /// another operation is using it.
    fn evict_sole(&self, pin: &PinGuard) -> Result<bool> {
        let mut index = self.index();
        if pin.pin_count() != 1 {
            return Ok(false);
        }
        let mut guard = pin.lock();
        let entry = &mut *guard;
        if entry.dirty {
            self.persist(&mut [&mut *entry], true)?;
        }
        index.remove(pin.key());
        self.release(entry)?;
        self.metrics.evictions.increment();
        self.update_gauges(&index);
        trace!(scaled = ?entry.scaled, "evicted ahead of direct write");
        Ok(true)
    }

    fn read_cached(
        &self,
        dset: &Dataset,
        pin: &PinGuard,
        piece: &ChunkPiece,
        types: &IoTypeInfo,
        mem: &mut [u8],
    ) -> Result<()> {
        let mut guard = pin.lock();
        let entry = &mut *guard;
        self.ensure_values(entry)?;

        match &entry.defined {
            Defined::All => {
                let xfer = MemTransfer {
                    selection: &piece.selection,
                    mem_index: &piece.mem_index,
                    types,
                };
                scatter_chunk(dset, &xfer, &entry.buf, mem)
            }
            Defined::Some(defined) => {
                let mut points = Vec::new();
                let mut mem_index = Vec::new();
                let mut undefined = Vec::new();
                let mut undefined_mem = Vec::new();
                for (idx, &mi) in piece.selection.iter().zip(&piece.mem_index) {
                    if defined.contains(idx) {
                        points.push(idx);
                        mem_index.push(mi);
                    } else {
                        undefined.push(idx);
                        undefined_mem.push(mi);
                    }
                }
                if !points.is_empty() {
                    let selection = Selection::from_sorted(points);
                    let xfer = MemTransfer {
                        selection: &selection,
                        mem_index: &mem_index,
                        types,
                    };
                    scatter_chunk(dset, &xfer, &entry.buf, mem)?;
                }
                if undefined.is_empty() {
                    return Ok(());
                }

                // the cached chunk keeps its undefined elements untouched
                let selection = Selection::from_sorted(undefined);
                let mut scratch = entry.buf.try_clone()?;
                let filled = dset
                    .layout()
                    .fill(dset, &selection, &mut scratch)
                    .map_err(CacheError::layout("fill"))?;
                if !filled.is_implemented() {
                    return fill_mem(mem, dset.fill_value(), types, undefined_mem.into_iter());
                }
                scratch.check("fill")?;
                let xfer = MemTransfer {
                    selection: &selection,
                    mem_index: &undefined_mem,
                    types,
                };
                scatter_chunk(dset, &xfer, &scratch, mem)
            }
        }
    }

    fn write_cached(
        &self,
        dset: &Dataset,
        pin: &PinGuard,
        piece: &ChunkPiece,
        types: &IoTypeInfo,
        mem: &[u8],
    ) -> Result<()> {
        let mut guard = pin.lock();
        let entry = &mut *guard;
        self.ensure_values(entry)?;

        let before = entry.buf.alloc_size();
        let xfer = MemTransfer {
            selection: &piece.selection,
            mem_index: &piece.mem_index,
            types,
        };
        let layout = dset.layout();
        match layout
            .gather_mem(dset, &xfer, mem, &mut entry.buf)
            .map_err(CacheError::layout("gather_mem"))?
        {
            Callback::Done(()) => entry.buf.check("gather_mem")?,
            Callback::NotImplemented => gather(mem, &xfer, dset.elem_size(), entry.buf.data_mut())?,
        }
        entry.defined.extend(&piece.selection, dset.chunk_nelem());
        self.mark_dirty(entry);

        if entry.buf.alloc_size() > before
            && layout
                .condense(dset, &mut entry.buf)
                .map_err(CacheError::layout("condense"))?
                .is_implemented()
        {
            entry.buf.check("condense")?;
        }
        Ok(())
    }
}

fn scatter_chunk(
    dset: &Dataset,
    xfer: &MemTransfer<'_>,
    chunk: &ChunkBuf,
    mem: &mut [u8],
) -> Result<()> {
    match dset
        .layout()
        .scatter_mem(dset, xfer, chunk, mem)
        .map_err(CacheError::layout("scatter_mem"))?
    {
        Callback::Done(()) => Ok(()),
        Callback::NotImplemented => scatter(chunk.data(), dset.elem_size(), xfer, mem),
    }
}

fn check_order(on_disk: &Selection, piece: &ChunkPiece) -> Result<()> {
    if on_disk.len() != piece.mem_index.len() {
        return Err(CacheError::InvalidState(format!(
            "direct transfer covers {} elements, request has {}",
            on_disk.len(),
            piece.mem_index.len()
        )));
    }
    Ok(())
}

fn check_vector(iov: &[IoVec], expected: usize) -> Result<()> {
    let total: usize = iov.iter().map(|v| v.len).sum();
    if total != expected {
        return Err(CacheError::InvalidState(format!(
            "vector transfer covers {total} bytes, request has {expected}"
        )));
    }
    Ok(())
}
