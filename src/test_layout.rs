//! In-memory chunk layout used by the unit tests.
//!
//! Keeps its on-disk index in a map and counts every callback it receives,
//! so tests can assert which paths the cache took. Capabilities are switched
//! on per test through [`Caps`].

use crate::buffer::ChunkBuf;
use crate::cache::{Cache, CacheBuilder};
use crate::convert::TypeConversion;
use crate::dataset::{Dataset, DatasetId};
use crate::file::MemFile;
use crate::layout::{
    Callback, ChunkInsert, ChunkLookup, DirectIo, Encoded, IoVec, LayoutError, LayoutOps,
    LayoutResult, MemTransfer, NewChunk, Udata,
};
use crate::space::Selection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Caps {
    /// Run-length encode chunks on disk.
    pub compress: bool,
    /// Keep a one-byte-per-element defined map in front of the values.
    pub sparse: bool,
    pub selection_io: bool,
    pub vector_io: bool,
    pub delete: bool,
    pub enumerate: bool,
    pub in_place: bool,
    pub condense: bool,
}

pub(crate) struct TestLayout {
    caps: Caps,
    chunks: Mutex<HashMap<Vec<u64>, (u64, u64)>>,
    next_addr: AtomicU64,
    calls: Mutex<HashMap<&'static str, usize>>,
    erased: Mutex<Option<Vec<u64>>>,
    fill_with: Mutex<Option<Vec<u8>>>,
    fail_insert: AtomicBool,
    fail_evict: AtomicBool,
}

impl TestLayout {
    pub(crate) fn new(caps: Caps) -> Arc<Self> {
        Arc::new(Self {
            caps,
            chunks: Mutex::new(HashMap::new()),
            next_addr: AtomicU64::new(0),
            calls: Mutex::new(HashMap::new()),
            erased: Mutex::new(None),
            fill_with: Mutex::new(None),
            fail_insert: AtomicBool::new(false),
            fail_evict: AtomicBool::new(false),
        })
    }

    pub(crate) fn plain() -> Arc<Self> {
        Self::new(Caps::default())
    }

    pub(crate) fn compressed() -> Arc<Self> {
        Self::new(Caps {
            compress: true,
            in_place: true,
            condense: true,
            ..Caps::default()
        })
    }

    pub(crate) fn sparse() -> Arc<Self> {
        Self::new(Caps {
            sparse: true,
            delete: true,
            enumerate: true,
            ..Caps::default()
        })
    }

    /// How many times the callback `op` was invoked.
    pub(crate) fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub(crate) fn fail_inserts(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::Relaxed);
    }

    pub(crate) fn fail_evicts(&self, fail: bool) {
        self.fail_evict.store(fail, Ordering::Relaxed);
    }

    /// Make the `fill` callback write `value` rather than the dataset's
    /// fill value.
    pub(crate) fn fill_with(&self, value: i32) {
        *self.fill_with.lock().unwrap() = Some(value.to_le_bytes().to_vec());
    }

    /// Record a different on-disk size for an allocated chunk.
    pub(crate) fn set_disk_size(&self, scaled: &[u64], size: u64) {
        if let Some(found) = self.chunks.lock().unwrap().get_mut(scaled) {
            found.1 = size;
        }
    }

    /// Address and size of a chunk in the on-disk index.
    pub(crate) fn on_disk(&self, scaled: &[u64]) -> Option<(u64, u64)> {
        self.chunks.lock().unwrap().get(scaled).copied()
    }

    /// Elements passed to the most recent `erase_values` call.
    pub(crate) fn last_erased(&self) -> Option<Vec<u64>> {
        self.erased.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str) {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
    }

    fn nelem(dset: &Dataset) -> usize {
        dset.chunk_nelem() as usize
    }

    /// Decoded size of a chunk.
    fn decoded_size(&self, dset: &Dataset) -> usize {
        if self.caps.sparse {
            Self::nelem(dset) + dset.chunk_bytes()
        } else {
            dset.chunk_bytes()
        }
    }

    /// Byte offset of the values within a decoded chunk.
    fn values_at(&self, dset: &Dataset) -> usize {
        if self.caps.sparse { Self::nelem(dset) } else { 0 }
    }

    fn write_fill(
        &self,
        dset: &Dataset,
        selection: &Selection,
        buf: &mut ChunkBuf,
        value: &[u8],
    ) -> Result<(), LayoutError> {
        let elem = dset.elem_size();
        let base = self.values_at(dset);
        for idx in selection.iter() {
            let at = base + idx as usize * elem;
            buf.data_mut()
                .get_mut(at..at + elem)
                .ok_or_else(|| LayoutError::new(format!("element {idx} outside chunk")))?
                .copy_from_slice(value);
        }
        Ok(())
    }

    fn direct(&self, enabled: bool) -> LayoutResult<DirectIo<Option<Selection>>> {
        if enabled && !self.caps.compress && !self.caps.sparse {
            Ok(Callback::Done(DirectIo::Possible(None)))
        } else {
            Ok(Callback::NotImplemented)
        }
    }

    fn vectors(
        &self,
        dset: &Dataset,
        addr: u64,
        selection: &Selection,
    ) -> LayoutResult<DirectIo<Vec<IoVec>>> {
        if !self.caps.vector_io || self.caps.compress || self.caps.sparse {
            return Ok(Callback::NotImplemented);
        }
        let elem = dset.elem_size();
        let iov = selection
            .iter()
            .map(|idx| IoVec {
                offset: addr + idx * elem as u64,
                len: elem,
            })
            .collect();
        Ok(Callback::Done(DirectIo::Possible(iov)))
    }
}

/// Run-length encoding as (count, byte) pairs.
fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = data.iter().peekable();
    while let Some(&byte) = iter.next() {
        let mut run = 1u8;
        while run < u8::MAX && iter.peek() == Some(&&byte) {
            iter.next();
            run += 1;
        }
        out.extend_from_slice(&[run, byte]);
    }
    out
}

fn rle_decode(data: &[u8]) -> Result<Vec<u8>, LayoutError> {
    if data.len() % 2 != 0 {
        return Err(LayoutError::new("truncated run-length image"));
    }
    Ok(data
        .chunks_exact(2)
        .flat_map(|pair| std::iter::repeat_n(pair[1], pair[0] as usize))
        .collect())
}

impl LayoutOps for TestLayout {
    fn lookup(&self, dset: &Dataset, scaled: &[&[u64]]) -> Result<Vec<ChunkLookup>, LayoutError> {
        self.record("lookup");
        let chunks = self.chunks.lock().unwrap();
        let hint = self.decoded_size(dset);
        Ok(scaled
            .iter()
            .map(|s| match chunks.get(*s) {
                Some(&(addr, size)) => {
                    let mut found = ChunkLookup::allocated(addr, size, hint)
                        .with_udata(Box::new(s.to_vec()));
                    if self.caps.sparse {
                        found.defined_values_size = Self::nelem(dset) as u64;
                        found.defined_values_size_hint = Self::nelem(dset);
                    }
                    found
                }
                None => ChunkLookup::unallocated(hint),
            })
            .collect())
    }

    fn decode(
        &self,
        _dset: &Dataset,
        buf: &mut ChunkBuf,
        _udata: Option<&mut Udata>,
    ) -> LayoutResult<()> {
        self.record("decode");
        if !self.caps.compress {
            return Ok(Callback::NotImplemented);
        }
        let decoded = rle_decode(buf.used())?;
        buf.replace(decoded);
        Ok(Callback::Done(()))
    }

    fn decode_defined_values(&self, _dset: &Dataset, _buf: &mut ChunkBuf) -> LayoutResult<()> {
        self.record("decode_defined_values");
        // the map is stored as is
        Ok(if self.caps.sparse {
            Callback::Done(())
        } else {
            Callback::NotImplemented
        })
    }

    fn new_chunk(
        &self,
        dset: &Dataset,
        scaled: &[u64],
        fill: bool,
    ) -> Result<NewChunk, LayoutError> {
        self.record("new_chunk");
        if fill {
            self.record("new_chunk_fill");
        }
        let size = self.decoded_size(dset);
        let mut buf = ChunkBuf::from_vec(vec![0; size]);
        if fill || self.caps.sparse {
            let all = Selection::all(dset.chunk_nelem());
            self.write_fill(dset, &all, &mut buf, dset.fill_value())?;
        }
        Ok(NewChunk {
            buf,
            udata: Some(Box::new(scaled.to_vec())),
        })
    }

    fn condense(&self, _dset: &Dataset, buf: &mut ChunkBuf) -> LayoutResult<()> {
        self.record("condense");
        if !self.caps.condense {
            return Ok(Callback::NotImplemented);
        }
        buf.shrink_to_used();
        Ok(Callback::Done(()))
    }

    fn encode(&self, _dset: &Dataset, buf: &ChunkBuf) -> Result<Encoded, LayoutError> {
        self.record("encode");
        Ok(if self.caps.compress {
            Encoded::Buffer(rle_encode(buf.used()))
        } else {
            Encoded::Unchanged
        })
    }

    fn encode_in_place(&self, _dset: &Dataset, buf: &mut ChunkBuf) -> LayoutResult<()> {
        self.record("encode_in_place");
        if !(self.caps.in_place && self.caps.compress) {
            return Ok(Callback::NotImplemented);
        }
        let image = rle_encode(buf.used());
        buf.replace(image);
        Ok(Callback::Done(()))
    }

    fn evict(&self, _dset: &Dataset, buf: ChunkBuf, udata: Option<Udata>) -> LayoutResult<()> {
        self.record("evict");
        drop((buf, udata));
        if self.fail_evict.load(Ordering::Relaxed) {
            return Err(LayoutError::new("evict refused"));
        }
        Ok(Callback::Done(()))
    }

    fn insert(&self, _dset: &Dataset, chunks: &mut [ChunkInsert<'_>]) -> Result<(), LayoutError> {
        self.record("insert");
        if self.fail_insert.load(Ordering::Relaxed) {
            return Err(LayoutError::new("insert refused"));
        }
        let mut index = self.chunks.lock().unwrap();
        for chunk in chunks.iter_mut() {
            let addr = match chunk.addr {
                Some(addr) if chunk.new_disk_size <= chunk.old_disk_size => addr,
                _ => self.next_addr.fetch_add(chunk.new_disk_size, Ordering::Relaxed),
            };
            chunk.addr = Some(addr);
            index.insert(chunk.scaled.to_vec(), (addr, chunk.new_disk_size));
        }
        Ok(())
    }

    fn selection_read(
        &self,
        _dset: &Dataset,
        _selection: &Selection,
        _chunk: Option<&ChunkBuf>,
        _udata: Option<&Udata>,
    ) -> LayoutResult<DirectIo<Option<Selection>>> {
        self.record("selection_read");
        self.direct(self.caps.selection_io)
    }

    fn vector_read(
        &self,
        dset: &Dataset,
        addr: u64,
        selection: &Selection,
        _chunk: Option<&ChunkBuf>,
        _udata: Option<&Udata>,
    ) -> LayoutResult<DirectIo<Vec<IoVec>>> {
        self.record("vector_read");
        self.vectors(dset, addr, selection)
    }

    fn selection_write(
        &self,
        _dset: &Dataset,
        _selection: &Selection,
        _chunk: Option<&ChunkBuf>,
        _udata: Option<&Udata>,
    ) -> LayoutResult<DirectIo<Option<Selection>>> {
        self.record("selection_write");
        self.direct(self.caps.selection_io)
    }

    fn vector_write(
        &self,
        dset: &Dataset,
        addr: u64,
        selection: &Selection,
        _chunk: Option<&ChunkBuf>,
        _udata: Option<&Udata>,
    ) -> LayoutResult<DirectIo<Vec<IoVec>>> {
        self.record("vector_write");
        self.vectors(dset, addr, selection)
    }

    fn scatter_mem(
        &self,
        dset: &Dataset,
        xfer: &MemTransfer<'_>,
        chunk: &ChunkBuf,
        mem: &mut [u8],
    ) -> LayoutResult<()> {
        self.record("scatter_mem");
        if !self.caps.sparse {
            return Ok(Callback::NotImplemented);
        }
        let elem = dset.elem_size();
        let melem = xfer.types.mem_elem_size();
        let values = &chunk.data()[Self::nelem(dset)..];
        for (idx, &mi) in xfer.selection.iter().zip(xfer.mem_index) {
            let at = idx as usize * elem;
            xfer.types
                .to_mem(&values[at..at + elem], &mut mem[mi * melem..(mi + 1) * melem]);
        }
        Ok(Callback::Done(()))
    }

    fn gather_mem(
        &self,
        dset: &Dataset,
        xfer: &MemTransfer<'_>,
        mem: &[u8],
        chunk: &mut ChunkBuf,
    ) -> LayoutResult<()> {
        self.record("gather_mem");
        if !self.caps.sparse {
            return Ok(Callback::NotImplemented);
        }
        let elem = dset.elem_size();
        let melem = xfer.types.mem_elem_size();
        let nelem = Self::nelem(dset);
        let data = chunk.data_mut();
        for (idx, &mi) in xfer.selection.iter().zip(xfer.mem_index) {
            let idx = idx as usize;
            data[idx] = 1;
            let at = nelem + idx * elem;
            xfer.types
                .to_file(&mem[mi * melem..(mi + 1) * melem], &mut data[at..at + elem]);
        }
        Ok(Callback::Done(()))
    }

    fn fill(
        &self,
        dset: &Dataset,
        selection: &Selection,
        chunk: &mut ChunkBuf,
    ) -> LayoutResult<()> {
        self.record("fill");
        if !self.caps.sparse {
            return Ok(Callback::NotImplemented);
        }
        let value = self.fill_with.lock().unwrap().clone();
        let value = value.as_deref().unwrap_or(dset.fill_value());
        self.write_fill(dset, selection, chunk, value)?;
        Ok(Callback::Done(()))
    }

    fn defined_values(
        &self,
        dset: &Dataset,
        selection: &Selection,
        chunk: &ChunkBuf,
    ) -> LayoutResult<Selection> {
        self.record("defined_values");
        if !self.caps.sparse {
            return Ok(Callback::NotImplemented);
        }
        let map = &chunk.data()[..Self::nelem(dset)];
        Ok(Callback::Done(Selection::from_points(
            selection.iter().filter(|&idx| map[idx as usize] != 0),
        )))
    }

    fn erase_values(
        &self,
        dset: &Dataset,
        selection: &Selection,
        chunk: &mut ChunkBuf,
    ) -> LayoutResult<bool> {
        self.record("erase_values");
        if !self.caps.sparse {
            return Ok(Callback::NotImplemented);
        }
        let nelem = Self::nelem(dset);
        for idx in selection.iter() {
            chunk.data_mut()[idx as usize] = 0;
        }
        self.write_fill(dset, selection, chunk, dset.fill_value())?;
        *self.erased.lock().unwrap() = Some(selection.as_slice().to_vec());
        let empty = chunk.data()[..nelem].iter().all(|&b| b == 0);
        Ok(Callback::Done(empty))
    }

    fn evict_values(&self, dset: &Dataset, chunk: &mut ChunkBuf) -> LayoutResult<()> {
        self.record("evict_values");
        if !self.caps.sparse {
            return Ok(Callback::NotImplemented);
        }
        let map = chunk.data()[..Self::nelem(dset)].to_vec();
        chunk.replace(map);
        Ok(Callback::Done(()))
    }

    fn delete_chunk(
        &self,
        _dset: &Dataset,
        scaled: &[u64],
        _addr: Option<u64>,
        _disk_size: u64,
    ) -> LayoutResult<()> {
        self.record("delete_chunk");
        if !self.caps.delete {
            return Ok(Callback::NotImplemented);
        }
        self.chunks.lock().unwrap().remove(scaled);
        Ok(Callback::Done(()))
    }

    fn chunk_coords(&self, _dset: &Dataset) -> LayoutResult<Vec<Vec<u64>>> {
        self.record("chunk_coords");
        if !self.caps.enumerate {
            return Ok(Callback::NotImplemented);
        }
        let mut coords: Vec<Vec<u64>> = self.chunks.lock().unwrap().keys().cloned().collect();
        coords.sort();
        Ok(Callback::Done(coords))
    }
}

/// Widens little-endian `i32` file elements to `i64` in memory.
pub(crate) struct I32ToI64;

impl TypeConversion for I32ToI64 {
    fn file_to_mem(&self, file: &[u8], mem: &mut [u8]) {
        let value = i32::from_le_bytes(file.try_into().unwrap());
        mem.copy_from_slice(&i64::from(value).to_le_bytes());
    }

    fn mem_to_file(&self, mem: &[u8], file: &mut [u8]) {
        let value = i64::from_le_bytes(mem.try_into().unwrap());
        file.copy_from_slice(&(value as i32).to_le_bytes());
    }
}

/// An 8x8 dataset of `i32` in 4x4 chunks with a zero fill value.
pub(crate) fn dataset(id: u64, layout: &Arc<TestLayout>) -> Arc<Dataset> {
    Arc::new(
        Dataset::new(DatasetId(id), vec![8, 8], vec![4, 4], 4, layout.clone())
            .expect("dataset should be valid"),
    )
}

pub(crate) fn cache(file: &Arc<MemFile>, max_bytes: usize) -> Cache {
    CacheBuilder::new()
        .max_bytes(max_bytes)
        .build(file.clone())
        .expect("build should succeed")
}

pub(crate) fn to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn from_bytes(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes(b.try_into().unwrap()))
        .collect()
}
