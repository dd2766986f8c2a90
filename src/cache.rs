use crate::buffer::ChunkBuf;
use crate::dataset::{Dataset, DatasetId};
use crate::entry::{ChunkEntry, Defined, PinGuard};
use crate::file::FileDriver;
use crate::index::{CacheIndex, ChunkKey};
use crate::layout::{Callback, ChunkLookup, NewChunk, Udata};
use crate::metrics::CacheMetrics;
use crate::space::Selection;
use crate::{CacheError, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Resolved cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Byte budget for decoded chunk buffers. Soft: exceeded only while
    /// every entry is pinned.
    pub max_bytes: usize,
    /// Pick clean victims before dirty ones so eviction rarely has to flush.
    pub prefer_clean_victims: bool,
    /// Allow transfers straight between disk and user memory when the layout
    /// supports them and no type conversion is needed.
    pub direct_io: bool,
}

/// Builder for a [`Cache`]
///
/// # Example
///
/// ```ignore
/// use chunkcache::{CacheBuilder, MemFile};
/// use std::sync::Arc;
///
/// let cache = CacheBuilder::new()
///     .max_bytes(16 * 1024 * 1024)
///     .build(Arc::new(MemFile::new()))?;
/// ```
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    max_bytes: usize,
    prefer_clean_victims: bool,
    direct_io: bool,
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBuilder {
    /// Create a builder with default settings
    ///
    /// Defaults:
    /// - 1MB chunk budget
    /// - clean victims preferred
    /// - direct I/O enabled
    pub fn new() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            prefer_clean_victims: true,
            direct_io: true,
        }
    }

    /// Set the byte budget for cached chunk buffers
    pub fn max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }

    pub fn prefer_clean_victims(mut self, enabled: bool) -> Self {
        self.prefer_clean_victims = enabled;
        self
    }

    pub fn direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    /// Build a cache for `file`
    pub fn build(self, file: Arc<dyn FileDriver>) -> Result<Cache> {
        if self.max_bytes == 0 {
            return Err(CacheError::InvalidRequest(
                "cache budget must be non-zero".to_string(),
            ));
        }
        let config = CacheConfig {
            max_bytes: self.max_bytes,
            prefer_clean_victims: self.prefer_clean_victims,
            direct_io: self.direct_io,
        };
        debug!(?config, "chunk cache created");
        Ok(Cache {
            file,
            config,
            index: Mutex::new(CacheIndex::new()),
            metrics: CacheMetrics::default(),
        })
    }
}

/// Chunk cache shared by every chunked dataset of one open file.
///
/// Structural changes (insert, remove, victim selection) happen under one
/// lock. Element transfers run under a pin on the entry they touch, so
/// requests against different resident chunks proceed concurrently.
pub struct Cache {
    pub(crate) file: Arc<dyn FileDriver>,
    pub(crate) config: CacheConfig,
    index: Mutex<CacheIndex>,
    pub(crate) metrics: CacheMetrics,
}

impl Cache {
    /// Create a cache with the default configuration.
    pub fn create(file: Arc<dyn FileDriver>) -> Result<Self> {
        CacheBuilder::new().build(file)
    }

    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Discard every entry without flushing and release the cache.
    pub fn destroy(self) {
        drop(self);
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of cached chunks.
    pub fn len(&self) -> usize {
        self.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged against the budget.
    pub fn bytes(&self) -> usize {
        self.index().bytes()
    }

    pub fn contains(&self, dataset: DatasetId, scaled: &[u64]) -> bool {
        self.index().contains(&ChunkKey::new(dataset, scaled.to_vec()))
    }

    /// Whether a cached chunk holds unflushed changes; `None` if not cached.
    pub fn is_dirty(&self, dataset: DatasetId, scaled: &[u64]) -> Option<bool> {
        let index = self.index();
        let slot = index.find(&ChunkKey::new(dataset, scaled.to_vec()))?;
        Some(slot.lock().dirty)
    }

    /// The part of `selection` (chunk-local) holding defined values.
    ///
    /// Answers from the cache when the chunk is resident. Otherwise only the
    /// chunk's defined-value list is loaded if the layout can decode it on
    /// its own, and the chunk is cached without its values.
    pub fn defined_values(
        &self,
        dset: &Arc<Dataset>,
        scaled: &[u64],
        selection: &Selection,
    ) -> Result<Selection> {
        let key = ChunkKey::new(dset.id(), scaled.to_vec());
        let pinned = self.index().pin(&key);
        if let Some(pin) = pinned {
            self.metrics.hits.increment();
            return Ok(pin.lock().defined.restrict(selection));
        }
        self.metrics.misses.increment();

        let lookup = self.lookup_one(dset, scaled)?;
        if lookup.addr.is_none() {
            return Ok(Selection::none());
        }
        if lookup.defined_values_size == 0 {
            return Ok(selection.clone());
        }
        let entry = self.materialise_defined(dset, scaled, lookup)?;
        let answer = entry.defined.restrict(selection);
        let mut index = self.index();
        drop(self.install(&mut index, entry)?);
        Ok(answer)
    }

    pub(crate) fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update_gauges(&self, index: &CacheIndex) {
        self.metrics.entries.set(index.len() as i64);
        self.metrics.bytes_cached.set(index.bytes() as i64);
    }

    /// Resolve where each chunk lives, one layout call per batch.
    pub(crate) fn lookup(&self, dset: &Dataset, scaled: &[&[u64]]) -> Result<Vec<ChunkLookup>> {
        if scaled.is_empty() {
            return Ok(Vec::new());
        }
        let found = dset
            .layout()
            .lookup(dset, scaled)
            .map_err(CacheError::layout("lookup"))?;
        if found.len() != scaled.len() {
            return Err(CacheError::InvalidState(format!(
                "lookup answered {} of {} chunks",
                found.len(),
                scaled.len()
            )));
        }
        self.metrics.lookups.add(found.len() as u64);
        Ok(found)
    }

    pub(crate) fn lookup_one(&self, dset: &Dataset, scaled: &[u64]) -> Result<ChunkLookup> {
        self.lookup(dset, &[scaled])?
            .pop()
            .ok_or_else(|| CacheError::InvalidState("lookup returned nothing".to_string()))
    }

    /// Read an on-disk chunk image into a fresh buffer.
    pub(crate) fn read_image(
        &self,
        addr: u64,
        disk_size: u64,
        size_hint: usize,
    ) -> Result<ChunkBuf> {
        let len = usize::try_from(disk_size)
            .map_err(|_| CacheError::InvalidState(format!("chunk size {disk_size} overflows")))?;
        let mut buf = ChunkBuf::with_capacity(len.max(size_hint))?;
        self.file.read_at(addr, &mut buf.data_mut()[..len])?;
        buf.set_nbytes(len);
        Ok(buf)
    }

    pub(crate) fn decode(
        &self,
        dset: &Dataset,
        buf: &mut ChunkBuf,
        udata: Option<&mut Udata>,
    ) -> Result<()> {
        let decoded = dset
            .layout()
            .decode(dset, buf, udata)
            .map_err(CacheError::layout("decode"))?;
        if decoded.is_implemented() {
            buf.check("decode")?;
            self.metrics.decodes.increment();
        }
        Ok(())
    }

    fn defined_of(&self, dset: &Dataset, buf: &ChunkBuf, absent: Defined) -> Result<Defined> {
        let nelem = dset.chunk_nelem();
        let defined = dset
            .layout()
            .defined_values(dset, &Selection::all(nelem), buf)
            .map_err(CacheError::layout("defined_values"))?;
        Ok(match defined {
            Callback::Done(selection) => Defined::from_selection(selection, nelem),
            Callback::NotImplemented => absent,
        })
    }

    /// Build a full entry for a chunk that is not cached.
    ///
    /// Allocated chunks are read and decoded. Unallocated ones come from
    /// `new_chunk`, pre-filled when `fill` is set. Without a
    /// `defined_values` callback every element counts as defined, whether
    /// or not the chunk has been written yet.
    pub(crate) fn materialise(
        &self,
        dset: &Arc<Dataset>,
        scaled: &[u64],
        lookup: ChunkLookup,
        fill: bool,
    ) -> Result<ChunkEntry> {
        let ChunkLookup {
            addr,
            disk_size,
            defined_values_size,
            size_hint,
            mut udata,
            ..
        } = lookup;
        let layout = dset.layout();
        let mut entry = match addr {
            Some(addr) => {
                let mut buf = self.read_image(addr, disk_size, size_hint)?;
                self.decode(dset, &mut buf, udata.as_mut())?;
                let defined = if defined_values_size == 0 {
                    Defined::All
                } else {
                    self.defined_of(dset, &buf, Defined::All)?
                };
                let mut entry = ChunkEntry::new(dset.clone(), scaled.to_vec(), buf);
                entry.addr = Some(addr);
                entry.disk_size = disk_size;
                entry.defined = defined;
                entry
            }
            None => {
                let NewChunk { buf, udata: fresh } = layout
                    .new_chunk(dset, scaled, fill)
                    .map_err(CacheError::layout("new_chunk"))?;
                buf.check("new_chunk")?;
                let defined = self.defined_of(dset, &buf, Defined::All)?;
                udata = udata.or(fresh);
                let mut entry = ChunkEntry::new(dset.clone(), scaled.to_vec(), buf);
                entry.defined = defined;
                entry
            }
        };
        entry.udata = udata;
        trace!(dataset = dset.id().0, ?scaled, allocated = addr.is_some(), "chunk materialised");
        Ok(entry)
    }

    /// Build an entry holding only the defined-value list of an allocated
    /// chunk, or a full one if the layout cannot decode the list alone.
    fn materialise_defined(
        &self,
        dset: &Arc<Dataset>,
        scaled: &[u64],
        mut lookup: ChunkLookup,
    ) -> Result<ChunkEntry> {
        let Some(addr) = lookup.addr else {
            return self.materialise(dset, scaled, lookup, true);
        };
        let mut buf = self.read_image(
            addr,
            lookup.defined_values_size,
            lookup.defined_values_size_hint,
        )?;
        let decoded = dset
            .layout()
            .decode_defined_values(dset, &mut buf)
            .map_err(CacheError::layout("decode_defined_values"))?;
        if !decoded.is_implemented() {
            return self.materialise(dset, scaled, lookup, true);
        }
        buf.check("decode_defined_values")?;
        let defined = self.defined_of(dset, &buf, Defined::All)?;
        let mut entry = ChunkEntry::new(dset.clone(), scaled.to_vec(), buf);
        entry.addr = Some(addr);
        entry.disk_size = lookup.disk_size;
        entry.defined = defined;
        entry.values_resident = false;
        entry.udata = lookup.udata.take();
        trace!(dataset = dset.id().0, ?scaled, "defined values materialised");
        Ok(entry)
    }

    /// Reload the values of an entry that `evict_values` trimmed.
    pub(crate) fn ensure_values(&self, entry: &mut ChunkEntry) -> Result<()> {
        if entry.values_resident {
            return Ok(());
        }
        let dset = entry.dataset.clone();
        let buf = match entry.addr {
            Some(addr) => {
                let mut buf = self.read_image(addr, entry.disk_size, dset.chunk_bytes())?;
                self.decode(&dset, &mut buf, entry.udata.as_mut())?;
                buf
            }
            None => {
                let NewChunk { buf, udata } = dset
                    .layout()
                    .new_chunk(&dset, &entry.scaled, true)
                    .map_err(CacheError::layout("new_chunk"))?;
                buf.check("new_chunk")?;
                if entry.udata.is_none() {
                    entry.udata = udata;
                }
                buf
            }
        };
        entry.buf = buf;
        entry.values_resident = true;
        trace!(dataset = dset.id().0, scaled = ?entry.scaled, "chunk values reloaded");
        Ok(())
    }

    /// Index a freshly materialised entry and return it pinned.
    ///
    /// Room is made before the entry becomes reachable, so a failed
    /// eviction leaves nothing half-constructed behind. If another request
    /// cached the same chunk meanwhile, that entry wins.
    pub(crate) fn install(
        &self,
        index: &mut CacheIndex,
        mut entry: ChunkEntry,
    ) -> Result<PinGuard> {
        let key = ChunkKey::new(entry.dataset.id(), entry.scaled.clone());
        if let Some(pin) = index.pin(&key) {
            self.release(&mut entry)?;
            return Ok(pin);
        }
        let charge = entry.buf.alloc_size();
        if let Err(err) = self.make_room(index, charge) {
            if let Err(release) = self.release(&mut entry) {
                warn!(error = %release, "failed to release chunk after eviction error");
            }
            return Err(err);
        }
        let pin = index.insert_pinned(key, entry, charge)?;
        self.update_gauges(index);
        Ok(pin)
    }

    /// Account for size changes of a pinned entry and restore the budget.
    pub(crate) fn settle(&self, pin: &PinGuard) -> Result<()> {
        let mut index = self.index();
        let charge = pin.lock().buf.alloc_size();
        index.recharge(pin.key(), charge);
        let result = self.make_room(&mut index, 0);
        self.update_gauges(&index);
        result
    }

    pub(crate) fn mark_dirty(&self, entry: &mut ChunkEntry) {
        if !entry.dirty {
            entry.dirty = true;
            self.metrics.dirty_entries.increment();
        }
    }

    pub(crate) fn mark_clean(&self, entry: &mut ChunkEntry) {
        if entry.dirty {
            entry.dirty = false;
            self.metrics.dirty_entries.decrement();
        }
    }

    /// Hand an entry's buffer and udata back to its layout.
    ///
    /// The entry must already be unreachable through the index.
    pub(crate) fn release(&self, entry: &mut ChunkEntry) -> Result<()> {
        self.mark_clean(entry);
        let buf = std::mem::take(&mut entry.buf);
        let udata = entry.udata.take();
        let dset = &entry.dataset;
        dset.layout()
            .evict(dset, buf, udata)
            .map_err(CacheError::layout("evict"))?;
        Ok(())
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let slots = self.index().drain();
        let mut discarded = 0;
        for slot in &slots {
            let mut guard = slot.lock();
            let entry = &mut *guard;
            if entry.dirty {
                discarded += 1;
            }
            if let Err(err) = self.release(entry) {
                warn!(error = %err, scaled = ?entry.scaled, "layout failed to release chunk");
            }
        }
        if discarded > 0 {
            warn!(discarded, "chunk cache destroyed with unflushed chunks");
        }
        self.metrics.entries.set(0);
        self.metrics.bytes_cached.set(0);
        debug!(
            entries = slots.len(),
            hit_ratio = ?self.metrics.hit_ratio(),
            "chunk cache destroyed"
        );
    }
}
