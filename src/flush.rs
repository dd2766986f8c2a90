use crate::cache::Cache;
use crate::dataset::{Dataset, DatasetId};
use crate::entry::ChunkEntry;
use crate::index::{CacheIndex, ChunkKey};
use crate::layout::{ChunkInsert, Encoded};
use crate::{CacheError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

impl Cache {
    /// Persist every dirty chunk of every dataset.
    ///
    /// Each dataset's dirty chunks go to its layout in one `insert` call.
    /// Stops at the first failure; chunks not yet persisted stay dirty.
    pub fn flush(&self) -> Result<()> {
        let mut index = self.index();
        for dataset in index.datasets() {
            self.flush_locked(&mut index, dataset, false)?;
        }
        Ok(())
    }

    /// Persist the dirty chunks of one dataset, then optionally evict all of
    /// its chunks regardless of memory pressure.
    ///
    /// Chunks in use by another operation are flushed but stay cached.
    pub fn flush_dset(&self, dset: &Dataset, evict: bool) -> Result<()> {
        let mut index = self.index();
        self.flush_locked(&mut index, dset.id(), evict)
    }

    /// Persist one chunk if it is cached and dirty.
    ///
    /// Returns `false` if the chunk is not cached.
    pub fn flush_chunk(&self, dset: &Dataset, scaled: &[u64]) -> Result<bool> {
        let index = self.index();
        let Some(slot) = index.find(&ChunkKey::new(dset.id(), scaled.to_vec())) else {
            return Ok(false);
        };
        let mut guard = slot.lock();
        let entry = &mut *guard;
        if entry.dirty {
            self.persist(&mut [entry], false)?;
        }
        Ok(true)
    }

    fn flush_locked(&self, index: &mut CacheIndex, dataset: DatasetId, evict: bool) -> Result<()> {
        let slots: Vec<_> = index
            .keys_for(dataset)
            .iter()
            .filter_map(|key| index.find(key).cloned())
            .collect();
        if slots.is_empty() {
            return Ok(());
        }
        let mut guards: Vec<_> = slots.iter().map(|slot| slot.lock()).collect();

        // busy chunks stay cached, so only idle ones may be encoded in place
        let mut idle = Vec::new();
        let mut busy = Vec::new();
        for (slot, guard) in slots.iter().zip(guards.iter_mut()) {
            if !guard.dirty {
                continue;
            }
            if slot.pin_count() == 0 {
                idle.push(&mut **guard);
            } else {
                busy.push(&mut **guard);
            }
        }
        let flushed = idle.len() + busy.len();
        self.persist(&mut busy, false)?;
        self.persist(&mut idle, evict)?;

        let mut evicted = 0;
        let mut failed = None;
        if evict {
            // idle buffers may hold encoded images now, so none may stay
            // reachable even if the layout fails to release one of them
            let idle: Vec<_> = slots
                .iter()
                .zip(guards.iter_mut())
                .filter(|(slot, _)| slot.pin_count() == 0)
                .collect();
            for (slot, _) in &idle {
                index.remove(slot.key());
            }
            self.update_gauges(index);
            for (slot, guard) in idle {
                self.metrics.evictions.increment();
                evicted += 1;
                if let Err(err) = self.release(guard) {
                    warn!(
                        scaled = ?slot.key().scaled,
                        error = %err,
                        "layout failed to release chunk"
                    );
                    failed.get_or_insert(err);
                }
            }
        }
        if flushed > 0 || evicted > 0 {
            debug!(dataset = dataset.0, flushed, evicted, "flushed dataset chunks");
        }
        failed.map_or(Ok(()), Err)
    }

    /// Persist dirty entries of one dataset.
    ///
    /// With `in_place` the layout may encode buffers in place; the caller
    /// must release such entries afterwards. If persisting fails, buffers
    /// encoded in place are decoded again and every entry not yet written
    /// stays dirty.
    pub(crate) fn persist(&self, entries: &mut [&mut ChunkEntry], in_place: bool) -> Result<()> {
        let Some(dset) = entries.first().map(|e| e.dataset.clone()) else {
            return Ok(());
        };
        let mut encoded_in_place = vec![false; entries.len()];
        let result = self.persist_encoded(&dset, entries, in_place, &mut encoded_in_place);
        if let Err(err) = &result {
            self.metrics.flush_failures.increment();
            warn!(dataset = dset.id().0, error = %err, "failed to persist chunks");
            for (entry, restored) in entries.iter_mut().zip(encoded_in_place) {
                if !restored {
                    continue;
                }
                let entry = &mut **entry;
                if let Err(err) = self.decode(&dset, &mut entry.buf, entry.udata.as_mut()) {
                    warn!(
                        scaled = ?entry.scaled,
                        error = %err,
                        "failed to restore chunk encoded in place"
                    );
                }
            }
        }
        result
    }

    fn persist_encoded(
        &self,
        dset: &Arc<Dataset>,
        entries: &mut [&mut ChunkEntry],
        in_place: bool,
        encoded_in_place: &mut [bool],
    ) -> Result<()> {
        let layout = dset.layout();
        let mut images: Vec<Option<Vec<u8>>> = Vec::with_capacity(entries.len());
        for (entry, flag) in entries.iter_mut().zip(encoded_in_place.iter_mut()) {
            let buf = &mut entry.buf;
            if layout
                .condense(dset, buf)
                .map_err(CacheError::layout("condense"))?
                .is_implemented()
            {
                buf.check("condense")?;
            }
            if in_place
                && layout
                    .encode_in_place(dset, buf)
                    .map_err(CacheError::layout("encode_in_place"))?
                    .is_implemented()
            {
                *flag = true;
                buf.check("encode_in_place")?;
                self.metrics.encodes.increment();
                images.push(None);
                continue;
            }
            let image = match layout.encode(dset, buf).map_err(CacheError::layout("encode"))? {
                Encoded::Unchanged => None,
                Encoded::Buffer(image) => Some(image),
            };
            self.metrics.encodes.increment();
            images.push(image);
        }

        let placed: Vec<(Option<u64>, u64)> = {
            let mut chunks: Vec<ChunkInsert<'_>> = entries
                .iter()
                .zip(&images)
                .map(|(entry, image)| {
                    let data = image.as_deref().unwrap_or_else(|| entry.buf.used());
                    ChunkInsert {
                        scaled: &entry.scaled,
                        addr: entry.addr,
                        old_disk_size: entry.disk_size,
                        new_disk_size: data.len() as u64,
                        data,
                    }
                })
                .collect();
            layout
                .insert(dset, &mut chunks)
                .map_err(CacheError::layout("insert"))?;
            chunks.iter().map(|c| (c.addr, c.new_disk_size)).collect()
        };
        self.metrics.inserts.add(placed.len() as u64);

        for ((entry, image), (addr, disk_size)) in entries.iter_mut().zip(&images).zip(placed) {
            let addr = addr.ok_or_else(|| {
                CacheError::InvalidState("insert left a chunk without an address".to_string())
            })?;
            entry.addr = Some(addr);
            entry.disk_size = disk_size;
            let data = image.as_deref().unwrap_or_else(|| entry.buf.used());
            self.file.write_at(addr, data)?;
            self.mark_clean(entry);
            self.metrics.flushes.increment();
        }
        Ok(())
    }

    /// Evict until `incoming` more bytes fit in the budget.
    ///
    /// Victims are the least recently used unpinned entries. A clean victim
    /// whose layout can drop values alone loses only its values the first
    /// time it is picked. Dirty victims are persisted first; a failure
    /// leaves the victim dirty and cached and is returned. If every entry
    /// is pinned the budget is exceeded until pins are released.
    pub(crate) fn make_room(&self, index: &mut CacheIndex, incoming: usize) -> Result<()> {
        while index.bytes() + incoming > self.config.max_bytes {
            let Some(key) = index.victim(self.config.prefer_clean_victims) else {
                if index.len() > 0 {
                    warn!(
                        bytes = index.bytes(),
                        incoming,
                        max_bytes = self.config.max_bytes,
                        "every cached chunk is pinned, exceeding budget"
                    );
                }
                break;
            };
            let Some(slot) = index.find(&key).cloned() else {
                break;
            };
            let Some(mut guard) = slot.try_lock() else {
                break;
            };
            let entry = &mut *guard;

            if !entry.dirty && entry.values_resident {
                let dset = entry.dataset.clone();
                if dset
                    .layout()
                    .evict_values(&dset, &mut entry.buf)
                    .map_err(CacheError::layout("evict_values"))?
                    .is_implemented()
                {
                    entry.buf.check("evict_values")?;
                    entry.values_resident = false;
                    index.recharge(&key, entry.buf.alloc_size());
                    self.metrics.evict_values.increment();
                    debug!(dataset = key.dataset.0, scaled = ?key.scaled, "evicted chunk values");
                    continue;
                }
            }

            if entry.dirty {
                self.persist(&mut [&mut *entry], true)?;
            }
            index.remove(&key);
            self.release(entry)?;
            self.metrics.evictions.increment();
            debug!(dataset = key.dataset.0, scaled = ?key.scaled, "evicted chunk");
        }
        self.update_gauges(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemFile;
    use crate::space::Hyperslab;
    use crate::test_layout::{TestLayout, cache, dataset, from_bytes, to_bytes};
    use crate::{IoTypeInfo, ReadRequest, WriteRequest};

    fn write_chunk(cache: &Cache, dset: &Arc<Dataset>, start: [u64; 2], value: i32) -> Result<()> {
        cache.write(
            &[WriteRequest {
                dataset: dset,
                selection: Hyperslab::new(start.to_vec(), vec![4, 4]),
                buf: &to_bytes(&[value; 16]),
            }],
            &IoTypeInfo::native(4),
        )
    }

    fn read_chunk(cache: &Cache, dset: &Arc<Dataset>, start: [u64; 2]) -> Vec<i32> {
        let mut buf = vec![0u8; 64];
        cache
            .read(
                &mut [ReadRequest {
                    dataset: dset,
                    selection: Hyperslab::new(start.to_vec(), vec![4, 4]),
                    buf: &mut buf,
                }],
                &IoTypeInfo::native(4),
            )
            .expect("read should succeed");
        from_bytes(&buf)
    }

    fn pin(cache: &Cache, dset: &Dataset, scaled: [u64; 2]) -> crate::entry::PinGuard {
        cache
            .index()
            .pin(&ChunkKey::new(dset.id(), scaled.to_vec()))
            .expect("chunk should be cached")
    }

    // ==== flush ====

    #[test]
    fn test_flush_round_trip_through_new_cache() {
        let file = Arc::new(MemFile::new());
        let layout = TestLayout::compressed();
        let dset = dataset(1, &layout);
        {
            let cache = cache(&file, 4096);
            write_chunk(&cache, &dset, [0, 0], 7).expect("write should succeed");
            cache.flush().expect("flush should succeed");
            assert_eq!(cache.is_dirty(dset.id(), &[0, 0]), Some(false));
            assert_eq!(cache.metrics().dirty_entries.value(), 0);
        }
        assert!(layout.on_disk(&[0, 0]).is_some());

        let cache = cache(&file, 4096);
        assert_eq!(read_chunk(&cache, &dset, [0, 0]), vec![7; 16]);
        assert_eq!(layout.calls("decode"), 1);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let file = Arc::new(MemFile::new());
        let layout = TestLayout::plain();
        let dset = dataset(1, &layout);
        let cache = cache(&file, 4096);
        write_chunk(&cache, &dset, [0, 0], 1).unwrap();
        write_chunk(&cache, &dset, [4, 4], 2).unwrap();

        cache.flush().expect("flush should succeed");
        assert_eq!(layout.calls("encode"), 2);
        // one batch per dataset
        assert_eq!(layout.calls("insert"), 1);
        assert_eq!(cache.metrics().inserts.value(), 2);

        cache.flush().expect("flush should succeed");
        assert_eq!(layout.calls("encode"), 2);
        assert_eq!(layout.calls("insert"), 1);
        assert_eq!(cache.metrics().flushes.value(), 2);
    }

    #[test]
    fn test_flush_single_chunk() {
        let file = Arc::new(MemFile::new());
        let layout = TestLayout::plain();
        let dset = dataset(1, &layout);
        let cache = cache(&file, 4096);
        write_chunk(&cache, &dset, [0, 0], 1).unwrap();
        write_chunk(&cache, &dset, [0, 4], 2).unwrap();

        assert!(cache.flush_chunk(&dset, &[0, 1]).expect("flush should succeed"));
        assert_eq!(cache.is_dirty(dset.id(), &[0, 1]), Some(false));
        assert_eq!(cache.is_dirty(dset.id(), &[0, 0]), Some(true));
        assert!(layout.on_disk(&[0, 0]).is_none());
        assert!(!cache.flush_chunk(&dset, &[1, 1]).expect("flush should succeed"));
    }

    #[test]
    fn test_flush_dset_leaves_other_datasets_dirty() {
        let file = Arc::new(MemFile::new());
        let first = dataset(1, &TestLayout::plain());
        let second = dataset(2, &TestLayout::plain());
        let cache = cache(&file, 4096);
        write_chunk(&cache, &first, [0, 0], 1).unwrap();
        write_chunk(&cache, &second, [0, 0], 2).unwrap();

        cache.flush_dset(&first, false).expect("flush should succeed");
        assert_eq!(cache.is_dirty(first.id(), &[0, 0]), Some(false));
        assert_eq!(cache.is_dirty(second.id(), &[0, 0]), Some(true));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_flush_dset_evict_keeps_pinned_chunks() {
        let file = Arc::new(MemFile::new());
        let layout = TestLayout::compressed();
        let dset = dataset(1, &layout);
        let cache = cache(&file, 4096);
        write_chunk(&cache, &dset, [0, 0], 3).unwrap();
        write_chunk(&cache, &dset, [0, 4], 4).unwrap();

        let held = pin(&cache, &dset, [0, 0]);
        cache.flush_dset(&dset, true).expect("flush should succeed");
        // the pinned chunk stays usable, so only the idle one is encoded in place
        assert_eq!(layout.calls("encode"), 1);
        assert_eq!(layout.calls("encode_in_place"), 1);
        assert!(cache.contains(dset.id(), &[0, 0]));
        assert!(!cache.contains(dset.id(), &[0, 1]));
        assert_eq!(cache.is_dirty(dset.id(), &[0, 0]), Some(false));
        drop(held);

        cache.flush_dset(&dset, true).expect("flush should succeed");
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().evictions.value(), 2);
        assert_eq!(read_chunk(&cache, &dset, [0, 4]), vec![4; 16]);
    }

    #[test]
    fn test_failed_in_place_flush_restores_chunk() {
        let file = Arc::new(MemFile::new());
        let layout = TestLayout::compressed();
        let dset = dataset(1, &layout);
        let cache = cache(&file, 100);
        write_chunk(&cache, &dset, [0, 0], 7).unwrap();

        layout.fail_inserts(true);
        let err = write_chunk(&cache, &dset, [0, 4], 8).unwrap_err();
        assert!(matches!(err, CacheError::Layout { op: "insert", .. }));
        assert_eq!(layout.calls("encode_in_place"), 1);
        assert_eq!(layout.calls("decode"), 1);
        assert_eq!(cache.metrics().flush_failures.value(), 1);
        assert_eq!(cache.is_dirty(dset.id(), &[0, 0]), Some(true));
        assert!(!cache.contains(dset.id(), &[0, 1]));

        layout.fail_inserts(false);
        assert_eq!(read_chunk(&cache, &dset, [0, 0]), vec![7; 16]);
        cache.flush().expect("flush should succeed");
        assert!(layout.on_disk(&[0, 0]).is_some());
    }

    #[test]
    fn test_failed_release_still_evicts_every_idle_chunk() {
        let file = Arc::new(MemFile::new());
        let layout = TestLayout::compressed();
        let dset = dataset(1, &layout);
        let cache = cache(&file, 4096);
        write_chunk(&cache, &dset, [0, 0], 3).unwrap();
        write_chunk(&cache, &dset, [0, 4], 4).unwrap();

        layout.fail_evicts(true);
        let err = cache.flush_dset(&dset, true).unwrap_err();
        assert!(matches!(err, CacheError::Layout { op: "evict", .. }));
        assert!(cache.is_empty());
        assert_eq!(layout.calls("evict"), 2);
        assert_eq!(cache.metrics().entries.value(), 0);
        assert_eq!(cache.metrics().dirty_entries.value(), 0);

        layout.fail_evicts(false);
        assert_eq!(read_chunk(&cache, &dset, [0, 4]), vec![4; 16]);
        assert_eq!(read_chunk(&cache, &dset, [0, 0]), vec![3; 16]);
    }

    // ==== eviction ====

    #[test]
    fn test_pinned_chunk_never_evicted() {
        let file = Arc::new(MemFile::new());
        let layout = TestLayout::plain();
        let dset = dataset(1, &layout);
        let cache = cache(&file, 150);
        write_chunk(&cache, &dset, [0, 0], 1).unwrap();
        let _held = pin(&cache, &dset, [0, 0]);

        write_chunk(&cache, &dset, [0, 4], 2).unwrap();
        write_chunk(&cache, &dset, [4, 0], 3).unwrap();
        assert!(cache.contains(dset.id(), &[0, 0]));
        assert!(!cache.contains(dset.id(), &[0, 1]));
        assert!(cache.contains(dset.id(), &[1, 0]));
        assert_eq!(cache.metrics().evictions.value(), 1);
        // the dirty victim was written out before it left
        assert!(layout.on_disk(&[0, 1]).is_some());
        assert_eq!(read_chunk(&cache, &dset, [0, 4]), vec![2; 16]);
    }

    #[test]
    fn test_budget_exceeded_while_everything_pinned() {
        let file = Arc::new(MemFile::new());
        let dset = dataset(1, &TestLayout::plain());
        let cache = cache(&file, 100);
        write_chunk(&cache, &dset, [0, 0], 1).unwrap();
        let held = pin(&cache, &dset, [0, 0]);

        write_chunk(&cache, &dset, [0, 4], 2).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.bytes(), 128);

        drop(held);
        assert_eq!(read_chunk(&cache, &dset, [0, 4]), vec![2; 16]);
        assert_eq!(cache.len(), 1);
        assert!(cache.bytes() <= 100);
        assert!(!cache.contains(dset.id(), &[0, 0]));
    }

    #[test]
    fn test_clean_victims_preferred() {
        for prefer_clean in [true, false] {
            let file = Arc::new(MemFile::new());
            let layout = TestLayout::plain();
            let dset = dataset(1, &layout);
            let cache = Cache::builder()
                .max_bytes(150)
                .prefer_clean_victims(prefer_clean)
                .build(file.clone())
                .expect("build should succeed");

            write_chunk(&cache, &dset, [0, 0], 1).unwrap();
            cache.flush().unwrap();
            write_chunk(&cache, &dset, [0, 4], 2).unwrap();
            // the clean chunk becomes the most recently used
            read_chunk(&cache, &dset, [0, 0]);

            write_chunk(&cache, &dset, [4, 0], 3).unwrap();
            assert_eq!(cache.contains(dset.id(), &[0, 0]), !prefer_clean);
            assert_eq!(cache.contains(dset.id(), &[0, 1]), prefer_clean);
            assert_eq!(layout.on_disk(&[0, 1]).is_some(), !prefer_clean);
        }
    }

    #[test]
    fn test_clean_sparse_chunk_drops_values_first() {
        let file = Arc::new(MemFile::new());
        let layout = TestLayout::sparse();
        let dset = dataset(1, &layout);
        // decoded sparse chunks take 80 bytes, their defined map 16
        let cache = cache(&file, 180);
        write_chunk(&cache, &dset, [0, 0], 1).unwrap();
        write_chunk(&cache, &dset, [0, 4], 2).unwrap();
        cache.flush().unwrap();

        write_chunk(&cache, &dset, [4, 0], 3).unwrap();
        assert_eq!(cache.metrics().evict_values.value(), 1);
        assert_eq!(cache.metrics().evictions.value(), 0);
        assert!(cache.contains(dset.id(), &[0, 0]));
        assert_eq!(cache.bytes(), 176);

        // reloading the values pushes the next clean chunk down a stage
        assert_eq!(read_chunk(&cache, &dset, [0, 0]), vec![1; 16]);
        assert_eq!(cache.metrics().evict_values.value(), 2);
        assert_eq!(cache.len(), 3);
    }
}
