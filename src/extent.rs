use crate::cache::Cache;
use crate::convert::fill_chunk;
use crate::dataset::Dataset;
use crate::index::{CacheIndex, ChunkKey};
use crate::layout::Callback;
use crate::space::{Placement, outside_extent, placement};
use crate::{CacheError, Result};
use std::sync::Arc;
use tracing::debug;

impl Cache {
    /// Reconcile chunks with a dataset extent that changed from `old_dims`.
    ///
    /// Chunks now entirely outside the extent are dropped from the cache
    /// and deleted on disk without being flushed. Chunks straddling the new
    /// boundary have the out-of-range elements erased and are marked dirty,
    /// or deleted if nothing defined remains. Placement is decided from
    /// chunk coordinates alone.
    ///
    /// Chunks on disk but not cached are reconciled only if the layout can
    /// enumerate its chunks.
    pub fn set_extent_notify(&self, dset: &Arc<Dataset>, old_dims: &[u64]) -> Result<()> {
        let dims = dset.dims();
        if old_dims.len() != dims.len() {
            return Err(CacheError::InvalidRequest(format!(
                "old extent has rank {}, dataset rank is {}",
                old_dims.len(),
                dims.len()
            )));
        }
        if dims.iter().zip(old_dims).all(|(new, old)| new >= old) {
            return Ok(());
        }

        let chunk_dims = dset.chunk_dims();
        let mut index = self.index();
        let mut deleted = 0;
        let mut erased = 0;

        for key in index.keys_for(dset.id()) {
            match placement(&key.scaled, chunk_dims, &dims) {
                Placement::Inside => {}
                Placement::Outside => {
                    self.drop_outside(&mut index, dset, &key)?;
                    deleted += 1;
                }
                Placement::Straddling => {
                    erased += 1;
                    if self.erase_outside(&mut index, dset, &key, &dims)? {
                        deleted += 1;
                    }
                }
            }
        }

        let coords = dset
            .layout()
            .chunk_coords(dset)
            .map_err(CacheError::layout("chunk_coords"))?;
        if let Callback::Done(coords) = coords {
            let mut outside = Vec::new();
            let mut straddling = Vec::new();
            for scaled in coords {
                if index.contains(&ChunkKey::new(dset.id(), scaled.clone())) {
                    continue;
                }
                match placement(&scaled, chunk_dims, &dims) {
                    Placement::Inside => {}
                    Placement::Outside => outside.push(scaled),
                    Placement::Straddling => straddling.push(scaled),
                }
            }

            let scaled: Vec<&[u64]> = outside.iter().map(Vec::as_slice).collect();
            for (scaled, lookup) in outside.iter().zip(self.lookup(dset, &scaled)?) {
                if lookup.addr.is_some() {
                    self.delete_on_disk(dset, scaled, lookup.addr, lookup.disk_size)?;
                    deleted += 1;
                }
            }

            let scaled: Vec<&[u64]> = straddling.iter().map(Vec::as_slice).collect();
            for (scaled, lookup) in straddling.iter().zip(self.lookup(dset, &scaled)?) {
                if lookup.addr.is_none() {
                    continue;
                }
                let entry = self.materialise(dset, scaled, lookup, true)?;
                drop(self.install(&mut index, entry)?);
                erased += 1;
                let key = ChunkKey::new(dset.id(), scaled.clone());
                if self.erase_outside(&mut index, dset, &key, &dims)? {
                    deleted += 1;
                }
            }
        }

        self.make_room(&mut index, 0)?;
        debug!(dataset = dset.id().0, ?old_dims, ?dims, deleted, erased, "extent reconciled");
        Ok(())
    }

    fn drop_outside(&self, index: &mut CacheIndex, dset: &Dataset, key: &ChunkKey) -> Result<()> {
        let Some(slot) = index.find(key).cloned() else {
            return Ok(());
        };
        if slot.pin_count() > 0 {
            return Err(CacheError::InvalidState(format!(
                "chunk {:?} is in use while the extent changes",
                key.scaled
            )));
        }
        let mut guard = slot.lock();
        let entry = &mut *guard;
        if entry.addr.is_some() {
            self.delete_on_disk(dset, &entry.scaled, entry.addr, entry.disk_size)?;
        }
        index.remove(key);
        self.release(entry)?;
        Ok(())
    }

    /// Erase the out-of-range part of a straddling chunk. Returns `true` if
    /// the chunk was deleted because nothing defined remained.
    fn erase_outside(
        &self,
        index: &mut CacheIndex,
        dset: &Dataset,
        key: &ChunkKey,
        dims: &[u64],
    ) -> Result<bool> {
        let Some(slot) = index.find(key).cloned() else {
            return Ok(false);
        };
        if slot.pin_count() > 0 {
            return Err(CacheError::InvalidState(format!(
                "chunk {:?} is in use while the extent changes",
                key.scaled
            )));
        }
        let mut guard = slot.lock();
        let entry = &mut *guard;
        self.ensure_values(entry)?;

        let layout = dset.layout();
        let region = outside_extent(&entry.scaled, dset.chunk_dims(), dims);
        self.metrics.erases.increment();
        let delete = match layout
            .erase_values(dset, &region, &mut entry.buf)
            .map_err(CacheError::layout("erase_values"))?
        {
            Callback::Done(delete) => {
                entry.buf.check("erase_values")?;
                delete
            }
            Callback::NotImplemented => {
                let filled = layout
                    .fill(dset, &region, &mut entry.buf)
                    .map_err(CacheError::layout("fill"))?;
                if !filled.is_implemented() {
                    fill_chunk(entry.buf.data_mut(), dset.fill_value(), region.iter())?;
                }
                false
            }
        };
        entry.defined.remove(&region, dset.chunk_nelem());

        if delete || entry.defined.is_empty() {
            if entry.addr.is_some() {
                self.delete_on_disk(dset, &entry.scaled, entry.addr, entry.disk_size)?;
            }
            index.remove(key);
            self.release(entry)?;
            return Ok(true);
        }
        self.mark_dirty(entry);
        index.recharge(key, entry.buf.alloc_size());
        Ok(false)
    }

    fn delete_on_disk(
        &self,
        dset: &Dataset,
        scaled: &[u64],
        addr: Option<u64>,
        disk_size: u64,
    ) -> Result<()> {
        match dset
            .layout()
            .delete_chunk(dset, scaled, addr, disk_size)
            .map_err(CacheError::layout("delete_chunk"))?
        {
            Callback::Done(()) => {
                self.metrics.deletes.increment();
                Ok(())
            }
            Callback::NotImplemented => Err(CacheError::NotSupported { op: "delete_chunk" }),
        }
    }
}
