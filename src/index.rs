use crate::dataset::DatasetId;
use crate::entry::{ChunkEntry, ChunkSlot, PinGuard};
use crate::{CacheError, Result};
use ahash::RandomState;
use std::collections::HashMap;
use std::sync::Arc;

/// Logical position of a chunk: its dataset and scaled grid coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub dataset: DatasetId,
    pub scaled: Vec<u64>,
}

impl ChunkKey {
    pub fn new(dataset: DatasetId, scaled: Vec<u64>) -> Self {
        Self { dataset, scaled }
    }
}

struct IndexSlot {
    slot: Arc<ChunkSlot>,
    /// Bytes this entry counts against the budget.
    charged: usize,
    last_used: u64,
}

/// Exact-match index over cached chunks with LRU ordering by access tick.
///
/// Every method expects the caller to hold the cache's structural lock.
pub(crate) struct CacheIndex {
    map: HashMap<ChunkKey, IndexSlot, RandomState>,
    tick: u64,
    bytes: usize,
}

impl CacheIndex {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::with_hasher(RandomState::new()),
            tick: 0,
            bytes: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Total bytes charged by all entries.
    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn contains(&self, key: &ChunkKey) -> bool {
        self.map.contains_key(key)
    }

    pub(crate) fn find(&self, key: &ChunkKey) -> Option<&Arc<ChunkSlot>> {
        self.map.get(key).map(|s| &s.slot)
    }

    /// Pin an entry for an access and mark it most recently used.
    pub(crate) fn pin(&mut self, key: &ChunkKey) -> Option<PinGuard> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.map.get_mut(key)?;
        slot.last_used = tick;
        Some(slot.slot.pin())
    }

    /// Index a new entry, returning it already pinned.
    pub(crate) fn insert_pinned(
        &mut self,
        key: ChunkKey,
        entry: ChunkEntry,
        charged: usize,
    ) -> Result<PinGuard> {
        if self.map.contains_key(&key) {
            return Err(CacheError::InvalidState(format!(
                "chunk {:?} of dataset {:?} is already cached",
                key.scaled, key.dataset
            )));
        }
        self.tick += 1;
        let slot = Arc::new(ChunkSlot::new(key.clone(), entry));
        let pin = slot.pin();
        self.bytes += charged;
        self.map.insert(
            key,
            IndexSlot {
                slot,
                charged,
                last_used: self.tick,
            },
        );
        Ok(pin)
    }

    pub(crate) fn remove(&mut self, key: &ChunkKey) -> Option<Arc<ChunkSlot>> {
        let removed = self.map.remove(key)?;
        self.bytes -= removed.charged;
        Some(removed.slot)
    }

    /// Update the bytes an entry counts against the budget.
    pub(crate) fn recharge(&mut self, key: &ChunkKey, charged: usize) {
        if let Some(slot) = self.map.get_mut(key) {
            self.bytes = self.bytes - slot.charged + charged;
            slot.charged = charged;
        }
    }

    /// Keys of one dataset's entries, in scaled-coordinate order.
    pub(crate) fn keys_for(&self, dataset: DatasetId) -> Vec<ChunkKey> {
        let mut keys: Vec<ChunkKey> = self
            .map
            .keys()
            .filter(|k| k.dataset == dataset)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Datasets with at least one cached chunk.
    pub(crate) fn datasets(&self) -> Vec<DatasetId> {
        let mut ids: Vec<DatasetId> = self.map.keys().map(|k| k.dataset).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<ChunkSlot>> {
        self.bytes = 0;
        self.map.drain().map(|(_, s)| s.slot).collect()
    }

    /// Least recently used unpinned entry, optionally preferring clean ones.
    ///
    /// Entries whose lock is held elsewhere are skipped.
    pub(crate) fn victim(&self, prefer_clean: bool) -> Option<ChunkKey> {
        self.map
            .iter()
            .filter(|(_, s)| s.slot.pin_count() == 0)
            .filter_map(|(key, s)| {
                let dirty = s.slot.try_lock()?.dirty;
                Some(((prefer_clean && dirty, s.last_used), key))
            })
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, key)| key.clone())
    }
}
