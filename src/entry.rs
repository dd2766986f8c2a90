use crate::buffer::ChunkBuf;
use crate::dataset::Dataset;
use crate::index::ChunkKey;
use crate::layout::Udata;
use crate::space::Selection;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Which elements of a chunk hold meaningful data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Defined {
    All,
    Some(Selection),
}

impl Defined {
    /// Normalise a selection covering a chunk of `nelem` elements.
    pub(crate) fn from_selection(selection: Selection, nelem: u64) -> Self {
        if selection.is_all(nelem) {
            Defined::All
        } else {
            Defined::Some(selection)
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        match self {
            Defined::All => true,
            Defined::Some(selection) => selection.contains(index),
        }
    }

    /// The part of `selection` that is defined.
    pub fn restrict(&self, selection: &Selection) -> Selection {
        match self {
            Defined::All => selection.clone(),
            Defined::Some(defined) => defined.intersect(selection),
        }
    }

    pub(crate) fn extend(&mut self, selection: &Selection, nelem: u64) {
        if let Defined::Some(defined) = self {
            *self = Defined::from_selection(defined.union(selection), nelem);
        }
    }

    pub(crate) fn remove(&mut self, selection: &Selection, nelem: u64) {
        let remaining = match self {
            Defined::All => Selection::all(nelem).difference(selection),
            Defined::Some(defined) => defined.difference(selection),
        };
        *self = Defined::from_selection(remaining, nelem);
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Defined::Some(selection) if selection.is_empty())
    }
}

/// One cached chunk.
pub(crate) struct ChunkEntry {
    pub(crate) dataset: Arc<Dataset>,
    pub(crate) scaled: Vec<u64>,
    pub(crate) buf: ChunkBuf,
    pub(crate) addr: Option<u64>,
    pub(crate) disk_size: u64,
    pub(crate) defined: Defined,
    pub(crate) dirty: bool,
    /// False once `evict_values` dropped the values; only the defined-value
    /// list is left in `buf`.
    pub(crate) values_resident: bool,
    pub(crate) udata: Option<Udata>,
}

impl ChunkEntry {
    pub(crate) fn new(dataset: Arc<Dataset>, scaled: Vec<u64>, buf: ChunkBuf) -> Self {
        Self {
            dataset,
            scaled,
            buf,
            addr: None,
            disk_size: 0,
            defined: Defined::All,
            dirty: false,
            values_resident: true,
            udata: None,
        }
    }
}

/// An indexed chunk: its entry plus the pin count gating eviction.
pub(crate) struct ChunkSlot {
    key: ChunkKey,
    pins: AtomicU32,
    entry: Mutex<ChunkEntry>,
}

impl ChunkSlot {
    pub(crate) fn new(key: ChunkKey, entry: ChunkEntry) -> Self {
        Self {
            key,
            pins: AtomicU32::new(0),
            entry: Mutex::new(entry),
        }
    }

    pub(crate) fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub(crate) fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChunkEntry> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, ChunkEntry>> {
        match self.entry.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(err)) => Some(err.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// Pin the slot. Only the index hands out pins, while its lock is held,
    /// so victim selection never races with a new pin.
    pub(crate) fn pin(self: &Arc<Self>) -> PinGuard {
        self.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard { slot: self.clone() }
    }
}

/// Keeps a slot pinned for the duration of one operation.
pub(crate) struct PinGuard {
    slot: Arc<ChunkSlot>,
}

impl Deref for PinGuard {
    type Target = ChunkSlot;

    fn deref(&self) -> &ChunkSlot {
        &self.slot
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.slot.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
