use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

/// A fetched (and possibly transcoded) artifact ready to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Ready(CacheEntry),
    Failed(String),
}

#[derive(Debug)]
enum Slot {
    Pending {
        generation: u64,
        done: watch::Receiver<bool>,
    },
    Ready(CacheEntry),
    Failed(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheCounts {
    pub pending: usize,
    pub ready: usize,
    pub failed: usize,
}

/// In-memory map from file id to its cache slot.
///
/// Writes for a given id go through [`CacheStore::claim`]: the caller that gets a
/// [`PendingGuard`] is the only one allowed to settle that id until the guard
/// completes, fails or is dropped.
#[derive(Debug, Default)]
pub struct CacheStore {
    slots: DashMap<String, Slot>,
    next_generation: AtomicU64,
}

pub enum Claim {
    Ready(CacheEntry),
    InFlight(InFlight),
    Claimed(PendingGuard),
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<EntryState> {
        self.slots.get(id).map(|slot| match &*slot {
            Slot::Pending { .. } => EntryState::Pending,
            Slot::Ready(entry) => EntryState::Ready(entry.clone()),
            Slot::Failed(reason) => EntryState::Failed(reason.clone()),
        })
    }

    pub fn get_ready(&self, id: &str) -> Option<CacheEntry> {
        match self.get(id) {
            Some(EntryState::Ready(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Stores a ready entry, superseding whatever the id held before.
    pub fn put(&self, id: &str, entry: CacheEntry) {
        self.slots.insert(id.to_string(), Slot::Ready(entry));
    }

    pub fn remove(&self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    pub fn ids(&self) -> HashSet<String> {
        self.slots.iter().map(|slot| slot.key().clone()).collect()
    }

    /// Ids that are ready or being worked on; failed ids are left out so they get
    /// picked up again.
    pub fn cached_ids(&self) -> HashSet<String> {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot.value(), Slot::Failed(_)))
            .map(|slot| slot.key().clone())
            .collect()
    }

    pub fn counts(&self) -> CacheCounts {
        let mut counts = CacheCounts::default();
        for slot in self.slots.iter() {
            match slot.value() {
                Slot::Pending { .. } => counts.pending += 1,
                Slot::Ready(_) => counts.ready += 1,
                Slot::Failed(_) => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drops every slot whose id is not in `keep`, returning the dropped ids sorted.
    pub fn evict_absent(&self, keep: &HashSet<String>) -> Vec<String> {
        let mut evicted = Vec::new();
        self.slots.retain(|id, _| {
            let kept = keep.contains(id);
            if !kept {
                evicted.push(id.clone());
            }
            kept
        });
        evicted.sort();
        evicted
    }

    /// Single-flight entry point: returns the ready entry, a handle to wait on
    /// the task already working on `id`, or ownership of a fresh pending slot.
    /// Failed slots are claimable again.
    pub fn claim(self: &Arc<Self>, id: &str) -> Claim {
        match self.slots.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Ready(entry) => Claim::Ready(entry.clone()),
                Slot::Pending { done, .. } => Claim::InFlight(InFlight { done: done.clone() }),
                Slot::Failed(_) => {
                    let (guard, slot) = self.pending_slot(id);
                    occupied.insert(slot);
                    Claim::Claimed(guard)
                }
            },
            Entry::Vacant(vacant) => {
                let (guard, slot) = self.pending_slot(id);
                vacant.insert(slot);
                Claim::Claimed(guard)
            }
        }
    }

    fn pending_slot(self: &Arc<Self>, id: &str) -> (PendingGuard, Slot) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(false);
        let guard = PendingGuard {
            store: Arc::clone(self),
            id: id.to_string(),
            generation,
            done: tx,
            settled: false,
        };
        (
            guard,
            Slot::Pending {
                generation,
                done: rx,
            },
        )
    }

    /// Replaces the slot only if it is still the pending slot of `generation`.
    fn settle(&self, id: &str, generation: u64, slot: Slot) -> bool {
        let Some(mut current) = self.slots.get_mut(id) else {
            return false;
        };
        let owned = matches!(
            &*current,
            Slot::Pending { generation: g, .. } if *g == generation
        );
        if owned {
            *current = slot;
        }
        owned
    }
}

/// Handle on a fetch that another task owns.
pub struct InFlight {
    done: watch::Receiver<bool>,
}

impl InFlight {
    pub async fn wait(mut self) {
        // A dropped sender also means the owner is gone.
        let _ = self.done.wait_for(|done| *done).await;
    }
}

/// Exclusive right to settle one pending slot. Dropping it unsettled marks the
/// slot failed.
pub struct PendingGuard {
    store: Arc<CacheStore>,
    id: String,
    generation: u64,
    done: watch::Sender<bool>,
    settled: bool,
}

impl PendingGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publishes the entry. Returns `false` when the id was evicted or superseded
    /// while the work was running, in which case nothing is stored.
    pub fn complete(mut self, entry: CacheEntry) -> bool {
        let stored = self
            .store
            .settle(&self.id, self.generation, Slot::Ready(entry));
        self.finish();
        stored
    }

    pub fn fail(mut self, reason: impl Into<String>) {
        self.store
            .settle(&self.id, self.generation, Slot::Failed(reason.into()));
        self.finish();
    }

    fn finish(&mut self) {
        self.settled = true;
        self.done.send_replace(true);
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.store.settle(
                &self.id,
                self.generation,
                Slot::Failed("task abandoned before completion".to_string()),
            );
            self.finish();
        }
    }
}
