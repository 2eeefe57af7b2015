use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::listing::ListSnapshot;

/// Cached record portion of the full listing.
///
/// Freshness is tracked with a generation counter instead of a dirty flag.
/// Every mutation bumps the generation while holding the store's exclusive
/// lock. A listing build records the generation *before* it reads any
/// records, so a snapshot is only ever served while no mutation has happened
/// since its build started. Installing never replaces a newer snapshot with
/// an older one.
#[derive(Debug, Default)]
pub struct ListCache {
    generation: AtomicU64,
    slot: RwLock<Option<Arc<ListSnapshot>>>,
}

impl ListCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current mutation generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Record that the store changed. Called after the mutation is applied
    /// and before the exclusive lock is released.
    pub fn mark_dirty(&self) {
        let gen = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(generation = gen, "list cache invalidated");
    }

    /// `true` when there is no snapshot matching the current generation.
    pub fn is_dirty(&self) -> bool {
        self.current().is_none()
    }

    /// The cached snapshot, if it reflects every mutation so far.
    pub fn current(&self) -> Option<Arc<ListSnapshot>> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref()
            .filter(|snap| snap.generation() == self.generation())
            .cloned()
    }

    /// Offer a freshly built snapshot. Ignored if a snapshot from a later
    /// generation is already installed. Returns whether it was installed.
    pub fn install(&self, snapshot: Arc<ListSnapshot>) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            if existing.generation() > snapshot.generation() {
                return false;
            }
        }
        trace!(
            generation = snapshot.generation(),
            bytes = snapshot.byte_len(),
            "list cache installed"
        );
        *slot = Some(snapshot);
        true
    }
}
