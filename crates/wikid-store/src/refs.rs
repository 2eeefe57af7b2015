//! Attachment reference counting.
//!
//! Each [`AttachmentId`] maps to the number of tiddlers that reference it.
//! The count drops by one when a referencing tiddler is deleted (or rebound
//! to another attachment); when it reaches zero the entry is removed and the
//! caller is told the backing file may go. A later reference to the same id
//! starts again from 1.

use std::collections::HashMap;

use tracing::{debug, warn};
use wikid_types::AttachmentId;

use crate::error::{StoreError, StoreResult};
use crate::kv::OrderedKv;

/// Result of dropping one reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefRelease {
    /// Other tiddlers still reference the attachment.
    Remaining(u64),
    /// That was the last reference; the entry is gone.
    Released,
    /// The id was not registered. Nothing changed.
    Unknown,
}

/// Counter operations shared by the in-memory and persistent registries.
///
/// Callers hold the owning store's exclusive lock, so counter updates are
/// atomic with the record mutation that triggers them.
pub trait RefCounter {
    /// Add one reference and return the new count.
    fn increment(&mut self, id: &AttachmentId) -> StoreResult<u64>;

    /// Drop one reference.
    fn decrement(&mut self, id: &AttachmentId) -> StoreResult<RefRelease>;

    /// Current count; 0 when unregistered.
    fn count(&self, id: &AttachmentId) -> StoreResult<u64>;
}

/// Registry held inside the memory backend's locked state.
#[derive(Clone, Debug, Default)]
pub struct AttachmentRefs {
    counts: HashMap<AttachmentId, u64>,
}

impl AttachmentRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered attachments.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl RefCounter for AttachmentRefs {
    fn increment(&mut self, id: &AttachmentId) -> StoreResult<u64> {
        let count = self.counts.entry(id.clone()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    fn decrement(&mut self, id: &AttachmentId) -> StoreResult<RefRelease> {
        let Some(count) = self.counts.get_mut(id) else {
            return Ok(RefRelease::Unknown);
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.counts.remove(id);
            Ok(RefRelease::Released)
        } else {
            Ok(RefRelease::Remaining(*count))
        }
    }

    fn count(&self, id: &AttachmentId) -> StoreResult<u64> {
        Ok(self.counts.get(id).copied().unwrap_or(0))
    }
}

/// Registry persisted in its own keyspace of an [`OrderedKv`] engine.
///
/// Values are 8-byte little-endian counts. Counts survive restarts.
#[derive(Debug)]
pub struct KvAttachmentRefs<K> {
    kv: K,
}

impl<K: OrderedKv> KvAttachmentRefs<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// The underlying keyspace.
    pub fn kv(&self) -> &K {
        &self.kv
    }

    fn read(&self, id: &AttachmentId) -> StoreResult<Option<u64>> {
        let Some(bytes) = self.kv.get(id.as_str().as_bytes())? else {
            return Ok(None);
        };
        let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| StoreError::Corrupt {
            key: id.to_string(),
            reason: format!("expected 8-byte count, found {} bytes", bytes.len()),
        })?;
        Ok(Some(u64::from_le_bytes(arr)))
    }

    fn write(&self, id: &AttachmentId, count: u64) -> StoreResult<()> {
        self.kv.put(id.as_str().as_bytes(), &count.to_le_bytes())
    }
}

impl<K: OrderedKv> RefCounter for KvAttachmentRefs<K> {
    fn increment(&mut self, id: &AttachmentId) -> StoreResult<u64> {
        let count = match self.read(id) {
            Ok(current) => current.unwrap_or(0) + 1,
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(attachment = %id, %reason, "resetting corrupt attachment count");
                1
            }
            Err(e) => return Err(e),
        };
        self.write(id, count)?;
        Ok(count)
    }

    fn decrement(&mut self, id: &AttachmentId) -> StoreResult<RefRelease> {
        let Some(count) = self.read(id)? else {
            return Ok(RefRelease::Unknown);
        };
        let count = count.saturating_sub(1);
        if count == 0 {
            self.kv.delete(id.as_str().as_bytes())?;
            debug!(attachment = %id, "attachment released");
            Ok(RefRelease::Released)
        } else {
            self.write(id, count)?;
            Ok(RefRelease::Remaining(count))
        }
    }

    fn count(&self, id: &AttachmentId) -> StoreResult<u64> {
        Ok(self.read(id)?.unwrap_or(0))
    }
}

/// How a write changes a record's attachment binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Rebind {
    /// Attachment the record references after the write.
    pub bound: Option<AttachmentId>,
    acquire: Option<AttachmentId>,
    release: Option<AttachmentId>,
}

impl Rebind {
    /// Plan a binding change. No request keeps the current binding; the
    /// current id requested again is a no-op.
    pub fn plan(current: Option<&AttachmentId>, requested: Option<&AttachmentId>) -> Self {
        match (current, requested) {
            (_, None) => Self {
                bound: current.cloned(),
                acquire: None,
                release: None,
            },
            (Some(cur), Some(req)) if cur == req => Self {
                bound: Some(cur.clone()),
                acquire: None,
                release: None,
            },
            (cur, Some(req)) => Self {
                bound: Some(req.clone()),
                acquire: Some(req.clone()),
                release: cur.cloned(),
            },
        }
    }

    /// Plan dropping the current binding, as when the record is deleted.
    pub fn detach(current: Option<&AttachmentId>) -> Self {
        Self {
            bound: None,
            acquire: None,
            release: current.cloned(),
        }
    }

    /// Apply the counter changes. On error nothing is left applied.
    pub fn apply<R: RefCounter + ?Sized>(&self, refs: &mut R) -> StoreResult<Applied> {
        let mut applied = Applied::default();
        if let Some(id) = &self.acquire {
            refs.increment(id)?;
            applied.acquired = Some(id.clone());
        }
        let Some(id) = &self.release else {
            return Ok(applied);
        };
        match refs.decrement(id) {
            Ok(RefRelease::Released) => {
                applied.dropped = Some(id.clone());
                applied.released = Some(id.clone());
            }
            Ok(RefRelease::Remaining(_)) => applied.dropped = Some(id.clone()),
            Ok(RefRelease::Unknown) => {
                warn!(attachment = %id, "release of unregistered attachment");
            }
            Err(e) => {
                applied.undo(refs);
                return Err(e);
            }
        }
        Ok(applied)
    }
}

/// Counter changes made by [`Rebind::apply`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Applied {
    /// The previously bound id, when its last reference was dropped.
    pub released: Option<AttachmentId>,
    acquired: Option<AttachmentId>,
    dropped: Option<AttachmentId>,
}

impl Applied {
    /// Reverse the changes after the record write they belonged to failed.
    /// Best effort: a failure here is logged and the count is left as is.
    pub fn undo<R: RefCounter + ?Sized>(&self, refs: &mut R) {
        if let Some(id) = &self.dropped {
            if let Err(e) = refs.increment(id) {
                warn!(attachment = %id, error = %e, "could not restore attachment count");
            }
        }
        if let Some(id) = &self.acquired {
            if let Err(e) = refs.decrement(id) {
                warn!(attachment = %id, error = %e, "could not roll back attachment count");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn id(suffix: &str) -> AttachmentId {
        AttachmentId::parse(&format!("20220201T104852-{suffix:_<16}")).unwrap()
    }

    fn exercise<R: RefCounter>(refs: &mut R) {
        let f = id("f");
        assert_eq!(refs.count(&f).unwrap(), 0);
        assert_eq!(refs.increment(&f).unwrap(), 1);
        assert_eq!(refs.increment(&f).unwrap(), 2);
        assert_eq!(refs.decrement(&f).unwrap(), RefRelease::Remaining(1));
        assert_eq!(refs.decrement(&f).unwrap(), RefRelease::Released);
        assert_eq!(refs.count(&f).unwrap(), 0);
        assert_eq!(refs.decrement(&f).unwrap(), RefRelease::Unknown);
        // A freed id starts a fresh count.
        assert_eq!(refs.increment(&f).unwrap(), 1);
    }

    #[test]
    fn memory_counts() {
        let mut refs = AttachmentRefs::new();
        exercise(&mut refs);
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn kv_counts() {
        let mut refs = KvAttachmentRefs::new(MemoryKv::new());
        exercise(&mut refs);
        assert_eq!(refs.kv().len().unwrap(), 1);
    }

    #[test]
    fn kv_released_entry_is_removed() {
        let mut refs = KvAttachmentRefs::new(MemoryKv::new());
        let f = id("gone");
        refs.increment(&f).unwrap();
        refs.decrement(&f).unwrap();
        assert!(refs.kv().get(f.as_str().as_bytes()).unwrap().is_none());
    }

    #[test]
    fn kv_corrupt_count_is_reported_on_decrement() {
        let kv = MemoryKv::new();
        let f = id("bad");
        kv.put(f.as_str().as_bytes(), b"xyz").unwrap();
        let mut refs = KvAttachmentRefs::new(kv);
        assert!(matches!(
            refs.decrement(&f),
            Err(StoreError::Corrupt { .. })
        ));
        // Increment repairs it.
        assert_eq!(refs.increment(&f).unwrap(), 1);
    }

    #[test]
    fn rebind_plans() {
        let a = id("a");
        let b = id("b");

        let keep = Rebind::plan(Some(&a), None);
        assert_eq!(keep.bound, Some(a.clone()));

        let same = Rebind::plan(Some(&a), Some(&a));
        let mut refs = AttachmentRefs::new();
        refs.increment(&a).unwrap();
        assert_eq!(same.apply(&mut refs).unwrap().released, None);
        assert_eq!(refs.count(&a).unwrap(), 1);

        let swap = Rebind::plan(Some(&a), Some(&b));
        assert_eq!(swap.bound, Some(b.clone()));
        assert_eq!(swap.apply(&mut refs).unwrap().released, Some(a.clone()));
        assert_eq!(refs.count(&a).unwrap(), 0);
        assert_eq!(refs.count(&b).unwrap(), 1);

        let fresh = Rebind::plan(None, Some(&a));
        assert_eq!(fresh.apply(&mut refs).unwrap().released, None);
        assert_eq!(refs.count(&a).unwrap(), 1);
    }

    #[test]
    fn undo_restores_counts() {
        let a = id("a");
        let b = id("b");
        let mut refs = AttachmentRefs::new();
        refs.increment(&a).unwrap();

        let swap = Rebind::plan(Some(&a), Some(&b));
        let applied = swap.apply(&mut refs).unwrap();
        assert_eq!(applied.released, Some(a.clone()));
        applied.undo(&mut refs);
        assert_eq!(refs.count(&a).unwrap(), 1);
        assert_eq!(refs.count(&b).unwrap(), 0);

        let gone = Rebind::detach(Some(&a));
        let applied = gone.apply(&mut refs).unwrap();
        assert_eq!(refs.count(&a).unwrap(), 0);
        applied.undo(&mut refs);
        assert_eq!(refs.count(&a).unwrap(), 1);
    }

    #[test]
    fn undo_skips_unregistered_release() {
        let a = id("a");
        let b = id("b");
        let mut refs = AttachmentRefs::new();
        let applied = Rebind::plan(Some(&a), Some(&b)).apply(&mut refs).unwrap();
        applied.undo(&mut refs);
        assert_eq!(refs.count(&a).unwrap(), 0);
        assert_eq!(refs.count(&b).unwrap(), 0);
        assert!(refs.is_empty());
    }

    #[test]
    fn failed_release_rolls_back_acquire() {
        let kv = MemoryKv::new();
        let a = id("a");
        let b = id("b");
        kv.put(a.as_str().as_bytes(), b"xyz").unwrap();
        let mut refs = KvAttachmentRefs::new(kv);

        let swap = Rebind::plan(Some(&a), Some(&b));
        assert!(matches!(swap.apply(&mut refs), Err(StoreError::Corrupt { .. })));
        assert_eq!(refs.count(&b).unwrap(), 0);
    }

    #[test]
    fn detach_reports_last_reference_only() {
        let mut refs = AttachmentRefs::new();
        let f = id("shared");
        refs.increment(&f).unwrap();
        refs.increment(&f).unwrap();
        let detach = Rebind::detach(Some(&f));
        assert_eq!(detach.bound, None);
        assert_eq!(detach.apply(&mut refs).unwrap().released, None);
        assert_eq!(detach.apply(&mut refs).unwrap().released, Some(f.clone()));
        assert_eq!(detach.apply(&mut refs).unwrap().released, None);
    }
}
