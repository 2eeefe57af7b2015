use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;
use wikid_types::{AttachmentId, ContentHash, Tiddler};

use crate::cache::ListCache;
use crate::error::StoreResult;
use crate::listing::{ListMode, ListSnapshot};

/// A record as returned by [`TiddlerStore::get`].
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedTiddler {
    /// The document with its text restored and `revision` set.
    pub tiddler: Tiddler,
    pub revision: u64,
    pub hash: ContentHash,
}

/// Result of a successful [`TiddlerStore::put`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    pub revision: u64,
    pub hash: ContentHash,
    /// Attachment the record was rebound away from whose last reference was
    /// just dropped. The caller deletes its file.
    pub released: Option<AttachmentId>,
}

/// Result of [`TiddlerStore::delete`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub existed: bool,
    /// Attachment whose last reference went away with this record. The caller
    /// deletes its file.
    pub release: Option<AttachmentId>,
}

/// Result of [`TiddlerStore::attach_attachment`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    /// No record under that title. Nothing changed.
    Missing,
    /// The record now references the attachment.
    Attached { released: Option<AttachmentId> },
}

impl AttachOutcome {
    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached { .. })
    }
}

/// Revisioned tiddler storage.
///
/// All implementations must satisfy these invariants:
/// - The Nth successful `put` for a title yields revision N.
/// - A record is replaced as a whole under exclusive access; readers see the
///   old record or the new one, never a mix.
/// - Every mutation bumps the [`ListCache`] generation before its exclusive
///   access ends.
/// - Attachment counts change atomically with the record mutation that
///   triggers them.
/// - Unknown titles are reported as absence, not errors.
///
/// The store never deletes attachment files. When an attachment id is
/// returned as released, its count has already reached zero and the entry is
/// gone; a concurrent upload that re-attaches the same id starts a new count
/// at 1, so callers must not delete a file they have just re-attached.
pub trait TiddlerStore: Send + Sync {
    /// Fetch the current record for `title`.
    ///
    /// Returns `Ok(None)` if the title is unknown or its stored bytes are
    /// corrupt.
    fn get(&self, title: &str) -> StoreResult<Option<FetchedTiddler>>;

    /// Create or update the record for `title`.
    ///
    /// A skinny document keeps the stored text. `attachment`, when given,
    /// binds the record to that attachment; `None` keeps any existing binding.
    fn put(
        &self,
        title: &str,
        tiddler: Tiddler,
        has_macro: bool,
        attachment: Option<&AttachmentId>,
    ) -> StoreResult<PutOutcome>;

    /// Remove the record for `title`.
    fn delete(&self, title: &str) -> StoreResult<DeleteOutcome>;

    /// Bind an attachment to an existing record. Does not change the
    /// revision or the hash.
    fn attach_attachment(&self, title: &str, id: &AttachmentId) -> StoreResult<AttachOutcome>;

    /// Serialize every readable record. The snapshot carries the cache
    /// generation observed before any record was read.
    fn build_listing(&self, mode: ListMode) -> StoreResult<ListSnapshot>;

    /// The cache holding the last full listing.
    fn list_cache(&self) -> &ListCache;

    /// Number of stored records.
    fn len(&self) -> StoreResult<usize>;

    /// How many records reference `id`; 0 when unregistered.
    fn attachment_count(&self, id: &AttachmentId) -> StoreResult<u64>;

    /// Persist outstanding state. No-op for purely in-memory stores.
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Serve a complete listing with `synthetic` appended.
    ///
    /// Full listings come from the cache when it is fresh and are rebuilt
    /// and installed otherwise. Slim listings are always rebuilt.
    fn list(&self, synthetic: &[Tiddler], mode: ListMode) -> StoreResult<Bytes> {
        match mode {
            ListMode::Slim => Ok(self.build_listing(ListMode::Slim)?.finish(synthetic)),
            ListMode::Full => {
                if let Some(snapshot) = self.list_cache().current() {
                    return Ok(snapshot.finish(synthetic));
                }
                let snapshot = Arc::new(self.build_listing(ListMode::Full)?);
                debug!(
                    generation = snapshot.generation(),
                    entries = snapshot.entries(),
                    "rebuilt full listing"
                );
                self.list_cache().install(Arc::clone(&snapshot));
                Ok(snapshot.finish(synthetic))
            }
        }
    }
}
