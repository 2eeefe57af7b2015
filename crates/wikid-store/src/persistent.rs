use std::path::Path;
use std::sync::RwLock;

use tracing::{debug, info, warn};
use wikid_types::{AttachmentId, Tiddler};

use crate::cache::ListCache;
use crate::error::{poisoned, StoreError, StoreResult};
use crate::kv::OrderedKv;
use crate::listing::{ListConfig, ListMode, ListSnapshot, ListingBuilder};
use crate::record::StoredRecord;
use crate::refs::{KvAttachmentRefs, RefCounter, Rebind};
use crate::traits::{AttachOutcome, DeleteOutcome, FetchedTiddler, PutOutcome, TiddlerStore};

/// Tree holding bincode-encoded records keyed by title.
pub const RECORDS_TREE: &str = "tiddlers";
/// Tree holding attachment reference counts.
pub const ATTACHMENTS_TREE: &str = "attachments";

/// Tiddler store over an on-disk `sled` database.
pub type SledTiddlerStore = KvTiddlerStore<sled::Tree>;

/// Tiddler store over two [`OrderedKv`] keyspaces: one for records, one for
/// attachment counts.
///
/// The count keyspace sits behind the store's `RwLock`. Writers hold it
/// exclusively for the whole read-modify-write of a record, which serializes
/// writers and keeps each record change atomic with its count change.
/// Readers hold it shared.
///
/// Counts are updated before the record is written. If the record write
/// fails the count changes are undone, so a failed mutation leaves both
/// keyspaces as they were.
pub struct KvTiddlerStore<K> {
    records: K,
    refs: RwLock<KvAttachmentRefs<K>>,
    cache: ListCache,
    config: ListConfig,
}

impl SledTiddlerStore {
    /// Open (or create) a `sled` database at `path`.
    pub fn open_sled(path: impl AsRef<Path>, config: ListConfig) -> StoreResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let records = db.open_tree(RECORDS_TREE)?;
        let attachments = db.open_tree(ATTACHMENTS_TREE)?;
        info!(
            path = %path.display(),
            records = records.len(),
            attachments = attachments.len(),
            "opened sled store"
        );
        Ok(Self::new(records, attachments, config))
    }
}

impl<K: OrderedKv> KvTiddlerStore<K> {
    pub fn new(records: K, attachments: K, config: ListConfig) -> Self {
        Self {
            records,
            refs: RwLock::new(KvAttachmentRefs::new(attachments)),
            cache: ListCache::new(),
            config,
        }
    }

    /// The record keyspace.
    pub fn records(&self) -> &K {
        &self.records
    }

    fn load(&self, title: &str) -> StoreResult<Option<StoredRecord>> {
        match self.records.get(title.as_bytes())? {
            Some(bytes) => StoredRecord::decode(title, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn store(&self, title: &str, record: &StoredRecord) -> StoreResult<()> {
        self.records.put(title.as_bytes(), &record.encode()?)
    }
}

impl<K: OrderedKv> TiddlerStore for KvTiddlerStore<K> {
    fn get(&self, title: &str) -> StoreResult<Option<FetchedTiddler>> {
        let _shared = self.refs.read().map_err(poisoned)?;
        let record = match self.load(title) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(title, %reason, "corrupt record treated as absent");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match record.tiddler() {
            Ok(tiddler) => Ok(Some(FetchedTiddler {
                tiddler,
                revision: record.revision,
                hash: record.hash,
            })),
            Err(e) => {
                warn!(title, error = %e, "unreadable record treated as absent");
                Ok(None)
            }
        }
    }

    fn put(
        &self,
        title: &str,
        tiddler: Tiddler,
        has_macro: bool,
        attachment: Option<&AttachmentId>,
    ) -> StoreResult<PutOutcome> {
        let mut refs = self.refs.write().map_err(poisoned)?;

        let previous = self.load(title)?;
        let rebind = Rebind::plan(
            previous.as_ref().and_then(|p| p.attachment.as_ref()),
            attachment,
        );
        let record = StoredRecord::next(
            title,
            previous.as_ref(),
            tiddler,
            has_macro,
            rebind.bound.clone(),
        )?;
        let applied = rebind.apply(&mut *refs)?;
        if let Err(e) = self.store(title, &record) {
            applied.undo(&mut *refs);
            return Err(e);
        }
        self.cache.mark_dirty();
        drop(refs);

        debug!(title, revision = record.revision, "put tiddler");
        Ok(PutOutcome {
            revision: record.revision,
            hash: record.hash,
            released: applied.released,
        })
    }

    fn delete(&self, title: &str) -> StoreResult<DeleteOutcome> {
        let mut refs = self.refs.write().map_err(poisoned)?;

        let attachment = match self.load(title) {
            Ok(Some(record)) => record.attachment,
            Ok(None) => return Ok(DeleteOutcome::default()),
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(title, %reason, "deleting corrupt record");
                None
            }
            Err(e) => return Err(e),
        };
        let applied = Rebind::detach(attachment.as_ref()).apply(&mut *refs)?;
        if let Err(e) = self.records.delete(title.as_bytes()) {
            applied.undo(&mut *refs);
            return Err(e);
        }
        let release = applied.released;
        self.cache.mark_dirty();
        drop(refs);

        debug!(title, released = ?release, "deleted tiddler");
        Ok(DeleteOutcome {
            existed: true,
            release,
        })
    }

    fn attach_attachment(&self, title: &str, id: &AttachmentId) -> StoreResult<AttachOutcome> {
        let mut refs = self.refs.write().map_err(poisoned)?;

        let Some(record) = self.load(title)? else {
            return Ok(AttachOutcome::Missing);
        };
        let rebind = Rebind::plan(record.attachment.as_ref(), Some(id));
        let applied = rebind.apply(&mut *refs)?;
        if rebind.bound != record.attachment {
            if let Err(e) = self.store(title, &record.with_attachment(rebind.bound.clone())) {
                applied.undo(&mut *refs);
                return Err(e);
            }
            self.cache.mark_dirty();
        }
        drop(refs);

        debug!(title, attachment = %id, "attached");
        Ok(AttachOutcome::Attached {
            released: applied.released,
        })
    }

    fn build_listing(&self, mode: ListMode) -> StoreResult<ListSnapshot> {
        let (generation, records) = {
            let _shared = self.refs.read().map_err(poisoned)?;
            let generation = self.cache.generation();
            let mut records = Vec::new();
            for key in self.records.keys() {
                let key = key?;
                let Ok(title) = String::from_utf8(key) else {
                    warn!("skipping record with non-UTF-8 key");
                    continue;
                };
                match self.load(&title) {
                    Ok(Some(record)) => records.push((title, record)),
                    Ok(None) => {}
                    Err(StoreError::Corrupt { reason, .. }) => {
                        warn!(%title, %reason, "skipping corrupt record in listing");
                    }
                    Err(e) => return Err(e),
                }
            }
            (generation, records)
        };

        let mut builder = ListingBuilder::new(mode, &self.config);
        for (title, record) in &records {
            builder.push(title, record);
        }
        Ok(builder.finish(generation))
    }

    fn list_cache(&self) -> &ListCache {
        &self.cache
    }

    fn len(&self) -> StoreResult<usize> {
        self.records.len()
    }

    fn attachment_count(&self, id: &AttachmentId) -> StoreResult<u64> {
        self.refs.read().map_err(poisoned)?.count(id)
    }

    fn flush(&self) -> StoreResult<()> {
        let refs = self.refs.read().map_err(poisoned)?;
        self.records.flush()?;
        refs.kv().flush()
    }
}

impl<K> std::fmt::Debug for KvTiddlerStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvTiddlerStore")
            .field("config", &self.config)
            .field("generation", &self.cache.generation())
            .finish_non_exhaustive()
    }
}
