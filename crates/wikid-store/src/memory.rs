use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wikid_types::{AttachmentId, ContentHash, Tiddler};

use crate::cache::ListCache;
use crate::error::{poisoned, StoreError, StoreResult};
use crate::listing::{ListConfig, ListMode, ListSnapshot, ListingBuilder};
use crate::record::StoredRecord;
use crate::refs::{AttachmentRefs, RefCounter, Rebind};
use crate::traits::{AttachOutcome, DeleteOutcome, FetchedTiddler, PutOutcome, TiddlerStore};

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<String, Arc<StoredRecord>>,
    refs: AttachmentRefs,
}

/// In-memory, `BTreeMap`-based tiddler store.
///
/// Records and attachment counts share one `RwLock`, so a record write and
/// the count change it triggers are applied together. Records are held behind
/// `Arc` and replaced, never edited, which lets listing builds copy the table
/// cheaply and serialize without holding the lock.
///
/// State can be saved to and restored from a JSON snapshot file.
pub struct MemoryTiddlerStore {
    state: RwLock<MemoryState>,
    cache: ListCache,
    config: ListConfig,
    snapshot_path: Option<PathBuf>,
}

impl MemoryTiddlerStore {
    /// Create an empty store with default listing limits.
    pub fn new() -> Self {
        Self::with_config(ListConfig::default())
    }

    pub fn with_config(config: ListConfig) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            cache: ListCache::new(),
            config,
            snapshot_path: None,
        }
    }

    /// Create a store backed by a snapshot file. The file is loaded if it
    /// exists and rewritten on every [`flush`](TiddlerStore::flush).
    pub fn open_snapshot(path: impl Into<PathBuf>, config: ListConfig) -> StoreResult<Self> {
        let path = path.into();
        let mut store = Self::with_config(config);
        if path.exists() {
            store.load(&path)?;
        } else {
            info!(path = %path.display(), "snapshot not found, starting empty");
        }
        store.snapshot_path = Some(path);
        Ok(store)
    }

    /// The snapshot file used by `flush`, if any.
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Returns `true` if the store holds no records.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.state.read().map_err(poisoned)?.records.is_empty())
    }

    /// Replace the contents of the store with a snapshot file.
    ///
    /// Entries whose metadata cannot be parsed or that have no title are
    /// skipped. Attachment counts are rebuilt from the loaded records.
    pub fn load(&self, path: &Path) -> StoreResult<usize> {
        let file = File::open(path)?;
        let entries: Vec<DumpEntry> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let total = entries.len();

        let mut next = MemoryState::default();
        for entry in entries {
            let Some((title, record)) = entry.into_record() else {
                continue;
            };
            if let Some(id) = &record.attachment {
                next.refs.increment(id)?;
            }
            next.records.insert(title, Arc::new(record));
        }

        let loaded = next.records.len();
        if loaded < total {
            warn!(
                path = %path.display(),
                skipped = total - loaded,
                "skipped unreadable snapshot entries"
            );
        }

        let mut state = self.state.write().map_err(poisoned)?;
        *state = next;
        self.cache.mark_dirty();
        drop(state);

        info!(path = %path.display(), records = loaded, "loaded snapshot");
        Ok(loaded)
    }

    /// Write every record to a snapshot file.
    ///
    /// The file is written beside the target and renamed into place, so a
    /// crash never leaves a truncated snapshot.
    pub fn dump(&self, path: &Path) -> StoreResult<usize> {
        let entries: Vec<DumpEntry> = {
            let state = self.state.read().map_err(poisoned)?;
            state
                .records
                .values()
                .map(|record| DumpEntry::from_record(record))
                .collect()
        };

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, &entries)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        debug!(path = %path.display(), records = entries.len(), "dumped snapshot");
        Ok(entries.len())
    }
}

impl Default for MemoryTiddlerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TiddlerStore for MemoryTiddlerStore {
    fn get(&self, title: &str) -> StoreResult<Option<FetchedTiddler>> {
        let record = {
            let state = self.state.read().map_err(poisoned)?;
            match state.records.get(title) {
                Some(record) => Arc::clone(record),
                None => return Ok(None),
            }
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
        let mut guard = self.state.write().map_err(poisoned)?;
        let state = &mut *guard;

        let previous = state.records.get(title).cloned();
        let rebind = Rebind::plan(
            previous.as_ref().and_then(|p| p.attachment.as_ref()),
            attachment,
        );
        let record = StoredRecord::next(
            title,
            previous.as_deref(),
            tiddler,
            has_macro,
            rebind.bound.clone(),
        )?;
        let released = rebind.apply(&mut state.refs)?.released;

        let outcome = PutOutcome {
            revision: record.revision,
            hash: record.hash,
            released,
        };
        state.records.insert(title.to_string(), Arc::new(record));
        self.cache.mark_dirty();
        drop(guard);

        debug!(title, revision = outcome.revision, "put tiddler");
        Ok(outcome)
    }

    fn delete(&self, title: &str) -> StoreResult<DeleteOutcome> {
        let mut guard = self.state.write().map_err(poisoned)?;
        let state = &mut *guard;

        let Some(record) = state.records.get(title).cloned() else {
            return Ok(DeleteOutcome::default());
        };
        let release = Rebind::detach(record.attachment.as_ref())
            .apply(&mut state.refs)?
            .released;
        state.records.remove(title);
        self.cache.mark_dirty();
        drop(guard);

        debug!(title, released = ?release, "deleted tiddler");
        Ok(DeleteOutcome {
            existed: true,
            release,
        })
    }

    fn attach_attachment(&self, title: &str, id: &AttachmentId) -> StoreResult<AttachOutcome> {
        let mut guard = self.state.write().map_err(poisoned)?;
        let state = &mut *guard;

        let Some(record) = state.records.get(title).cloned() else {
            return Ok(AttachOutcome::Missing);
        };
        let rebind = Rebind::plan(record.attachment.as_ref(), Some(id));
        let released = rebind.apply(&mut state.refs)?.released;
        if rebind.bound != record.attachment {
            state.records.insert(
                title.to_string(),
                Arc::new(record.with_attachment(rebind.bound.clone())),
            );
            self.cache.mark_dirty();
        }
        drop(guard);

        debug!(title, attachment = %id, "attached");
        Ok(AttachOutcome::Attached { released })
    }

    fn build_listing(&self, mode: ListMode) -> StoreResult<ListSnapshot> {
        let (generation, records) = {
            let state = self.state.read().map_err(poisoned)?;
            let records: Vec<(String, Arc<StoredRecord>)> = state
                .records
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect();
            (self.cache.generation(), records)
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
        Ok(self.state.read().map_err(poisoned)?.records.len())
    }

    fn attachment_count(&self, id: &AttachmentId) -> StoreResult<u64> {
        self.state.read().map_err(poisoned)?.refs.count(id)
    }

    fn flush(&self) -> StoreResult<()> {
        if let Some(path) = &self.snapshot_path {
            self.dump(path)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTiddlerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len().unwrap_or(0);
        f.debug_struct("MemoryTiddlerStore")
            .field("record_count", &count)
            .field("snapshot_path", &self.snapshot_path)
            .finish()
    }
}

/// One record in a snapshot file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DumpEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    meta: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    text: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    rev: u64,
    #[serde(rename = "macro", default, skip_serializing_if = "is_false")]
    has_macro: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    file: String,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl DumpEntry {
    fn from_record(record: &StoredRecord) -> Self {
        Self {
            meta: String::from_utf8_lossy(&record.meta).into_owned(),
            text: record.text.clone(),
            rev: record.revision,
            has_macro: record.has_macro,
            hash: record.hash.to_hex(),
            file: record
                .attachment
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_default(),
        }
    }

    /// Rebuild the record, keyed by the title inside its metadata.
    fn into_record(self) -> Option<(String, StoredRecord)> {
        let title = match Tiddler::from_json(self.meta.as_bytes()) {
            Ok(t) if !t.title.is_empty() => t.title,
            Ok(_) => return None,
            Err(e) => {
                debug!(error = %e, "snapshot entry has unreadable metadata");
                return None;
            }
        };

        let meta = self.meta.into_bytes();
        let hash = ContentHash::from_hex(&self.hash)
            .unwrap_or_else(|_| ContentHash::compute(&meta, &self.text));
        let attachment = if self.file.is_empty() {
            None
        } else {
            match AttachmentId::parse(&self.file) {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(%title, file = %self.file, "dropping invalid attachment reference");
                    None
                }
            }
        };

        Some((
            title,
            StoredRecord {
                revision: self.rev,
                meta,
                text: self.text,
                hash,
                attachment,
                has_macro: self.has_macro,
            },
        ))
    }
}
