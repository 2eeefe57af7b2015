//! Serialized "all tiddlers" listings.
//!
//! A listing is a JSON array. Records go in first; a few per-request
//! synthetic tiddlers are appended when the listing is served. The record
//! part is what [`ListCache`](crate::ListCache) caches.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;
use wikid_types::Tiddler;

use crate::record::StoredRecord;

/// Default size ceiling for full-text output: 32 MiB.
pub const DEFAULT_FULL_TEXT_CEILING: usize = 32 * 1024 * 1024;

/// What a listing includes for each record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListMode {
    /// Text for every record until the size ceiling is crossed.
    Full,
    /// Metadata only; used for periodic polling.
    Slim,
}

/// Listing limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListConfig {
    /// Once a full listing grows past this many bytes, remaining records are
    /// emitted without text.
    pub full_text_ceiling: usize,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            full_text_ceiling: DEFAULT_FULL_TEXT_CEILING,
        }
    }
}

/// Immutable record portion of a listing: `[` followed by comma-separated
/// records, without the closing bracket.
#[derive(Clone, Debug)]
pub struct ListSnapshot {
    generation: u64,
    buf: Bytes,
    entries: usize,
}

impl ListSnapshot {
    /// The [`ListCache`](crate::ListCache) generation observed before the
    /// records were read.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of records in the snapshot.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Size of the record portion in bytes.
    pub fn byte_len(&self) -> usize {
        self.buf.len()
    }

    /// Append `synthetic` tiddlers and close the array.
    ///
    /// Synthetic tiddlers that fail to serialize are skipped.
    pub fn finish(&self, synthetic: &[Tiddler]) -> Bytes {
        let mut out = Vec::with_capacity(self.buf.len() + 256 * (synthetic.len() + 1));
        out.extend_from_slice(&self.buf);
        let mut has_output = self.entries > 0;
        for tiddler in synthetic {
            let json = match tiddler.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(title = %tiddler.title, error = %e, "skipping synthetic tiddler");
                    continue;
                }
            };
            if has_output {
                out.push(b',');
            }
            out.extend_from_slice(&json);
            has_output = true;
        }
        out.push(b']');
        Bytes::from(out)
    }
}

/// Accumulates records into a [`ListSnapshot`].
pub struct ListingBuilder {
    ceiling: usize,
    full: bool,
    buf: Vec<u8>,
    entries: usize,
}

impl ListingBuilder {
    pub fn new(mode: ListMode, config: &ListConfig) -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.push(b'[');
        Self {
            ceiling: config.full_text_ceiling,
            full: mode == ListMode::Full,
            buf,
            entries: 0,
        }
    }

    /// Add one record. Macro records always carry text; other records carry
    /// text only in a full listing that has not yet crossed the ceiling.
    pub fn push(&mut self, key: &str, record: &StoredRecord) {
        if self.full && self.buf.len() >= self.ceiling {
            self.full = false;
        }

        if record.has_macro || self.full {
            match record.full_json() {
                Ok(json) => self.append(&json),
                Err(e) => warn!(title = key, error = %e, "skipping undecodable record"),
            }
        } else {
            let meta = record.meta.clone();
            self.append(&meta);
        }
    }

    fn append(&mut self, json: &[u8]) {
        if self.entries > 0 {
            self.buf.push(b',');
        }
        self.buf.extend_from_slice(json);
        self.entries += 1;
    }

    /// Whether text is still being emitted for ordinary records.
    pub fn emitting_text(&self) -> bool {
        self.full
    }

    pub fn finish(self, generation: u64) -> ListSnapshot {
        ListSnapshot {
            generation,
            buf: Bytes::from(self.buf),
            entries: self.entries,
        }
    }
}
