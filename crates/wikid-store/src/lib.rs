//! Revisioned tiddler storage for wikid.
//!
//! This crate holds one versioned record per tiddler title, derives the
//! serialized "all tiddlers" listing from those records, and reference-counts
//! attachments shared by several tiddlers.
//!
//! # Storage Backends
//!
//! All backends implement the [`TiddlerStore`] trait:
//!
//! - [`MemoryTiddlerStore`] -- `BTreeMap`-based store with optional JSON
//!   snapshot file
//! - [`KvTiddlerStore`] -- wrapper over any [`OrderedKv`] engine; `sled` is
//!   the on-disk engine ([`SledTiddlerStore`])
//!
//! # Rules
//!
//! 1. A title's revision starts at 1 and grows by exactly 1 per write.
//! 2. Records are replaced wholesale under the exclusive lock; readers never
//!    observe a partially written record.
//! 3. Every mutation bumps the [`ListCache`] generation, so the next full
//!    listing is rebuilt.
//! 4. The store only *signals* that an attachment is unreferenced; deleting
//!    the file is the caller's job.
//! 5. Corrupt stored bytes read as "absent" on read paths and are logged.

pub mod cache;
pub mod error;
pub mod kv;
pub mod listing;
pub mod memory;
pub mod persistent;
pub mod record;
pub mod refs;
pub mod traits;

pub use cache::ListCache;
pub use error::{StoreError, StoreResult};
pub use kv::{MemoryKv, OrderedKv};
pub use listing::{ListConfig, ListMode, ListSnapshot, ListingBuilder};
pub use memory::MemoryTiddlerStore;
pub use persistent::{KvTiddlerStore, SledTiddlerStore};
pub use record::StoredRecord;
pub use refs::{AttachmentRefs, KvAttachmentRefs, RefCounter, RefRelease};
pub use traits::{AttachOutcome, DeleteOutcome, FetchedTiddler, PutOutcome, TiddlerStore};
