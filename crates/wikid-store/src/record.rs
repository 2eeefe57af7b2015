use serde::{Deserialize, Serialize};

use wikid_types::{AttachmentId, ContentHash, Tiddler};

use crate::error::{StoreError, StoreResult};

/// One versioned tiddler as held by a backend.
///
/// `meta` is the canonical JSON of every document field except `text`, with
/// the revision embedded as a string. Records are never edited in place; a
/// write builds the successor with [`StoredRecord::next`] and swaps it in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub revision: u64,
    pub meta: Vec<u8>,
    pub text: String,
    pub hash: ContentHash,
    pub attachment: Option<AttachmentId>,
    pub has_macro: bool,
}

impl StoredRecord {
    /// Build the record that follows `previous` for the title `key`.
    ///
    /// A skinny document keeps the previous text. The title is forced to
    /// `key`, the revision advances by one, and the hash is recomputed over
    /// the new metadata and the (possibly retained) text.
    pub fn next(
        key: &str,
        previous: Option<&StoredRecord>,
        mut incoming: Tiddler,
        has_macro: bool,
        attachment: Option<AttachmentId>,
    ) -> StoreResult<Self> {
        if incoming.is_skinny() {
            incoming.is_skinny = None;
            incoming.text = previous.map(|p| p.text.clone()).unwrap_or_default();
        }

        let revision = previous.map_or(0, |p| p.revision) + 1;
        incoming.title = key.to_string();
        incoming.revision = revision.to_string();

        let text = std::mem::take(&mut incoming.text);
        let meta = incoming.to_json()?;
        let hash = ContentHash::compute(&meta, &text);

        Ok(Self {
            revision,
            meta,
            text,
            hash,
            attachment,
            has_macro,
        })
    }

    /// Decode the metadata and put the text back.
    pub fn tiddler(&self) -> StoreResult<Tiddler> {
        let mut tiddler = Tiddler::from_json(&self.meta)?;
        tiddler.text = self.text.clone();
        Ok(tiddler)
    }

    /// The title recorded in the metadata.
    pub fn title(&self) -> StoreResult<String> {
        Ok(Tiddler::from_json(&self.meta)?.title)
    }

    /// Full JSON (metadata plus text) as served in listings.
    pub fn full_json(&self) -> StoreResult<Vec<u8>> {
        Ok(self.tiddler()?.to_json()?)
    }

    /// Same record bound to a different attachment. Revision and hash are
    /// unchanged: binding is not a content write.
    pub fn with_attachment(&self, attachment: Option<AttachmentId>) -> Self {
        Self {
            attachment,
            ..self.clone()
        }
    }

    /// Encode for an on-disk keyspace.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Decode bytes read from an on-disk keyspace.
    pub fn decode(key: &str, bytes: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}
