use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::field::{FieldMap, FieldValue};
use crate::titles::{AUTO_GENERATED_TAG, CANONICAL_URI_FIELD, DEFAULT_TYPE, MACRO_TAG};

/// A TiddlyWeb JSON document.
///
/// Standard fields are modelled directly; custom fields live under
/// [`fields`](Self::fields). Any top-level key the protocol does not name is
/// kept in [`extra`](Self::extra) and written back unchanged. Empty string
/// fields are omitted on output.
///
/// Serialization is canonical: standard fields in declaration order followed
/// by unknown keys in sorted order, so equal documents produce equal bytes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Tiddler {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub modified: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub modifier: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recipe: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Skinny marker: present when the client sent metadata without text.
    #[serde(rename = "_is_skinny", default, skip_serializing_if = "Option::is_none")]
    pub is_skinny: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: FieldMap,
}

impl Tiddler {
    /// Create a tiddler with only a title and text.
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    /// A server-generated tiddler tagged `auto-generated`.
    pub fn synthetic(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            content_type: DEFAULT_TYPE.to_string(),
            tags: Some(vec![AUTO_GENERATED_TAG.to_string()]),
            ..Self::new(title, text)
        }
    }

    /// Parse a request body.
    pub fn from_json(bytes: &[u8]) -> Result<Self, TypeError> {
        serde_json::from_slice(bytes).map_err(|e| TypeError::Serialization(e.to_string()))
    }

    /// Canonical JSON encoding.
    pub fn to_json(&self) -> Result<Vec<u8>, TypeError> {
        serde_json::to_vec(self).map_err(|e| TypeError::Serialization(e.to_string()))
    }

    /// Builder-style tag setter.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Builder-style custom field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields
            .get_or_insert_with(FieldMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Builder-style skinny marker.
    pub fn skinny(mut self) -> Self {
        self.is_skinny = Some(serde_json::Value::String(String::new()));
        self
    }

    /// Whether the client flagged this as a metadata-only update.
    pub fn is_skinny(&self) -> bool {
        self.is_skinny.is_some()
    }

    /// Whether the tag set contains the macro tag.
    pub fn has_macro_tag(&self) -> bool {
        self.tags
            .as_deref()
            .is_some_and(|tags| tags.iter().any(|t| t == MACRO_TAG))
    }

    /// The `_canonical_uri` custom field, when it is a string.
    pub fn canonical_uri(&self) -> Option<&str> {
        self.fields.as_ref()?.get(CANONICAL_URI_FIELD)?.as_str()
    }

    /// Fill in the protocol defaults clients expect on read.
    pub fn apply_read_defaults(&mut self, bag: &str) {
        if self.bag.is_empty() {
            self.bag = bag.to_string();
        }
        if self.content_type.is_empty() {
            self.content_type = DEFAULT_TYPE.to_string();
        }
    }
}
