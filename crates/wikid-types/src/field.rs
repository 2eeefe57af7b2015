use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Ordered map of field name to value, used for both the `fields` object of
/// a tiddler and any unknown top-level keys.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A single document field value.
///
/// TiddlyWeb clients send string-valued fields almost exclusively, but
/// plugins occasionally write numbers, booleans, string lists, or `null`.
/// Each shape round-trips unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<String>),
}

impl FieldValue {
    /// The string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(list: Vec<String>) -> Self {
        Self::List(list)
    }
}
