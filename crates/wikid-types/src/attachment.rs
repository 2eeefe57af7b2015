use std::fmt;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Length of the `YYYYMMDDTHHMMSS` timestamp prefix.
const STAMP_LEN: usize = 15;
/// Length of the random suffix after the dash.
const SUFFIX_LEN: usize = 16;

/// Save-name of an uploaded attachment on disk, e.g.
/// `20220201T104852-VgVjI7W_aR7_nkPT`.
///
/// Several tiddlers may reference the same attachment through their
/// `_canonical_uri` field; the store reference-counts these ids.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttachmentId(String);

impl AttachmentId {
    /// Validate and wrap a save-name.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(TypeError::InvalidAttachmentId(s.to_string()))
        }
    }

    /// Generate a fresh save-name for an upload received at `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SUFFIX_LEN)
            .map(char::from)
            .collect();
        Self(format!("{}-{}", now.format("%Y%m%dT%H%M%S"), suffix))
    }

    /// Extract the attachment id from a `_canonical_uri` value such as
    /// `/files/20220201T104852-VgVjI7W_aR7_nkPT`.
    ///
    /// Returns `None` for URIs that do not point into the upload directory.
    pub fn from_canonical_uri(uri: &str) -> Option<Self> {
        let (_, rest) = uri.rsplit_once("files/")?;
        Self::parse(rest).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != STAMP_LEN + 1 + SUFFIX_LEN {
        return false;
    }
    let (stamp, rest) = bytes.split_at(STAMP_LEN);
    let stamp_ok = stamp.iter().enumerate().all(|(i, b)| {
        if i == 8 {
            *b == b'T'
        } else {
            b.is_ascii_digit()
        }
    });
    stamp_ok
        && rest[0] == b'-'
        && rest[1..]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
}

impl fmt::Debug for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentId({})", self.0)
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AttachmentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AttachmentId {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if is_valid(&s) {
            Ok(Self(s))
        } else {
            Err(TypeError::InvalidAttachmentId(s))
        }
    }
}

impl From<AttachmentId> for String {
    fn from(id: AttachmentId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_accepts_save_names() {
        let id = AttachmentId::parse("20220201T104852-VgVjI7W_aR7_nkPT").unwrap();
        assert_eq!(id.as_str(), "20220201T104852-VgVjI7W_aR7_nkPT");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in [
            "",
            "20220201T104852",
            "20220201X104852-VgVjI7W_aR7_nkPT",
            "20220201T104852-VgVjI7W_aR7_nkP",
            "20220201T104852-VgVjI7W_aR7_nk/T",
            "../../etc/passwd",
        ] {
            assert!(AttachmentId::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn generate_produces_valid_ids() {
        let now = Utc.with_ymd_and_hms(2022, 2, 1, 10, 48, 52).unwrap();
        let id = AttachmentId::generate(now);
        assert!(id.as_str().starts_with("20220201T104852-"));
        assert!(AttachmentId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn generated_ids_differ() {
        let now = Utc::now();
        assert_ne!(AttachmentId::generate(now), AttachmentId::generate(now));
    }

    #[test]
    fn canonical_uri_extraction() {
        let id = AttachmentId::from_canonical_uri("/files/20220201T104852-VgVjI7W_aR7_nkPT");
        assert_eq!(id.unwrap().as_str(), "20220201T104852-VgVjI7W_aR7_nkPT");

        let id = AttachmentId::from_canonical_uri("files/20220201T104852-VgVjI7W_aR7_nkPT");
        assert!(id.is_some());

        assert!(AttachmentId::from_canonical_uri("https://example.com/cat.png").is_none());
        assert!(AttachmentId::from_canonical_uri("/files/not-an-id").is_none());
    }

    #[test]
    fn serde_rejects_invalid() {
        let parsed: Result<AttachmentId, _> = serde_json::from_str("\"nope\"");
        assert!(parsed.is_err());
        let parsed: AttachmentId =
            serde_json::from_str("\"20220201T104852-VgVjI7W_aR7_nkPT\"").unwrap();
        assert_eq!(parsed.to_string(), "20220201T104852-VgVjI7W_aR7_nkPT");
    }
}
