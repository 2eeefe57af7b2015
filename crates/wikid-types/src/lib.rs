//! Foundation types for wikid, a TiddlyWeb-compatible personal wiki server.
//!
//! Every other wikid crate depends on `wikid-types`.
//!
//! # Key Types
//!
//! - [`Tiddler`] -- a TiddlyWeb JSON document (title, metadata, body text)
//! - [`FieldValue`] -- tagged value for custom and unknown document fields
//! - [`ContentHash`] -- BLAKE3 digest over a stored record's metadata and text
//! - [`AttachmentId`] -- save-name of an uploaded binary attachment

pub mod attachment;
pub mod error;
pub mod field;
pub mod hash;
pub mod tiddler;
pub mod titles;

pub use attachment::AttachmentId;
pub use error::TypeError;
pub use field::{FieldMap, FieldValue};
pub use hash::ContentHash;
pub use tiddler::Tiddler;
