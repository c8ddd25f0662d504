//! Dataset Index: structural queries over a BIDS directory tree.
//!
//! The pipeline only reads through this interface and writes at the paths it
//! hands out; it never edits the index itself.

mod entities;
mod layout;

pub use entities::{normalize_label, Entities, FileKind, Modality};
pub use layout::{BidsFile, BidsLayout, DatasetIndex};
