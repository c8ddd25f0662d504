//! File relocation, metadata redaction and metadata inspection.
//!
//! Everything that has to survive de-identification unmodified (original
//! images, pre-edit sidecars) and everything produced for review (brain
//! masks, QC images, metadata reports) lives under the dataset's quarantine
//! subtree, `sourcedata/bidsonym`.

pub mod atomic;
mod inspect;
mod redact;
mod relocate;

pub use inspect::{inspect_metadata, FieldRecord, KeywordMatch, MetadataReport, RiskKeywords};
pub use redact::redact_metadata;
pub use relocate::{sha256_file, Quarantine, QuarantinedFile};
