//! BIDSonym Core - per-subject de-identification of BIDS anatomical MRI.
//!
//! For every selected subject the library extracts a brain mask from each
//! T1w image, moves the original into the dataset's quarantine
//! (`sourcedata/bidsonym`), defaces it back into its canonical path with one
//! of five external defacing tools, and renders QC images. T2w images can be
//! defaced with the defaced T1w as a mask, and sidecar metadata can be
//! inspected and redacted.
//!
//! The external imaging tools are driven through [`tools::ToolRunner`], so
//! the whole pipeline can run against a test double.
//!
//! # Example
//!
//! ```rust,ignore
//! use bidsonym_core::{AnalysisLevel, CancellationToken, DeidMethod, RunController, RunOptions};
//! use bidsonym_core::tools::BrainExtractionMethod;
//!
//! #[tokio::main]
//! async fn main() -> bidsonym_core::Result<()> {
//!     let mut options = RunOptions::new("/data/ds001", AnalysisLevel::Participant);
//!     options.participant_labels = vec!["01".into()];
//!     options.deid = Some(DeidMethod::Pydeface);
//!     options.brain_extraction = Some(BrainExtractionMethod::Bet);
//!     options.bet_frac = Some(0.5);
//!
//!     let summary = RunController::new(options.validate()?)
//!         .run(&CancellationToken::new())
//!         .await?;
//!     println!("{} subject(s) processed", summary.processed.len());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod dataset;
pub mod error;
pub mod pipeline;
pub mod quarantine;
pub mod reports;
pub mod tools;
pub mod volume;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::ToolPaths;
pub use dataset::{BidsLayout, DatasetIndex, Modality};
pub use error::{BidsonymError, Result, ToolFailureKind};
pub use pipeline::{
    AnalysisLevel, FailurePolicy, FileOutcome, FileStage, RunConfig, RunController, RunOptions,
    RunSummary, SubjectOutcome,
};
pub use quarantine::{KeywordMatch, Quarantine};
pub use tools::{BrainExtractionMethod, DeidMethod};
