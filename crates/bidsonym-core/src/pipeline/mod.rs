//! Subject Pipeline and Run Controller.
//!
//! [`RunOptions::validate`] checks option consistency before anything on disk
//! is touched. [`RunController`] then indexes the dataset, resolves the
//! subjects and drives a [`SubjectPipeline`] over each of them, collecting a
//! [`RunSummary`].

mod run;
mod state;
mod subject;
mod summary;

pub use run::{AnalysisLevel, FailurePolicy, RunConfig, RunController, RunOptions};
pub use state::{FileOutcome, FileStage, SubjectOutcome};
pub use subject::{PipelineSettings, SubjectPipeline};
pub use summary::RunSummary;
