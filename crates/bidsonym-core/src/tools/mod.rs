//! External imaging tools.
//!
//! Brain extraction, the five defacing methods and cross-modality alignment
//! are performed by external executables. This module wraps them behind a
//! single typed interface:
//!
//! - [`ToolAdapter`] turns a method choice into the tool's fixed argument
//!   template and post-processes results.
//! - [`ToolRunner`] executes a [`ToolInvocation`]; [`ProcessRunner`] is the
//!   real implementation, tests substitute their own.

mod adapter;
mod methods;
mod runner;

pub use adapter::ToolAdapter;
pub use methods::{BrainExtractionMethod, DeidMethod};
pub use runner::{ProcessRunner, ToolInvocation, ToolRunner};
