//! Error types for BIDSonym.
//!
//! A single error enum covers configuration problems detected before any data
//! is touched, failures of the external imaging tools, quarantine precondition
//! violations, and plain I/O or decoding errors.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How an external tool invocation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailureKind {
    /// The executable could not be started.
    Spawn(String),
    /// The process exited unsuccessfully. Carries the exit code (if any) and
    /// the last lines of stderr.
    ExitStatus { code: Option<i32>, stderr_tail: String },
    /// The process exceeded its time budget and was killed.
    Timeout(Duration),
    /// The process succeeded but a declared output file is absent.
    MissingOutput(PathBuf),
    /// Post-processing of the tool's output failed.
    Postprocess(String),
}

impl std::fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolFailureKind::Spawn(msg) => write!(f, "failed to start: {msg}"),
            ToolFailureKind::ExitStatus { code, stderr_tail } => {
                match code {
                    Some(code) => write!(f, "exited with status {code}")?,
                    None => write!(f, "terminated by signal")?,
                }
                if !stderr_tail.is_empty() {
                    write!(f, ": {stderr_tail}")?;
                }
                Ok(())
            }
            ToolFailureKind::Timeout(limit) => write!(f, "timed out after {limit:?}"),
            ToolFailureKind::MissingOutput(path) => {
                write!(f, "expected output {} was not produced", path.display())
            }
            ToolFailureKind::Postprocess(msg) => write!(f, "post-processing failed: {msg}"),
        }
    }
}

/// Main error type for the BIDSonym library.
#[derive(Debug, Error)]
pub enum BidsonymError {
    // Validation errors, raised before any processing
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(
        "The participant(s) {} are not present in the BIDS dataset, please check again.",
        .labels.join(", ")
    )]
    UnknownParticipants { labels: Vec<String> },

    #[error("Dataset at {root} is not BIDS compliant: {}", .problems.join("; "))]
    DatasetInvalid { root: PathBuf, problems: Vec<String> },

    // External tools
    #[error("{method} failed on {image}: {kind}")]
    ExternalTool {
        method: String,
        image: PathBuf,
        kind: ToolFailureKind,
    },

    // Quarantine
    #[error("{path} is already quarantined; refusing to overwrite (was this dataset already processed?)")]
    AlreadyQuarantined { path: PathBuf },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("TSV error: {message}")]
    Table {
        message: String,
        #[source]
        source: Option<csv::Error>,
    },

    // Imaging
    #[error("Volume error: {message}")]
    Volume { message: String },

    #[error("Report rendering failed: {message}")]
    Report { message: String },

    #[error("Run cancelled")]
    Cancelled,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for BIDSonym operations.
pub type Result<T> = std::result::Result<T, BidsonymError>;

// Conversion implementations for common error types

impl From<std::io::Error> for BidsonymError {
    fn from(err: std::io::Error) -> Self {
        BidsonymError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BidsonymError {
    fn from(err: serde_json::Error) -> Self {
        BidsonymError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<csv::Error> for BidsonymError {
    fn from(err: csv::Error) -> Self {
        BidsonymError::Table {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<nifti::NiftiError> for BidsonymError {
    fn from(err: nifti::NiftiError) -> Self {
        BidsonymError::Volume {
            message: err.to_string(),
        }
    }
}

impl From<image::ImageError> for BidsonymError {
    fn from(err: image::ImageError) -> Self {
        BidsonymError::Report {
            message: err.to_string(),
        }
    }
}

impl From<crate::cancel::CancelledError> for BidsonymError {
    fn from(_: crate::cancel::CancelledError) -> Self {
        BidsonymError::Cancelled
    }
}

impl BidsonymError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BidsonymError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create an IO error describing what was being attempted.
    pub fn io(context: &str, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        BidsonymError::Io {
            message: format!("{context}: {err}"),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        BidsonymError::Config {
            message: message.into(),
        }
    }

    pub fn tool(method: impl Into<String>, image: impl Into<PathBuf>, kind: ToolFailureKind) -> Self {
        BidsonymError::ExternalTool {
            method: method.into(),
            image: image.into(),
            kind,
        }
    }

    /// Whether this error must stop the whole run regardless of failure policy.
    ///
    /// Validation problems and quarantine collisions mean the run's
    /// preconditions do not hold, so continuing with other subjects would only
    /// repeat the damage.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BidsonymError::Config { .. }
                | BidsonymError::UnknownParticipants { .. }
                | BidsonymError::DatasetInvalid { .. }
                | BidsonymError::AlreadyQuarantined { .. }
                | BidsonymError::Cancelled
        )
    }

    /// Process exit code for this error.
    ///
    /// - 2: configuration or dataset validation error
    /// - 3: external tool failure
    /// - 4: quarantine precondition violated
    /// - 130: cancelled (SIGINT convention)
    /// - 1: anything else
    pub fn exit_code(&self) -> i32 {
        match self {
            BidsonymError::Config { .. }
            | BidsonymError::UnknownParticipants { .. }
            | BidsonymError::DatasetInvalid { .. } => 2,

            BidsonymError::ExternalTool { .. } => 3,

            BidsonymError::AlreadyQuarantined { .. } => 4,

            BidsonymError::Cancelled => 130,

            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_participants_lists_every_label() {
        let err = BidsonymError::UnknownParticipants {
            labels: vec!["99".into(), "100".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("99"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_tool_error_display_names_method_and_file() {
        let err = BidsonymError::tool(
            "pydeface",
            "/data/sub-01/anat/sub-01_T1w.nii.gz",
            ToolFailureKind::ExitStatus {
                code: Some(1),
                stderr_tail: "boom".into(),
            },
        );
        assert_eq!(
            err.to_string(),
            "pydeface failed on /data/sub-01/anat/sub-01_T1w.nii.gz: exited with status 1: boom"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(BidsonymError::config("x").exit_code(), 2);
        assert_eq!(
            BidsonymError::tool("bet", "a", ToolFailureKind::Timeout(Duration::from_secs(1)))
                .exit_code(),
            3
        );
        assert_eq!(
            BidsonymError::AlreadyQuarantined { path: "a".into() }.exit_code(),
            4
        );
        assert_eq!(BidsonymError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(BidsonymError::config("x").is_fatal());
        assert!(BidsonymError::AlreadyQuarantined { path: "a".into() }.is_fatal());
        assert!(!BidsonymError::tool(
            "bet",
            "a",
            ToolFailureKind::MissingOutput("b".into())
        )
        .is_fatal());
    }
}
