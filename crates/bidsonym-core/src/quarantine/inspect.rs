//! Metadata risk inspection.
//!
//! Every field of every sidecar of a subject is listed in a TSV report with a
//! marker saying whether its name matches one of the configured risk
//! keywords. The report lands in the subject's `meta_data_info/` directory in
//! the quarantine.

use super::atomic::atomic_write;
use super::relocate::Quarantine;
use crate::config::RedactionConfig;
use crate::dataset::DatasetIndex;
use crate::{BidsonymError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

/// How field names are compared against risk keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMatch {
    /// Field name equals a keyword.
    #[default]
    Exact,
    /// Field name contains a keyword, ignoring case.
    Substring,
}

impl FromStr for KeywordMatch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(KeywordMatch::Exact),
            "substring" => Ok(KeywordMatch::Substring),
            other => Err(format!("unknown keyword match mode '{other}' (expected exact or substring)")),
        }
    }
}

/// The configurable list of field names considered identifying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskKeywords {
    pub keywords: Vec<String>,
    pub mode: KeywordMatch,
}

impl Default for RiskKeywords {
    fn default() -> Self {
        Self {
            keywords: RedactionConfig::DEFAULT_RISK_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            mode: KeywordMatch::Exact,
        }
    }
}

impl RiskKeywords {
    pub fn is_problematic(&self, field: &str) -> bool {
        match self.mode {
            KeywordMatch::Exact => self.keywords.iter().any(|k| k == field),
            KeywordMatch::Substring => {
                let field = field.to_lowercase();
                self.keywords
                    .iter()
                    .any(|k| !k.is_empty() && field.contains(&k.to_lowercase()))
            }
        }
    }
}

/// One row of the metadata report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldRecord {
    pub file: String,
    pub field: String,
    pub value: String,
    pub problematic: bool,
}

/// Result of inspecting one subject.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataReport {
    pub path: PathBuf,
    pub records: Vec<FieldRecord>,
}

impl MetadataReport {
    pub fn problematic_count(&self) -> usize {
        self.records.iter().filter(|r| r.problematic).count()
    }
}

/// Inspect all sidecars of `subject` and write the TSV report.
pub fn inspect_metadata(
    index: &dyn DatasetIndex,
    quarantine: &Quarantine,
    subject: &str,
    keywords: &RiskKeywords,
) -> Result<MetadataReport> {
    let mut records = Vec::new();
    for sidecar in index.sidecars(subject) {
        let meta_data = super::atomic::read_json_object(&sidecar.path)?;
        let file = sidecar.relpath().to_string_lossy().to_string();
        for (field, value) in meta_data {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            records.push(FieldRecord {
                file: file.clone(),
                problematic: keywords.is_problematic(&field),
                field,
                value,
            });
        }
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(Vec::new());
    for record in &records {
        writer.serialize(record)?;
    }
    if records.is_empty() {
        writer.write_record(["file", "field", "value", "problematic"])?;
    }
    let bytes = writer.into_inner().map_err(|e| BidsonymError::Other(e.to_string()))?;

    let path = quarantine
        .meta_info_dir(subject)
        .join(format!("sub-{subject}_desc-metadatafields.tsv"));
    atomic_write(&path, &bytes)?;

    let report = MetadataReport { path, records };
    info!(
        "Inspected {} metadata fields for sub-{}, {} flagged",
        report.records.len(),
        subject,
        report.problematic_count()
    );
    Ok(report)
}
