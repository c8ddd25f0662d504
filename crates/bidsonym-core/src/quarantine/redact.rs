//! Metadata sidecar redaction.

use super::atomic::{atomic_write_json, read_json_object};
use super::relocate::Quarantine;
use crate::config::RedactionConfig;
use crate::dataset::DatasetIndex;
use crate::Result;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info};

/// Replace the values of `fields` in every sidecar of `subject` with the
/// redaction sentinel.
///
/// Only sidecars that actually change are touched: their pre-edit bytes are
/// moved to the quarantine and the edited document is written back at the
/// canonical path. Fields that already hold the sentinel do not count as a
/// change, so a repeated redaction is a no-op rather than a quarantine
/// collision.
///
/// Returns the canonical paths of the rewritten sidecars.
pub fn redact_metadata(
    index: &dyn DatasetIndex,
    quarantine: &Quarantine,
    subject: &str,
    fields: &[String],
) -> Result<Vec<PathBuf>> {
    let mut edited_files = Vec::new();
    if fields.is_empty() {
        return Ok(edited_files);
    }

    for sidecar in index.sidecars(subject) {
        let mut meta_data = read_json_object(&sidecar.path)?;
        let mut edited = false;
        for field in fields {
            if let Some(value) = meta_data.get_mut(field) {
                if value.as_str() != Some(RedactionConfig::SENTINEL) {
                    *value = Value::String(RedactionConfig::SENTINEL.to_string());
                    edited = true;
                }
            }
        }

        if !edited {
            debug!("No requested fields in {}", sidecar.relpath().display());
            continue;
        }

        info!("Editing file: {}", sidecar.relpath().display());
        quarantine.relocate(&sidecar)?;
        atomic_write_json(&sidecar.path, &meta_data)?;
        edited_files.push(sidecar.path);
    }

    Ok(edited_files)
}
