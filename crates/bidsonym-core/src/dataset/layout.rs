//! Read-only index over a BIDS dataset tree.

use super::entities::{normalize_label, Entities, FileKind, Modality};
use crate::config::PathsConfig;
use crate::{BidsonymError, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// A file of the dataset together with its parsed entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BidsFile {
    /// Canonical (absolute) location inside the dataset.
    pub path: PathBuf,
    pub entities: Entities,
}

impl BidsFile {
    /// Path relative to the dataset root.
    pub fn relpath(&self) -> PathBuf {
        self.entities.relative_path()
    }

    pub fn kind(&self) -> FileKind {
        self.entities.kind()
    }
}

/// Structural queries over a dataset.
///
/// Implementations never mutate the dataset. Listing order is deterministic so
/// repeated runs visit files in the same order.
pub trait DatasetIndex: Send + Sync {
    fn root(&self) -> &Path;

    /// All subject labels (without `sub-`), sorted.
    fn list_subjects(&self) -> Vec<String>;

    /// Compressed images of the given modality for a subject, sorted by path.
    fn list_files(&self, subject: &str, modality: Modality, session: Option<&str>) -> Vec<BidsFile>;

    /// JSON sidecars belonging to a subject, sorted by path.
    fn sidecars(&self, subject: &str) -> Vec<BidsFile>;

    /// Canonical absolute path for a set of entities.
    fn canonical_path(&self, entities: &Entities) -> PathBuf {
        self.root().join(entities.relative_path())
    }

    /// The file with the same entities as `file` but the other modality's
    /// suffix, if it currently exists on disk.
    fn find_counterpart(&self, file: &BidsFile, modality: Modality) -> Option<BidsFile> {
        let entities = file.entities.with_suffix(modality.suffix());
        let path = self.canonical_path(&entities);
        path.is_file().then_some(BidsFile { path, entities })
    }
}

/// `DatasetIndex` backed by a filesystem walk performed once at open time.
#[derive(Debug, Clone)]
pub struct BidsLayout {
    root: PathBuf,
    subjects: BTreeSet<String>,
    files: Vec<BidsFile>,
}

impl BidsLayout {
    /// Index the dataset at `root`.
    ///
    /// With `validate`, the dataset description and every file name under the
    /// `sub-*` directories are checked and all problems are reported together.
    /// Without it, files that do not parse are silently left out of the index.
    pub fn open(root: impl AsRef<Path>, validate: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(BidsonymError::FileNotFound(root));
        }

        let mut problems = Vec::new();
        if validate {
            info!("Making sure the input data is BIDS compliant");
            if let Err(problem) = check_description(&root) {
                problems.push(problem);
            }
        } else {
            info!("Input data will not be checked for BIDS compliance.");
        }

        let mut subjects = BTreeSet::new();
        let mut files = Vec::new();

        let walker = WalkDir::new(&root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                if name.starts_with('.') {
                    return false;
                }
                // Only subject directories belong to the raw data; sourcedata,
                // derivatives and top-level files are outside the index.
                entry.depth() > 1 || (entry.file_type().is_dir() && name.starts_with("sub-"))
            });

        for entry in walker {
            let entry = entry.map_err(|e| BidsonymError::Io {
                message: format!("walking dataset: {e}"),
                path: e.path().map(Path::to_path_buf),
                source: None,
            })?;

            if entry.depth() == 1 {
                if let Some(label) = entry.file_name().to_str().and_then(|n| n.strip_prefix("sub-")) {
                    subjects.insert(label.to_string());
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = match entry.path().strip_prefix(&root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            match Entities::parse_relative_path(rel) {
                Some(entities) => files.push(BidsFile {
                    path: entry.path().to_path_buf(),
                    entities,
                }),
                None if validate => {
                    problems.push(format!("{} is not a valid BIDS file name", rel.display()))
                }
                None => debug!("Skipping non-BIDS file {}", rel.display()),
            }
        }

        if !problems.is_empty() {
            return Err(BidsonymError::DatasetInvalid { root, problems });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(
            "Indexed {} files for {} subjects under {}",
            files.len(),
            subjects.len(),
            root.display()
        );

        Ok(Self { root, subjects, files })
    }

}

impl DatasetIndex for BidsLayout {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list_subjects(&self) -> Vec<String> {
        self.subjects.iter().cloned().collect()
    }

    fn list_files(&self, subject: &str, modality: Modality, session: Option<&str>) -> Vec<BidsFile> {
        let subject = normalize_label(subject);
        self.files
            .iter()
            .filter(|f| f.entities.subject == subject)
            .filter(|f| session.is_none() || f.entities.session.as_deref() == session)
            .filter(|f| f.entities.modality() == Some(modality) && f.entities.extension == ".nii.gz")
            .cloned()
            .collect()
    }

    fn sidecars(&self, subject: &str) -> Vec<BidsFile> {
        let subject = normalize_label(subject);
        self.files
            .iter()
            .filter(|f| f.entities.subject == subject && f.kind() == FileKind::Sidecar)
            .cloned()
            .collect()
    }
}

fn check_description(root: &Path) -> std::result::Result<(), String> {
    let path = root.join(PathsConfig::DATASET_DESCRIPTION);
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {e}", PathsConfig::DATASET_DESCRIPTION))?;
    let value: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| format!("{} is not valid JSON: {e}", PathsConfig::DATASET_DESCRIPTION))?;
    for field in ["Name", "BIDSVersion"] {
        if value.get(field).is_none() {
            return Err(format!(
                "{} is missing required field {field}",
                PathsConfig::DATASET_DESCRIPTION
            ));
        }
    }
    Ok(())
}
