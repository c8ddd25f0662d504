//! BIDS file name entities.
//!
//! A BIDS file name is a sequence of `key-value` entities followed by a
//! suffix and extension, e.g. `sub-01_ses-pre_acq-mprage_T1w.nii.gz`. The
//! canonical location of a file is fully determined by its entities, which is
//! what lets the quarantine mirror the dataset tree.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

static FILE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^sub-(?P<sub>[a-zA-Z0-9]+)(?P<entities>(?:_[a-zA-Z0-9]+-[a-zA-Z0-9]+)*)_(?P<suffix>[a-zA-Z0-9]+)(?P<ext>(?:\.[a-zA-Z0-9]+)+)$",
    )
    .expect("BIDS file name regex must compile")
});

/// Anatomical modality handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    /// Primary modality, defaced first.
    T1w,
    /// Secondary modality, defaced with the primary's result as a mask.
    T2w,
}

impl Modality {
    pub fn suffix(&self) -> &'static str {
        match self {
            Modality::T1w => "T1w",
            Modality::T2w => "T2w",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Whether a file holds voxel data or JSON metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Image,
    Sidecar,
    Other,
}

/// Parsed entities of a BIDS file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entities {
    pub subject: String,
    pub session: Option<String>,
    /// Remaining `key-value` entities, in file name order.
    pub extra: Vec<(String, String)>,
    /// Datatype directory (`anat`, `func`, ...) when the file lives in one.
    pub datatype: Option<String>,
    pub suffix: String,
    /// Extension including the leading dot, e.g. `.nii.gz`.
    pub extension: String,
}

impl Entities {
    /// Parse a bare file name. The datatype is left empty.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let caps = FILE_NAME_RE.captures(name)?;
        let mut session = None;
        let mut extra = Vec::new();
        for pair in caps["entities"].split('_').filter(|s| !s.is_empty()) {
            let (key, value) = pair.split_once('-')?;
            if key == "ses" && session.is_none() && extra.is_empty() {
                session = Some(value.to_string());
            } else {
                extra.push((key.to_string(), value.to_string()));
            }
        }
        Some(Self {
            subject: caps["sub"].to_string(),
            session,
            extra,
            datatype: None,
            suffix: caps["suffix"].to_string(),
            extension: caps["ext"].to_string(),
        })
    }

    /// Parse a path relative to the dataset root.
    ///
    /// Returns `None` when the file name is not a BIDS name or when the
    /// `sub-`/`ses-` directories disagree with the file name.
    pub fn parse_relative_path(rel: &Path) -> Option<Self> {
        let parts: Vec<&str> = rel
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Option<_>>()?;
        let (file_name, dirs) = parts.split_last()?;
        let mut entities = Self::parse_file_name(file_name)?;

        let mut dirs = dirs.iter();
        if dirs.next()?.strip_prefix("sub-")? != entities.subject {
            return None;
        }
        let mut rest: Vec<&str> = dirs.copied().collect();
        let session_dir = match rest.first().and_then(|d| d.strip_prefix("ses-")) {
            Some(ses) => {
                let ses = ses.to_string();
                rest.remove(0);
                Some(ses)
            }
            None => None,
        };
        if session_dir != entities.session {
            return None;
        }
        match rest.as_slice() {
            [] => {}
            [datatype] => entities.datatype = Some((*datatype).to_string()),
            _ => return None,
        }
        Some(entities)
    }

    /// Format the file name. Exact inverse of [`Entities::parse_file_name`].
    pub fn file_name(&self) -> String {
        format!("{}{}", self.stem(), self.extension)
    }

    /// File name without the extension.
    pub fn stem(&self) -> String {
        let mut name = format!("sub-{}", self.subject);
        if let Some(ses) = &self.session {
            name.push_str("_ses-");
            name.push_str(ses);
        }
        for (key, value) in &self.extra {
            name.push('_');
            name.push_str(key);
            name.push('-');
            name.push_str(value);
        }
        name.push('_');
        name.push_str(&self.suffix);
        name
    }

    /// Directory of the file relative to a dataset-like root.
    pub fn relative_dir(&self) -> PathBuf {
        let mut dir = self.subject_session_dir();
        if let Some(datatype) = &self.datatype {
            dir.push(datatype);
        }
        dir
    }

    /// `sub-<label>[/ses-<label>]`.
    pub fn subject_session_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(format!("sub-{}", self.subject));
        if let Some(ses) = &self.session {
            dir.push(format!("ses-{ses}"));
        }
        dir
    }

    /// Canonical path relative to a dataset-like root.
    pub fn relative_path(&self) -> PathBuf {
        self.relative_dir().join(self.file_name())
    }

    /// Same entities with a different suffix.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            suffix: suffix.to_string(),
            ..self.clone()
        }
    }

    pub fn kind(&self) -> FileKind {
        match self.extension.as_str() {
            ".nii" | ".nii.gz" => FileKind::Image,
            ".json" => FileKind::Sidecar,
            _ => FileKind::Other,
        }
    }

    pub fn modality(&self) -> Option<Modality> {
        match self.suffix.as_str() {
            "T1w" => Some(Modality::T1w),
            "T2w" => Some(Modality::T2w),
            _ => None,
        }
    }
}

/// Strip an optional `sub-` prefix from a participant label.
pub fn normalize_label(label: &str) -> &str {
    label.strip_prefix("sub-").unwrap_or(label)
}
