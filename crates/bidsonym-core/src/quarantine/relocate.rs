//! Moving originals into the quarantine subtree.
//!
//! The quarantine mirrors the dataset layout under `sourcedata/bidsonym`.
//! A quarantine file is written exactly once: if it already exists the
//! dataset has most likely been processed before, and relocating again would
//! destroy the only unmodified copy of the original.

use crate::config::PathsConfig;
use crate::dataset::{BidsFile, Entities};
use crate::{BidsonymError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Record of one relocated original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantinedFile {
    /// Canonical path the file was moved away from.
    pub original: PathBuf,
    pub quarantined: PathBuf,
    /// SHA-256 of the original bytes.
    pub sha256: String,
}

/// The quarantine subtree of one dataset.
#[derive(Debug, Clone)]
pub struct Quarantine {
    root: PathBuf,
}

impl Quarantine {
    pub fn for_dataset(dataset_root: &Path) -> Self {
        Self {
            root: dataset_root.join(PathsConfig::QUARANTINE_REL),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Quarantine location of a file with these entities.
    pub fn path_for(&self, entities: &Entities) -> PathBuf {
        self.root.join(entities.relative_path())
    }

    /// Where the brain mask derived from this image is written.
    pub fn brainmask_path(&self, entities: &Entities) -> PathBuf {
        self.root
            .join(entities.relative_dir())
            .join(format!("{}{}", entities.stem(), PathsConfig::BRAINMASK_SUFFIX))
    }

    /// QC image directory for the subject/session of `entities`.
    pub fn images_dir(&self, entities: &Entities) -> PathBuf {
        self.root
            .join(entities.subject_session_dir())
            .join(PathsConfig::IMAGES_DIR_NAME)
    }

    /// Metadata report directory for a subject.
    pub fn meta_info_dir(&self, subject: &str) -> PathBuf {
        self.root
            .join(format!("sub-{subject}"))
            .join(PathsConfig::META_INFO_DIR_NAME)
    }

    /// Fail with `AlreadyQuarantined` if the quarantine slot for `entities` is taken.
    pub fn ensure_vacant(&self, entities: &Entities) -> Result<PathBuf> {
        let target = self.path_for(entities);
        if target.exists() {
            return Err(BidsonymError::AlreadyQuarantined { path: target });
        }
        Ok(target)
    }

    /// Move `file` from its canonical path into the quarantine.
    ///
    /// Never overwrites an existing quarantine file. On the same filesystem the
    /// move is a hard link followed by an unlink, which fails atomically if the
    /// target appeared in the meantime; across filesystems the bytes are copied
    /// into a freshly created file and verified before the source is removed.
    pub fn relocate(&self, file: &BidsFile) -> Result<QuarantinedFile> {
        let target = self.ensure_vacant(&file.entities)?;
        if !file.path.is_file() {
            return Err(BidsonymError::FileNotFound(file.path.clone()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BidsonymError::io("creating quarantine directory", parent, e))?;
        }

        let sha256 = sha256_file(&file.path)?;

        match fs::hard_link(&file.path, &target) {
            Ok(()) => {
                fs::remove_file(&file.path)
                    .map_err(|e| BidsonymError::io("removing relocated original", &file.path, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(BidsonymError::AlreadyQuarantined { path: target });
            }
            Err(e) => {
                debug!("Hard link into quarantine failed ({e}), copying instead");
                copy_no_clobber(&file.path, &target)?;
                let copied = sha256_file(&target)?;
                if copied != sha256 {
                    warn!("Quarantine copy of {} is corrupt, keeping original", file.path.display());
                    fs::remove_file(&target).ok();
                    return Err(BidsonymError::Other(format!(
                        "checksum mismatch copying {} to {}",
                        file.path.display(),
                        target.display()
                    )));
                }
                fs::remove_file(&file.path)
                    .map_err(|e| BidsonymError::io("removing relocated original", &file.path, e))?;
            }
        }

        info!("Moved {} to {}", file.relpath().display(), target.display());
        Ok(QuarantinedFile {
            original: file.path.clone(),
            quarantined: target,
            sha256,
        })
    }

    /// Put a relocated original back at its canonical path.
    ///
    /// Used when processing fails after relocation. Whatever a failed tool
    /// left at the canonical path is discarded.
    pub fn restore(&self, record: &QuarantinedFile) -> Result<()> {
        if record.original.exists() {
            fs::remove_file(&record.original)
                .map_err(|e| BidsonymError::io("removing partial output", &record.original, e))?;
        }
        if fs::rename(&record.quarantined, &record.original).is_err() {
            copy_no_clobber(&record.quarantined, &record.original)?;
            fs::remove_file(&record.quarantined)
                .map_err(|e| BidsonymError::io("removing quarantine copy", &record.quarantined, e))?;
        }
        warn!("Restored {} from quarantine", record.original.display());
        Ok(())
    }
}

fn copy_no_clobber(src: &Path, dst: &Path) -> Result<()> {
    let mut input = File::open(src).map_err(|e| BidsonymError::io_with_path(e, src))?;
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => BidsonymError::AlreadyQuarantined {
                path: dst.to_path_buf(),
            },
            _ => BidsonymError::io("creating quarantine file", dst, e),
        })?;
    io::copy(&mut input, &mut output).map_err(|e| BidsonymError::io("copying into quarantine", dst, e))?;
    output
        .sync_all()
        .map_err(|e| BidsonymError::io("syncing quarantine file", dst, e))?;
    Ok(())
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| BidsonymError::io_with_path(e, path))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| BidsonymError::io_with_path(e, path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn bids_file(root: &Path, rel: &str, contents: &[u8]) -> BidsFile {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        BidsFile {
            path,
            entities: Entities::parse_relative_path(Path::new(rel)).unwrap(),
        }
    }

    #[test]
    fn test_relocate_moves_bytes_unmodified() {
        let dir = TempDir::new().unwrap();
        let file = bids_file(dir.path(), "sub-01/anat/sub-01_T1w.nii.gz", b"original bytes");
        let quarantine = Quarantine::for_dataset(dir.path());

        let record = quarantine.relocate(&file).unwrap();

        assert!(!file.path.exists());
        assert_eq!(
            record.quarantined,
            dir.path().join("sourcedata/bidsonym/sub-01/anat/sub-01_T1w.nii.gz")
        );
        assert_eq!(fs::read(&record.quarantined).unwrap(), b"original bytes");
        assert_eq!(record.sha256, sha256_file(&record.quarantined).unwrap());
    }

    #[test]
    fn test_relocate_twice_refuses_to_clobber() {
        let dir = TempDir::new().unwrap();
        let file = bids_file(dir.path(), "sub-01/anat/sub-01_T1w.nii.gz", b"first");
        let quarantine = Quarantine::for_dataset(dir.path());
        quarantine.relocate(&file).unwrap();

        // A defaced file now occupies the canonical path.
        fs::write(&file.path, b"defaced").unwrap();
        let err = quarantine.relocate(&file).unwrap_err();

        assert!(matches!(err, BidsonymError::AlreadyQuarantined { .. }));
        assert_eq!(fs::read(quarantine.path_for(&file.entities)).unwrap(), b"first");
        assert_eq!(fs::read(&file.path).unwrap(), b"defaced");
    }

    #[test]
    fn test_restore_undoes_relocation() {
        let dir = TempDir::new().unwrap();
        let file = bids_file(dir.path(), "sub-01/anat/sub-01_T1w.nii.gz", b"original");
        let quarantine = Quarantine::for_dataset(dir.path());
        let record = quarantine.relocate(&file).unwrap();
        fs::write(&file.path, b"half-written").unwrap();

        quarantine.restore(&record).unwrap();

        assert_eq!(fs::read(&file.path).unwrap(), b"original");
        assert!(!record.quarantined.exists());
        assert!(quarantine.ensure_vacant(&file.entities).is_ok());
    }

    #[test]
    fn test_relocate_missing_source() {
        let dir = TempDir::new().unwrap();
        let file = bids_file(dir.path(), "sub-01/anat/sub-01_T1w.nii.gz", b"x");
        fs::remove_file(&file.path).unwrap();
        let quarantine = Quarantine::for_dataset(dir.path());
        assert!(matches!(
            quarantine.relocate(&file),
            Err(BidsonymError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_derived_paths() {
        let dir = TempDir::new().unwrap();
        let quarantine = Quarantine::for_dataset(dir.path());
        let entities =
            Entities::parse_relative_path(Path::new("sub-01/ses-a/anat/sub-01_ses-a_T1w.nii.gz")).unwrap();
        assert_eq!(
            quarantine.brainmask_path(&entities),
            dir.path()
                .join("sourcedata/bidsonym/sub-01/ses-a/anat/sub-01_ses-a_T1w_brainmask.nii.gz")
        );
        assert_eq!(
            quarantine.images_dir(&entities),
            dir.path().join("sourcedata/bidsonym/sub-01/ses-a/images")
        );
        assert_eq!(
            quarantine.meta_info_dir("01"),
            dir.path().join("sourcedata/bidsonym/sub-01/meta_data_info")
        );
    }
}
