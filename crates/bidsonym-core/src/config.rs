//! Centralized configuration for BIDSonym.
//!
//! Constants for dataset layout, tool invocation and QC rendering, plus the
//! `ToolPaths` table that locates the external executables and their model
//! files.

use crate::{BidsonymError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Dataset layout constants.
pub struct PathsConfig;

impl PathsConfig {
    /// Quarantine subtree, relative to the dataset root.
    pub const QUARANTINE_REL: &'static str = "sourcedata/bidsonym";
    /// Per-subject directory for QC images inside the quarantine.
    pub const IMAGES_DIR_NAME: &'static str = "images";
    /// Per-subject directory for metadata reports inside the quarantine.
    pub const META_INFO_DIR_NAME: &'static str = "meta_data_info";
    pub const RUN_SUMMARY_FILENAME: &'static str = "run_summary.json";
    pub const DATASET_DESCRIPTION: &'static str = "dataset_description.json";
    pub const BRAINMASK_SUFFIX: &'static str = "_brainmask.nii.gz";
    pub const DEEPDEFACER_MASK_SUFFIX: &'static str = "_space-native_defacemask-deepdefacer.nii.gz";
}

/// External tool invocation settings.
pub struct ToolConfig;

impl ToolConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
    pub const QUICKSHEAR_BUFFER: u32 = 50;
    pub const QUICKSHEAR_BET_FRAC: f64 = 0.5;
    /// Number of stderr lines kept for error messages.
    pub const STDERR_TAIL_LINES: usize = 20;
}

/// Metadata redaction settings.
pub struct RedactionConfig;

impl RedactionConfig {
    pub const SENTINEL: &'static str = "deleted_by_bidsonym";

    /// Sidecar fields that commonly carry identifying information.
    pub const DEFAULT_RISK_KEYWORDS: &'static [&'static str] = &[
        "InstitutionName",
        "InstitutionAddress",
        "InstitutionalDepartmentName",
        "DeviceSerialNumber",
        "StationName",
        "AcquisitionDateTime",
        "AcquisitionDate",
        "SeriesDate",
        "StudyDate",
        "PatientName",
        "PatientID",
        "PatientBirthDate",
        "PatientSex",
        "PatientAge",
        "PatientWeight",
        "ReferringPhysicianName",
        "OperatorsName",
    ];
}

/// QC rendering settings.
pub struct ReportConfig;

impl ReportConfig {
    pub const CUTS_PER_PLANE: usize = 12;
    /// Intensity percentile mapped to white in the background image.
    pub const WINDOW_PERCENTILE: f32 = 0.99;
    pub const MASK_ALPHA: f32 = 0.45;
    pub const PREVIEW_MAX_FRAMES: usize = 48;
    pub const PREVIEW_FRAME_DELAY_MS: u32 = 80;
}

/// Locations of the external executables and the model/atlas files they need.
///
/// Defaults assume the executables are on `PATH` and the auxiliary files live
/// where the BIDSonym container image installs them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub bet: PathBuf,
    pub nobrainer: PathBuf,
    pub nobrainer_model: PathBuf,
    pub pydeface: PathBuf,
    pub mri_deface: PathBuf,
    pub mri_deface_talairach_gca: PathBuf,
    pub mri_deface_face_gca: PathBuf,
    pub quickshear: PathBuf,
    pub mridefacer: PathBuf,
    pub deepdefacer: PathBuf,
    pub flirt: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            bet: "bet".into(),
            nobrainer: "nobrainer".into(),
            nobrainer_model: "/opt/nobrainer/models/trained-models/neuronets/brainy/0.1.0/weights/brain-extraction-unet-128iso-model.h5".into(),
            pydeface: "pydeface".into(),
            mri_deface: "mri_deface".into(),
            mri_deface_talairach_gca: "/opt/freesurfer/fs_data/talairach_mixed_with_skull.gca".into(),
            mri_deface_face_gca: "/opt/freesurfer/fs_data/face.gca".into(),
            quickshear: "quickshear".into(),
            mridefacer: "/mridefacer/mridefacer".into(),
            deepdefacer: "deepdefacer".into(),
            flirt: "flirt".into(),
        }
    }
}

impl ToolPaths {
    /// Load tool paths from a JSON file. Fields not present keep their default.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| BidsonymError::io("reading tool config", path, e))?;
        serde_json::from_str(&contents).map_err(|e| BidsonymError::Config {
            message: format!("invalid tool config {}: {e}", path.display()),
        })
    }
}
