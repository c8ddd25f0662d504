//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bidsonym_core::cancel::CancellationToken;
use bidsonym_core::tools::{ToolInvocation, ToolRunner};
use bidsonym_core::{Result, ToolFailureKind};
use ndarray::Array3;
use nifti::writer::WriterOptions;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

/// Stands in for the external tools.
///
/// Every declared output is materialised by copying the first argument that
/// names an existing file. Invocations matching a scripted failure exit
/// with status 1 instead.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<ToolInvocation>>,
    failures: Vec<(String, String)>,
}

impl FakeRunner {
    /// Fail invocations of `tool` whose image path contains `image_part`.
    pub fn failing(tool: &str, image_part: &str) -> Self {
        Self {
            failures: vec![(tool.to_string(), image_part.to_string())],
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// `(tool, image file name)` for every call, in order.
    pub fn call_log(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .map(|c| {
                let name = c
                    .image
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (c.tool, name)
            })
            .collect()
    }
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        self.calls.lock().unwrap().push(invocation.clone());

        let image = invocation.image.to_string_lossy();
        if self
            .failures
            .iter()
            .any(|(tool, part)| *tool == invocation.tool && image.contains(part.as_str()))
        {
            return Err(invocation.failure(ToolFailureKind::ExitStatus {
                code: Some(1),
                stderr_tail: "scripted failure".into(),
            }));
        }

        let source = invocation
            .args
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file())
            .expect("fake tool needs an input file");
        for out in &invocation.produces {
            fs::create_dir_all(out.parent().unwrap()).unwrap();
            fs::copy(&source, out).unwrap();
        }
        invocation.verify_outputs()
    }
}

/// Write a small float volume with a bright block in the middle.
pub fn write_volume(path: &Path, scale: f32) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let data = Array3::from_shape_fn((6, 6, 6), |(x, y, z)| {
        if (1..5).contains(&x) && (1..5).contains(&y) && (1..5).contains(&z) {
            scale * (1 + x + y + z) as f32
        } else {
            0.0
        }
    })
    .into_dyn();
    WriterOptions::new(path).write_nifti(&data).unwrap();
}

/// Dataset with sub-01 (T1w + sidecar + T2w) and sub-02 (T1w only).
pub fn create_dataset() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::write(
        root.join("dataset_description.json"),
        r#"{"Name": "test", "BIDSVersion": "1.8.0"}"#,
    )
    .unwrap();

    write_volume(&root.join("sub-01/anat/sub-01_T1w.nii.gz"), 1.0);
    fs::write(
        root.join("sub-01/anat/sub-01_T1w.json"),
        r#"{"InstitutionName": "X", "Other": "Y"}"#,
    )
    .unwrap();
    write_volume(&root.join("sub-01/anat/sub-01_T2w.nii.gz"), 2.0);

    write_volume(&root.join("sub-02/anat/sub-02_T1w.nii.gz"), 3.0);
    dir
}

pub fn quarantine_path(root: &Path, rel: &str) -> PathBuf {
    root.join("sourcedata/bidsonym").join(rel)
}
