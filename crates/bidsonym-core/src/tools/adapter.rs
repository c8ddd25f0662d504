//! Typed entry points for brain extraction, defacing and mask propagation.
//!
//! Each method maps to a fixed argument template. The adapter only builds
//! [`ToolInvocation`]s and post-processes results; execution is delegated to
//! the configured [`ToolRunner`].

use super::methods::{BrainExtractionMethod, DeidMethod};
use super::runner::{parent_dir, ToolInvocation, ToolRunner};
use crate::cancel::CancellationToken;
use crate::config::{PathsConfig, ToolConfig, ToolPaths};
use crate::volume::{apply_binary_mask, Volume};
use crate::{BidsonymError, Result, ToolFailureKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Invokes the external imaging tools for one run.
#[derive(Clone)]
pub struct ToolAdapter {
    runner: Arc<dyn ToolRunner>,
    paths: ToolPaths,
    timeout: Duration,
}

impl std::fmt::Debug for ToolAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolAdapter")
            .field("paths", &self.paths)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ToolAdapter {
    pub fn new(runner: Arc<dyn ToolRunner>, paths: ToolPaths) -> Self {
        Self {
            runner,
            paths,
            timeout: ToolConfig::DEFAULT_TIMEOUT,
        }
    }

    /// Set the time budget applied to every invocation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn invocation(&self, tool: &str, program: &Path, image: &Path) -> ToolInvocation {
        ToolInvocation::new(tool, program, image).timeout(self.timeout)
    }

    /// Produce a brain mask for `image` at `out`.
    ///
    /// `frac` is the BET fractional intensity threshold; it must be given
    /// and lie in `(0, 1]` when `method` is [`BrainExtractionMethod::Bet`].
    pub async fn extract_brain(
        &self,
        image: &Path,
        method: BrainExtractionMethod,
        frac: Option<f64>,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let invocation = match method {
            BrainExtractionMethod::Bet => {
                let frac = validate_frac(frac)?;
                self.invocation(method.as_str(), &self.paths.bet, image)
                    .arg(image)
                    .arg(out)
                    .arg("-f")
                    .arg(frac.to_string())
                    .env("FSLOUTPUTTYPE", "NIFTI_GZ")
            }
            BrainExtractionMethod::Nobrainer => self
                .invocation(method.as_str(), &self.paths.nobrainer, image)
                .arg("predict")
                .arg(format!("--model={}", self.paths.nobrainer_model.display()))
                .arg("--verbose")
                .arg(image)
                .arg(out),
        }
        .produces(out);

        info!("Extracting brain from {} with {}", image.display(), method);
        self.runner.run(&invocation, cancel).await?;
        Ok(out.to_path_buf())
    }

    /// Deface `image` with `method`, writing the result to `out`.
    pub async fn deface(
        &self,
        image: &Path,
        method: DeidMethod,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        info!("Defacing {} with {}", image.display(), method);
        let tool = method.as_str();
        match method {
            DeidMethod::Pydeface => {
                let inv = self
                    .invocation(tool, &self.paths.pydeface, image)
                    .arg(image)
                    .arg("--out")
                    .arg(out)
                    .arg("--force")
                    .produces(out);
                self.runner.run(&inv, cancel).await?;
            }
            DeidMethod::MriDeface => {
                let inv = self
                    .invocation(tool, &self.paths.mri_deface, image)
                    .arg(image)
                    .arg(&self.paths.mri_deface_talairach_gca)
                    .arg(&self.paths.mri_deface_face_gca)
                    .arg(out)
                    .produces(out);
                self.runner.run(&inv, cancel).await?;
            }
            DeidMethod::Quickshear => {
                let scratch = scratch_dir()?;
                let brain = scratch.path().join("brain");
                let mask = scratch.path().join("brain_mask.nii.gz");
                let bet = self
                    .invocation("bet", &self.paths.bet, image)
                    .arg(image)
                    .arg(&brain)
                    .arg("-m")
                    .arg("-f")
                    .arg(ToolConfig::QUICKSHEAR_BET_FRAC.to_string())
                    .env("FSLOUTPUTTYPE", "NIFTI_GZ")
                    .produces(&mask);
                self.runner.run(&bet, cancel).await?;

                let inv = self
                    .invocation(tool, &self.paths.quickshear, image)
                    .arg(image)
                    .arg(&mask)
                    .arg(out)
                    .arg(ToolConfig::QUICKSHEAR_BUFFER.to_string())
                    .produces(out);
                self.runner.run(&inv, cancel).await?;
            }
            DeidMethod::Mridefacer => {
                let outdir = parent_dir(out);
                let file_name = image.file_name().ok_or_else(|| {
                    BidsonymError::Other(format!("{} has no file name", image.display()))
                })?;
                let produced = outdir.join(file_name);
                let inv = self
                    .invocation(tool, &self.paths.mridefacer, image)
                    .arg("--apply")
                    .arg(image)
                    .arg("--outdir")
                    .arg(&outdir)
                    .produces(&produced);
                self.runner.run(&inv, cancel).await?;
                if produced != out {
                    debug!("Moving {} to {}", produced.display(), out.display());
                    std::fs::rename(&produced, out).map_err(|e| {
                        inv.failure(ToolFailureKind::Postprocess(format!(
                            "moving {} to {}: {e}",
                            produced.display(),
                            out.display()
                        )))
                    })?;
                }
            }
            DeidMethod::Deepdefacer => {
                let mask = deepdefacer_mask_path(image);
                let inv = self
                    .invocation(tool, &self.paths.deepdefacer, image)
                    .arg("--input_file")
                    .arg(image)
                    .arg("--defaced_output_path")
                    .arg(out)
                    .arg("--mask_output_path")
                    .arg(&mask)
                    .produces(out);
                self.runner.run(&inv, cancel).await?;
            }
        }
        Ok(out.to_path_buf())
    }

    /// Deface `target` using the footprint of an already defaced image of
    /// another modality.
    ///
    /// `reference_defaced` is aligned onto `target` with FLIRT, the aligned
    /// volume is binarized (`> 0`) and multiplied into the target's voxels.
    /// The result keeps the target's geometry and header.
    pub async fn propagate_mask(
        &self,
        reference_defaced: &Path,
        target: &Path,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let scratch = scratch_dir()?;
        let warped = scratch.path().join("warped.nii.gz");
        let flirt = self
            .invocation("flirt", &self.paths.flirt, target)
            .arg("-in")
            .arg(reference_defaced)
            .arg("-ref")
            .arg(target)
            .arg("-out")
            .arg(&warped)
            .arg("-cost")
            .arg("mutualinfo")
            .env("FSLOUTPUTTYPE", "NIFTI_GZ")
            .produces(&warped);

        info!(
            "Aligning {} onto {}",
            reference_defaced.display(),
            target.display()
        );
        self.runner.run(&flirt, cancel).await?;
        cancel.check()?;

        let target = target.to_path_buf();
        let destination = out.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mask = Volume::load(&warped)?;
            let image = Volume::load(&target)?;
            let data = apply_binary_mask(&image.data, &mask.data)?;
            Volume {
                header: image.header,
                data,
            }
            .save(&destination)?;
            // Keep the scratch directory alive until the mask has been read.
            drop(scratch);
            Ok(())
        })
        .await
        .map_err(|e| BidsonymError::Other(format!("Mask propagation task failed: {e}")))??;

        Ok(out.to_path_buf())
    }
}

fn validate_frac(frac: Option<f64>) -> Result<f64> {
    match frac {
        None => Err(BidsonymError::config(
            "brain extraction with bet requires a fractional intensity threshold (--bet-frac)",
        )),
        Some(f) if f > 0.0 && f <= 1.0 => Ok(f),
        Some(f) => Err(BidsonymError::config(format!(
            "--bet-frac must be in (0, 1], got {f}"
        ))),
    }
}

fn scratch_dir() -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("bidsonym-")
        .tempdir()
        .map_err(|e| BidsonymError::io("creating scratch directory", std::env::temp_dir(), e))
}

/// `<image without .nii[.gz]>_space-native_defacemask-deepdefacer.nii.gz`
fn deepdefacer_mask_path(image: &Path) -> PathBuf {
    let name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    parent_dir(image).join(format!("{stem}{}", PathsConfig::DEEPDEFACER_MASK_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ndarray::{Array, IxDyn};
    use nifti::writer::WriterOptions;
    use std::ffi::OsString;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records invocations and materialises declared outputs by copying the
    /// first existing file argument.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<ToolInvocation>>,
    }

    impl RecordingRunner {
        fn calls(&self) -> Vec<ToolInvocation> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolRunner for RecordingRunner {
        async fn run(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> Result<()> {
            cancel.check()?;
            let source = invocation
                .args
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file());
            for out in &invocation.produces {
                match &source {
                    Some(src) => {
                        std::fs::copy(src, out).unwrap();
                    }
                    None => std::fs::write(out, b"fake").unwrap(),
                }
            }
            self.calls.lock().unwrap().push(invocation.clone());
            Ok(())
        }
    }

    fn adapter(runner: Arc<RecordingRunner>) -> ToolAdapter {
        ToolAdapter::new(runner, ToolPaths::default()).with_timeout(Duration::from_secs(5))
    }

    fn args(inv: &ToolInvocation) -> Vec<String> {
        inv.args
            .iter()
            .map(|a: &OsString| a.to_string_lossy().into_owned())
            .collect()
    }

    fn write_volume(path: &Path, shape: &[usize], values: Vec<f32>) {
        let data = Array::from_shape_vec(IxDyn(shape), values).unwrap();
        WriterOptions::new(path).write_nifti(&data).unwrap();
    }

    #[tokio::test]
    async fn test_bet_template() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("sub-01_T1w.nii.gz");
        let mask = dir.path().join("sub-01_T1w_brainmask.nii.gz");
        std::fs::write(&image, b"t1").unwrap();
        let runner = Arc::new(RecordingRunner::default());

        adapter(runner.clone())
            .extract_brain(&image, BrainExtractionMethod::Bet, Some(0.5), &mask, &CancellationToken::new())
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            args(&calls[0]),
            vec![
                image.display().to_string(),
                mask.display().to_string(),
                "-f".into(),
                "0.5".into()
            ]
        );
        assert_eq!(calls[0].produces, vec![mask]);
        assert_eq!(calls[0].timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_bet_without_frac_is_config_error() {
        let runner = Arc::new(RecordingRunner::default());
        let err = adapter(runner.clone())
            .extract_brain(
                Path::new("in.nii.gz"),
                BrainExtractionMethod::Bet,
                None,
                Path::new("out.nii.gz"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BidsonymError::Config { .. }));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_frac_bounds() {
        assert!(validate_frac(Some(1.0)).is_ok());
        assert!(validate_frac(Some(0.0)).is_err());
        assert!(validate_frac(Some(1.5)).is_err());
    }

    #[tokio::test]
    async fn test_nobrainer_template() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("in.nii.gz");
        let out = dir.path().join("mask.nii.gz");
        std::fs::write(&image, b"t1").unwrap();
        let runner = Arc::new(RecordingRunner::default());

        adapter(runner.clone())
            .extract_brain(&image, BrainExtractionMethod::Nobrainer, None, &out, &CancellationToken::new())
            .await
            .unwrap();

        let a = args(&runner.calls()[0]);
        assert_eq!(a[0], "predict");
        assert!(a[1].starts_with("--model="));
        assert_eq!(a[2], "--verbose");
    }

    #[tokio::test]
    async fn test_quickshear_runs_bet_then_quickshear() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("orig.nii.gz");
        let out = dir.path().join("defaced.nii.gz");
        std::fs::write(&image, b"t1").unwrap();
        let runner = Arc::new(RecordingRunner::default());

        adapter(runner.clone())
            .deface(&image, DeidMethod::Quickshear, &out, &CancellationToken::new())
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool, "bet");
        let bet_args = args(&calls[0]);
        assert_eq!(&bet_args[2..], &["-m", "-f", "0.5"]);
        assert_eq!(calls[1].tool, "quickshear");
        let qs_args = args(&calls[1]);
        assert!(qs_args[1].ends_with("brain_mask.nii.gz"));
        assert_eq!(qs_args[2], out.display().to_string());
        assert_eq!(qs_args[3], "50");
        assert!(out.exists());
    }

    #[tokio::test]
    async fn test_mridefacer_output_lands_at_requested_path() {
        let dir = TempDir::new().unwrap();
        let quarantine = dir.path().join("quarantine");
        let canonical = dir.path().join("anat");
        std::fs::create_dir_all(&quarantine).unwrap();
        std::fs::create_dir_all(&canonical).unwrap();
        let image = quarantine.join("sub-01_T1w.nii.gz");
        let out = canonical.join("sub-01_T1w.nii.gz");
        std::fs::write(&image, b"t1").unwrap();
        let runner = Arc::new(RecordingRunner::default());

        adapter(runner.clone())
            .deface(&image, DeidMethod::Mridefacer, &out, &CancellationToken::new())
            .await
            .unwrap();

        let a = args(&runner.calls()[0]);
        assert_eq!(a[0], "--apply");
        assert_eq!(a[3], canonical.display().to_string());
        assert_eq!(std::fs::read(&out).unwrap(), b"t1");
    }

    #[tokio::test]
    async fn test_pydeface_template() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("orig.nii.gz");
        let out = dir.path().join("defaced.nii.gz");
        std::fs::write(&image, b"t1").unwrap();
        let runner = Arc::new(RecordingRunner::default());

        adapter(runner.clone())
            .deface(&image, DeidMethod::Pydeface, &out, &CancellationToken::new())
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].tool, "pydeface");
        assert_eq!(calls[0].program, PathBuf::from("pydeface"));
        assert_eq!(
            args(&calls[0]),
            vec![
                image.display().to_string(),
                "--out".into(),
                out.display().to_string(),
                "--force".into()
            ]
        );
        assert_eq!(calls[0].produces, vec![out]);
    }

    #[tokio::test]
    async fn test_mri_deface_template() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("orig.nii.gz");
        let out = dir.path().join("defaced.nii.gz");
        std::fs::write(&image, b"t1").unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let paths = ToolPaths::default();

        adapter(runner.clone())
            .deface(&image, DeidMethod::MriDeface, &out, &CancellationToken::new())
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].tool, "mri_deface");
        assert_eq!(
            args(&calls[0]),
            vec![
                image.display().to_string(),
                paths.mri_deface_talairach_gca.display().to_string(),
                paths.mri_deface_face_gca.display().to_string(),
                out.display().to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_deepdefacer_template() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("sub-01_T1w.nii.gz");
        let out = dir.path().join("defaced.nii.gz");
        std::fs::write(&image, b"t1").unwrap();
        let runner = Arc::new(RecordingRunner::default());

        adapter(runner.clone())
            .deface(&image, DeidMethod::Deepdefacer, &out, &CancellationToken::new())
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].tool, "deepdefacer");
        assert_eq!(
            args(&calls[0]),
            vec![
                "--input_file".to_string(),
                image.display().to_string(),
                "--defaced_output_path".into(),
                out.display().to_string(),
                "--mask_output_path".into(),
                dir.path()
                    .join("sub-01_T1w_space-native_defacemask-deepdefacer.nii.gz")
                    .display()
                    .to_string()
            ]
        );
        assert_eq!(calls[0].produces, vec![out]);
    }

    #[tokio::test]
    async fn test_mridefacer_move_failure_is_postprocess_error() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("quarantine/sub-01_T1w.nii.gz");
        std::fs::create_dir_all(image.parent().unwrap()).unwrap();
        std::fs::write(&image, b"t1").unwrap();
        // A non-empty directory cannot be replaced by the produced file.
        let out = dir.path().join("anat/defaced.nii.gz");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("blocker"), b"x").unwrap();
        let runner = Arc::new(RecordingRunner::default());

        let err = adapter(runner)
            .deface(&image, DeidMethod::Mridefacer, &out, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BidsonymError::ExternalTool {
                kind: ToolFailureKind::Postprocess(_),
                ..
            }
        ));
    }

    #[test]
    fn test_deepdefacer_mask_path() {
        assert_eq!(
            deepdefacer_mask_path(Path::new("/q/sub-01_T1w.nii.gz")),
            PathBuf::from("/q/sub-01_T1w_space-native_defacemask-deepdefacer.nii.gz")
        );
    }

    #[tokio::test]
    async fn test_propagate_mask_zeroes_outside_footprint() {
        let dir = TempDir::new().unwrap();
        let reference = dir.path().join("t1_defaced.nii.gz");
        let target = dir.path().join("t2.nii.gz");
        let out = dir.path().join("t2_defaced.nii.gz");
        write_volume(&reference, &[2, 2, 2], vec![0.0, 1.0, 2.0, 0.0, 5.0, 5.0, 0.0, 3.0]);
        write_volume(&target, &[2, 2, 2], vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0]);
        let runner = Arc::new(RecordingRunner::default());

        adapter(runner.clone())
            .propagate_mask(&reference, &target, &out, &CancellationToken::new())
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].tool, "flirt");
        let a = args(&calls[0]);
        assert_eq!(a[1], reference.display().to_string());
        assert_eq!(a[3], target.display().to_string());
        assert_eq!(&a[6..], &["-cost", "mutualinfo"]);

        let result = Volume::load(&out).unwrap();
        let expected = Volume::load(&target).unwrap().data;
        let mask = Volume::load(&reference).unwrap().data;
        for ((r, e), m) in result.data.iter().zip(expected.iter()).zip(mask.iter()) {
            if *m > 0.0 {
                assert_eq!(r, e);
            } else {
                assert_eq!(*r, 0.0);
            }
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_run() {
        let token = CancellationToken::new();
        token.cancel();
        let runner = Arc::new(RecordingRunner::default());
        let err = adapter(runner)
            .deface(Path::new("a.nii.gz"), DeidMethod::Pydeface, Path::new("b.nii.gz"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, BidsonymError::Cancelled));
    }
}
