//! Quality-control images.
//!
//! For every defaced image the pipeline writes two files into the subject's
//! `images/` directory in the quarantine:
//!
//! - `<stem>.png`: the brain mask overlaid in red on the defaced image,
//!   three rows of 12 slices (sagittal, coronal, axial).
//! - `<stem>.gif`: an animated run through the axial slices of the defaced
//!   image.
//!
//! Rendering is native (`nifti` + `ndarray` + `image`) and runs on a
//! blocking task.

mod render;

pub use render::{bounding_box, cut_positions, overlay_mosaic, preview_frames, window_max, Plane};

use crate::config::ReportConfig;
use crate::quarantine::atomic::atomic_write;
use crate::volume::Volume;
use crate::{BidsonymError, Result};
use async_trait::async_trait;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, ImageFormat};
use serde::Serialize;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::info;

/// Paths of the QC images written for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QcImages {
    pub overlay: PathBuf,
    pub preview: PathBuf,
}

/// Produces QC images for a defaced image and its brain mask.
#[async_trait]
pub trait QcReporter: Send + Sync {
    /// Write `<stem>.png` and `<stem>.gif` into `out_dir`.
    async fn report(&self, defaced: &Path, mask: &Path, out_dir: &Path, stem: &str) -> Result<QcImages>;
}

/// Renders QC images in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeReporter;

#[async_trait]
impl QcReporter for NativeReporter {
    async fn report(&self, defaced: &Path, mask: &Path, out_dir: &Path, stem: &str) -> Result<QcImages> {
        let defaced = defaced.to_path_buf();
        let mask = mask.to_path_buf();
        let images = QcImages {
            overlay: out_dir.join(format!("{stem}.png")),
            preview: out_dir.join(format!("{stem}.gif")),
        };
        let targets = images.clone();

        tokio::task::spawn_blocking(move || render_to_files(&defaced, &mask, &targets))
            .await
            .map_err(|e| BidsonymError::Other(format!("Report task failed: {e}")))??;

        info!("Wrote QC images {}", images.overlay.display());
        Ok(images)
    }
}

fn render_to_files(defaced: &Path, mask_path: &Path, targets: &QcImages) -> Result<()> {
    let image = Volume::load(defaced)?.first_volume()?;
    let mask = Volume::load(mask_path)?.first_volume()?;
    if mask.dim() != image.dim() {
        return Err(BidsonymError::Report {
            message: format!(
                "brain mask {} has shape {:?}, defaced image has {:?}",
                mask_path.display(),
                mask.dim(),
                image.dim()
            ),
        });
    }

    let overlay = overlay_mosaic(&image, Some(&mask), ReportConfig::CUTS_PER_PLANE);
    let mut png = Vec::new();
    DynamicImage::ImageRgb8(overlay).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    atomic_write(&targets.overlay, &png)?;

    let frames = preview_frames(&image, ReportConfig::PREVIEW_MAX_FRAMES);
    let mut gif = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut gif);
        encoder.set_repeat(Repeat::Infinite)?;
        let delay = Delay::from_numer_denom_ms(ReportConfig::PREVIEW_FRAME_DELAY_MS, 1);
        encoder.encode_frames(
            frames
                .into_iter()
                .map(|frame| Frame::from_parts(frame, 0, 0, delay)),
        )?;
    }
    atomic_write(&targets.preview, &gif)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use nifti::writer::WriterOptions;
    use tempfile::TempDir;

    fn write_cube(path: &Path, shape: (usize, usize, usize)) {
        let data = Array3::from_shape_fn(shape, |(x, y, z)| (x + y + z) as f32).into_dyn();
        WriterOptions::new(path).write_nifti(&data).unwrap();
    }

    #[tokio::test]
    async fn test_native_reporter_writes_png_and_gif() {
        let dir = TempDir::new().unwrap();
        let defaced = dir.path().join("sub-01_T1w.nii.gz");
        let mask = dir.path().join("sub-01_T1w_brainmask.nii.gz");
        write_cube(&defaced, (6, 7, 8));
        write_cube(&mask, (6, 7, 8));
        let out_dir = dir.path().join("images");

        let images = NativeReporter
            .report(&defaced, &mask, &out_dir, "sub-01_T1w")
            .await
            .unwrap();

        assert_eq!(images.overlay, out_dir.join("sub-01_T1w.png"));
        let png = image::open(&images.overlay).unwrap();
        assert_eq!(png.height(), 8 + 8 + 7);
        let gif = std::fs::read(&images.preview).unwrap();
        assert_eq!(&gif[..3], b"GIF");
    }

    #[tokio::test]
    async fn test_mask_shape_mismatch_is_report_error() {
        let dir = TempDir::new().unwrap();
        let defaced = dir.path().join("d.nii.gz");
        let mask = dir.path().join("m.nii.gz");
        write_cube(&defaced, (4, 4, 4));
        write_cube(&mask, (4, 4, 5));

        let err = NativeReporter
            .report(&defaced, &mask, dir.path(), "d")
            .await
            .unwrap_err();
        assert!(matches!(err, BidsonymError::Report { .. }));
    }
}
