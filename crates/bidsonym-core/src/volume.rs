//! NIfTI volume I/O and voxel-wise masking.
//!
//! Volumes are read into `f32` arrays with the header's intensity scaling
//! already applied. Axis order follows the file: `x, y, z[, t]`.

use crate::{BidsonymError, Result};
use ndarray::{Array3, ArrayD, Axis, Ix3, IxDyn, Zip};
use nifti::volume::ndarray::IntoNdArray;
use nifti::writer::WriterOptions;
use nifti::{NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

/// A loaded volume and the header it came with.
#[derive(Debug, Clone)]
pub struct Volume {
    pub header: NiftiHeader,
    pub data: ArrayD<f32>,
}

impl Volume {
    pub fn load(path: &Path) -> Result<Self> {
        let obj = ReaderOptions::new()
            .read_file(path)
            .map_err(|e| volume_error(path, e))?;
        let header = obj.header().clone();
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()
            .map_err(|e| volume_error(path, e))?;
        Ok(Self { header, data })
    }

    /// Write the volume using its header as reference geometry.
    ///
    /// Data is stored as `f32` with identity scaling, since loading already
    /// applied the original slope and intercept. A `.gz` extension selects
    /// compression.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut header = self.header.clone();
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&self.data)
            .map_err(|e| volume_error(path, e))
    }

    /// First 3-D volume (the only one for anatomical images).
    pub fn first_volume(&self) -> Result<Array3<f32>> {
        let squeezed = squeeze(self.data.clone());
        let spatial = match squeezed.ndim() {
            3 => squeezed,
            n if n > 3 => {
                let mut view = squeezed.view();
                while view.ndim() > 3 {
                    view = view.index_axis_move(Axis(3), 0);
                }
                view.to_owned()
            }
            n => {
                return Err(BidsonymError::Volume {
                    message: format!("expected at least 3 dimensions, got {n}"),
                })
            }
        };
        spatial
            .into_dimensionality::<Ix3>()
            .map_err(|e| BidsonymError::Volume {
                message: e.to_string(),
            })
    }
}

fn volume_error(path: &Path, err: impl std::fmt::Display) -> BidsonymError {
    BidsonymError::Volume {
        message: format!("{}: {err}", path.display()),
    }
}

/// Drop trailing length-1 axes beyond the third.
pub fn squeeze(mut array: ArrayD<f32>) -> ArrayD<f32> {
    while array.ndim() > 3 && array.shape()[array.ndim() - 1] == 1 {
        let last = array.ndim() - 1;
        array = array.index_axis_move(Axis(last), 0);
    }
    array
}

/// Zero every voxel of `target` where `mask_source` is not strictly positive.
///
/// The mask is binarized (`> 0`). When shapes differ, a 3-D mask whose shape
/// matches the leading axes of a 4-D target is replicated across the last
/// axis; any other mismatch is an error.
pub fn apply_binary_mask(target: &ArrayD<f32>, mask_source: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let target = squeeze(target.clone());
    let mask = squeeze(mask_source.clone()).mapv(|v| if v > 0.0 { 1.0f32 } else { 0.0 });

    let mask = if mask.shape() == target.shape() {
        mask
    } else if mask.ndim() + 1 == target.ndim() && target.shape()[..mask.ndim()] == *mask.shape() {
        let axis = Axis(mask.ndim());
        let expanded = mask.insert_axis(axis);
        match expanded.broadcast(IxDyn(target.shape())) {
            Some(view) => view.to_owned(),
            None => return Err(shape_mismatch(target.shape(), expanded.shape())),
        }
    } else {
        return Err(shape_mismatch(target.shape(), mask.shape()));
    };

    let mut out = target;
    Zip::from(&mut out).and(&mask).for_each(|voxel, &keep| *voxel *= keep);
    Ok(out)
}

fn shape_mismatch(target: &[usize], mask: &[usize]) -> BidsonymError {
    BidsonymError::Volume {
        message: format!("mask shape {mask:?} cannot be applied to image of shape {target:?}"),
    }
}
