//! Slice extraction and rasterisation.

use crate::config::ReportConfig;
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use ndarray::{Array2, Array3, ArrayView3, Axis};

/// Anatomical viewing plane. Rows of the overlay appear in `ALL` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Sagittal,
    Coronal,
    Axial,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::Sagittal, Plane::Coronal, Plane::Axial];

    /// Volume axis held fixed when slicing in this plane.
    fn axis(self) -> usize {
        match self {
            Plane::Sagittal => 0,
            Plane::Coronal => 1,
            Plane::Axial => 2,
        }
    }
}

/// Inclusive index range of non-zero voxels along each axis.
///
/// Falls back to the full extent for an all-zero volume.
pub fn bounding_box(volume: ArrayView3<f32>) -> [(usize, usize); 3] {
    let shape = volume.shape();
    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];
    for ((x, y, z), &v) in volume.indexed_iter() {
        if v != 0.0 {
            for (axis, idx) in [x, y, z].into_iter().enumerate() {
                lo[axis] = lo[axis].min(idx);
                hi[axis] = hi[axis].max(idx);
            }
        }
    }
    let mut bbox = [(0, 0); 3];
    for axis in 0..3 {
        bbox[axis] = if lo[axis] == usize::MAX {
            (0, shape[axis].saturating_sub(1))
        } else {
            (lo[axis], hi[axis])
        };
    }
    bbox
}

/// `count` evenly spaced positions strictly inside `range` where possible.
pub fn cut_positions((lo, hi): (usize, usize), count: usize) -> Vec<usize> {
    let span = (hi - lo) as f64;
    (1..=count)
        .map(|i| lo + (span * i as f64 / (count + 1) as f64).round() as usize)
        .collect()
}

/// Intensity mapped to white: the configured percentile of non-zero voxels.
pub fn window_max(volume: ArrayView3<f32>) -> f32 {
    let mut values: Vec<f32> = volume.iter().copied().filter(|v| *v > 0.0).collect();
    if values.is_empty() {
        return 1.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = ((values.len() - 1) as f32 * ReportConfig::WINDOW_PERCENTILE).round() as usize;
    values[rank.min(values.len() - 1)].max(f32::EPSILON)
}

/// One slice oriented for display: first index is the image column, the
/// second the row counted from the bottom.
fn slice(volume: ArrayView3<f32>, plane: Plane, index: usize) -> Array2<f32> {
    let sheet = volume.index_axis(Axis(plane.axis()), index);
    sheet.to_owned()
}

fn gray(value: f32, max: f32) -> u8 {
    ((value / max).clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Rasterise one slice, blending mask voxels in red.
fn render_tile(image: &Array2<f32>, mask: Option<&Array2<f32>>, max: f32) -> RgbImage {
    let (width, height) = image.dim();
    let alpha = ReportConfig::MASK_ALPHA;
    RgbImage::from_fn(width as u32, height as u32, |col, row| {
        let (i, j) = (col as usize, height - 1 - row as usize);
        let g = gray(image[[i, j]], max);
        match mask {
            Some(m) if m[[i, j]] > 0.0 => {
                let base = g as f32 * (1.0 - alpha);
                Rgb([(base + 255.0 * alpha) as u8, base as u8, base as u8])
            }
            _ => Rgb([g, g, g]),
        }
    })
}

/// Three rows of `cuts` slices each (sagittal, coronal, axial) of `image`,
/// with `mask` overlaid.
pub fn overlay_mosaic(image: &Array3<f32>, mask: Option<&Array3<f32>>, cuts: usize) -> RgbImage {
    let bbox = bounding_box(image.view());
    let max = window_max(image.view());

    let rows: Vec<Vec<RgbImage>> = Plane::ALL
        .iter()
        .map(|&plane| {
            cut_positions(bbox[plane.axis()], cuts)
                .into_iter()
                .map(|index| {
                    let img = slice(image.view(), plane, index);
                    let msk = mask.map(|m| slice(m.view(), plane, index));
                    render_tile(&img, msk.as_ref(), max)
                })
                .collect()
        })
        .collect();

    let width = rows
        .iter()
        .map(|tiles| tiles.iter().map(|t| t.width()).sum::<u32>())
        .max()
        .unwrap_or(1)
        .max(1);
    let height = rows
        .iter()
        .map(|tiles| tiles.first().map_or(0, |t| t.height()))
        .sum::<u32>()
        .max(1);

    let mut canvas = RgbImage::new(width, height);
    let mut y = 0;
    for tiles in &rows {
        let mut x = 0;
        for tile in tiles {
            image::imageops::replace(&mut canvas, tile, x as i64, y as i64);
            x += tile.width();
        }
        y += tiles.first().map_or(0, |t| t.height());
    }
    canvas
}

/// Axial slices through the non-zero extent of `image`, one frame each.
pub fn preview_frames(image: &Array3<f32>, max_frames: usize) -> Vec<RgbaImage> {
    let bbox = bounding_box(image.view());
    let max = window_max(image.view());
    let (lo, hi) = bbox[Plane::Axial.axis()];
    let available = hi - lo + 1;
    let indices: Vec<usize> = if available <= max_frames {
        (lo..=hi).collect()
    } else {
        (0..max_frames)
            .map(|i| lo + i * (available - 1) / (max_frames - 1).max(1))
            .collect()
    };

    indices
        .into_iter()
        .map(|index| {
            let s = slice(image.view(), Plane::Axial, index);
            let (width, height) = s.dim();
            RgbaImage::from_fn(width as u32, height as u32, |col, row| {
                let g = gray(s[[col as usize, height - 1 - row as usize]], max);
                Rgba([g, g, g, 255])
            })
        })
        .collect()
}
