//! Canny edge maps for ROI crops.

use image::GrayImage;
use imageproc::edges::canny;
use ndarray::{Array2, ArrayView2};
use scanfit_utils::unit_array_to_gray;

/// Canny thresholds on the 0-255 gradient scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeThresholds {
    pub low: f32,
    pub high: f32,
}

impl Default for EdgeThresholds {
    fn default() -> Self {
        Self {
            low: 50.0,
            high: 100.0,
        }
    }
}

/// Binary edge map of `image` with values in `{0, 1}`.
pub fn edge_map(image: &GrayImage, thresholds: EdgeThresholds) -> Array2<f32> {
    let (low, high) = if thresholds.low <= thresholds.high {
        (thresholds.low, thresholds.high)
    } else {
        (thresholds.high, thresholds.low)
    };
    let edges = canny(image, low, high);
    let (width, height) = edges.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        if edges.get_pixel(x as u32, y as u32)[0] > 0 {
            1.0
        } else {
            0.0
        }
    })
}

/// Edge map of an image already normalized to `[0, 1]`.
pub fn edge_map_unit(pixels: ArrayView2<f32>, thresholds: EdgeThresholds) -> Array2<f32> {
    edge_map(&unit_array_to_gray(&pixels.to_owned()), thresholds)
}

/// Fraction of pixels marked as edges.
pub fn edge_density(edges: ArrayView2<f32>) -> f32 {
    if edges.is_empty() {
        return 0.0;
    }
    edges.sum() / edges.len() as f32
}
