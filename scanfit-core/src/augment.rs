//! Random affine and photometric augmentation of image tensors.
//!
//! Each augmented copy draws a rotation, zoom, shift, optional horizontal
//! flip and brightness factor. Geometry is resampled bilinearly with
//! nearest-edge fill; every channel of a sample shares one transform, while
//! brightness only touches the intensity channel (channel 0). Values stay in
//! `[0, 1]`.

use log::info;
use ndarray::{Array1, Array3, Array4, ArrayView1, ArrayView3, ArrayView4, Axis, s};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use scanfit_utils::{AugmentationSettings, timing_guard};

/// Parameters of one random transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    /// Rotation in radians, counter-clockwise.
    pub rotation: f32,
    /// Scale factor (>1 zooms in).
    pub zoom: f32,
    /// Shift in pixels.
    pub shift_x: f32,
    pub shift_y: f32,
    pub flip: bool,
    pub brightness: f32,
}

impl AugmentParams {
    pub const IDENTITY: AugmentParams = AugmentParams {
        rotation: 0.0,
        zoom: 1.0,
        shift_x: 0.0,
        shift_y: 0.0,
        flip: false,
        brightness: 1.0,
    };

    /// Draw a transform for an image of `height` x `width` pixels.
    pub fn sample<R: Rng + ?Sized>(
        settings: &AugmentationSettings,
        height: usize,
        width: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            rotation: symmetric(rng, settings.rotation_range).to_radians(),
            zoom: 1.0 + symmetric(rng, settings.zoom_range),
            shift_x: symmetric(rng, settings.shift_range) * width as f32,
            shift_y: symmetric(rng, settings.shift_range) * height as f32,
            flip: settings.horizontal_flip && rng.gen_bool(0.5),
            brightness: 1.0 + symmetric(rng, settings.brightness_range),
        }
    }
}

/// Apply `params` to one `(channels, height, width)` sample.
pub fn augment_sample(sample: ArrayView3<f32>, params: &AugmentParams) -> Array3<f32> {
    let (channels, height, width) = sample.dim();
    let mut out = Array3::<f32>::zeros((channels, height, width));
    if height == 0 || width == 0 {
        return out;
    }
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin, cos) = params.rotation.sin_cos();
    let zoom = params.zoom.max(1e-3);

    for y in 0..height {
        for x in 0..width {
            // Inverse map: output pixel -> source coordinates.
            let mut ox = x as f32 - cx - params.shift_x;
            let oy = y as f32 - cy - params.shift_y;
            if params.flip {
                ox = -ox;
            }
            let sx = (cos * ox + sin * oy) / zoom + cx;
            let sy = (-sin * ox + cos * oy) / zoom + cy;
            for c in 0..channels {
                let value = bilinear_clamped(sample.index_axis(Axis(0), c), sx, sy);
                out[(c, y, x)] = if c == 0 {
                    (value * params.brightness).clamp(0.0, 1.0)
                } else {
                    value.clamp(0.0, 1.0)
                };
            }
        }
    }
    out
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

fn bilinear_clamped(plane: ndarray::ArrayView2<f32>, x: f32, y: f32) -> f32 {
    let (h, w) = plane.dim();
    let x = x.clamp(0.0, (w - 1) as f32);
    let y = y.clamp(0.0, (h - 1) as f32);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let top = plane[(y0, x0)] * (1.0 - fx) + plane[(y0, x1)] * fx;
    let bottom = plane[(y1, x0)] * (1.0 - fx) + plane[(y1, x1)] * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Produce `settings.copies` augmented samples per input, with labels
/// repeated to match. Output order is copy-major: all first copies, then
/// all second copies.
pub fn augment_images(
    images: ArrayView4<f32>,
    labels: ArrayView1<f64>,
    settings: &AugmentationSettings,
) -> (Array4<f32>, Array1<f64>) {
    let _guard = timing_guard("augment images", log::Level::Debug);
    let (n, channels, height, width) = images.dim();
    let total = n * settings.copies;
    info!("Augmenting {n} image(s), {} copies each...", settings.copies);

    let mut rng = StdRng::seed_from_u64(settings.seed);
    let params: Vec<AugmentParams> = (0..total)
        .map(|_| AugmentParams::sample(settings, height, width, &mut rng))
        .collect();

    let samples: Vec<Array3<f32>> = params
        .par_iter()
        .enumerate()
        .map(|(k, p)| augment_sample(images.index_axis(Axis(0), k % n.max(1)), p))
        .collect();

    let mut out = Array4::<f32>::zeros((total, channels, height, width));
    for (k, sample) in samples.into_iter().enumerate() {
        out.slice_mut(s![k, .., .., ..]).assign(&sample);
    }
    let out_labels = Array1::from_iter((0..total).map(|k| labels[k % n.max(1)]));
    (out, out_labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn ramp(h: usize, w: usize) -> Array4<f32> {
        Array::from_shape_fn((2, 1, h, w), |(n, _, y, x)| {
            ((x + y) as f32 / (h + w) as f32) * if n == 0 { 1.0 } else { 0.5 }
        })
    }

    #[test]
    fn identity_transform_is_lossless() {
        let images = ramp(9, 7);
        let out = augment_sample(images.index_axis(Axis(0), 0), &AugmentParams::IDENTITY);
        for (a, b) in out.iter().zip(images.index_axis(Axis(0), 0).iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn flip_mirrors_columns() {
        let images = ramp(4, 6);
        let params = AugmentParams {
            flip: true,
            ..AugmentParams::IDENTITY
        };
        let out = augment_sample(images.index_axis(Axis(0), 0), &params);
        assert!((out[(0, 1, 0)] - images[(0, 0, 1, 5)]).abs() < 1e-6);
    }

    #[test]
    fn shift_moves_content() {
        let mut image = Array3::<f32>::zeros((1, 8, 8));
        image[(0, 3, 3)] = 1.0;
        let params = AugmentParams {
            shift_x: 2.0,
            shift_y: 1.0,
            ..AugmentParams::IDENTITY
        };
        let out = augment_sample(image.view(), &params);
        assert!((out[(0, 4, 5)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn copies_repeat_labels_and_stay_in_range() {
        let images = ramp(10, 10);
        let labels = Array1::from(vec![1.5, 3.0]);
        let settings = AugmentationSettings {
            copies: 3,
            brightness_range: 0.5,
            ..AugmentationSettings::default()
        };
        let (out, out_labels) = augment_images(images.view(), labels.view(), &settings);
        assert_eq!(out.dim(), (6, 1, 10, 10));
        assert_eq!(out_labels.to_vec(), vec![1.5, 3.0, 1.5, 3.0, 1.5, 3.0]);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn augmentation_is_seeded() {
        let images = ramp(10, 10);
        let labels = Array1::from(vec![0.0, 1.0]);
        let settings = AugmentationSettings::default();
        let (a, _) = augment_images(images.view(), labels.view(), &settings);
        let (b, _) = augment_images(images.view(), labels.view(), &settings);
        assert_eq!(a, b);
    }

    #[test]
    fn zero_copies_yield_empty_output() {
        let images = ramp(4, 4);
        let labels = Array1::from(vec![0.0, 1.0]);
        let settings = AugmentationSettings {
            copies: 0,
            ..AugmentationSettings::default()
        };
        let (out, out_labels) = augment_images(images.view(), labels.view(), &settings);
        assert_eq!(out.dim().0, 0);
        assert!(out_labels.is_empty());
    }
}
