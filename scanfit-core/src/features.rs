//! ORB keypoints and binary descriptors.
//!
//! FAST-9 corners are detected on a small image pyramid, thinned with a
//! score-ordered neighbourhood suppression, oriented by intensity centroid
//! and described with a 256-bit steered BRIEF test. The sampling pattern is
//! generated once from a seed, so two [`Orb`] instances built with the same
//! seed produce comparable descriptors.

use image::{GrayImage, imageops::FilterType};
use imageproc::{corners::corners_fast9, filter::gaussian_blur_f32};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use scanfit_utils::AlignmentSettings;

/// Descriptor length in bytes (256 binary tests).
pub const DESCRIPTOR_BYTES: usize = 32;
const PATCH_RADIUS: i32 = 15;
// Rotated pattern points reach PATCH_RADIUS * sqrt(2).
const BORDER: i32 = 22;
const SUPPRESSION_RADIUS: i32 = 3;

/// Detected keypoint in level-0 pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub response: f32,
    /// Orientation in radians.
    pub angle: f32,
    pub level: usize,
}

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Keypoints and their descriptors, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Detector parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbParams {
    pub max_features: usize,
    pub fast_threshold: u8,
    pub levels: usize,
    pub scale_factor: f32,
    pub seed: u64,
}

impl Default for OrbParams {
    fn default() -> Self {
        Self::from(&AlignmentSettings::default())
    }
}

impl From<&AlignmentSettings> for OrbParams {
    fn from(settings: &AlignmentSettings) -> Self {
        Self {
            max_features: settings.max_features,
            fast_threshold: settings.fast_threshold,
            levels: settings.pyramid_levels.max(1),
            scale_factor: settings.scale_factor.max(1.01),
            seed: settings.seed,
        }
    }
}

/// Oriented FAST and rotated BRIEF.
#[derive(Debug, Clone)]
pub struct Orb {
    params: OrbParams,
    pattern: Vec<[(f32, f32); 2]>,
}

impl Orb {
    pub fn new(params: OrbParams) -> Self {
        Self {
            pattern: sampling_pattern(params.seed),
            params,
        }
    }

    pub fn params(&self) -> &OrbParams {
        &self.params
    }

    /// Detect up to `max_features` keypoints and describe them.
    pub fn detect_and_compute(&self, image: &GrayImage) -> Features {
        let mut scale = 1.0f32;
        let mut candidates: Vec<(Keypoint, Descriptor)> = Vec::new();

        for level in 0..self.params.levels {
            let level_image = if level == 0 {
                image.clone()
            } else {
                let width = (image.width() as f32 / scale).round() as u32;
                let height = (image.height() as f32 / scale).round() as u32;
                if width <= 2 * BORDER as u32 || height <= 2 * BORDER as u32 {
                    break;
                }
                image::imageops::resize(image, width, height, FilterType::Triangle)
            };
            let smoothed = gaussian_blur_f32(&level_image, 2.0);

            let corners = self.suppress(&level_image, self.params.max_features * 2);
            for (x, y, score) in corners {
                let angle = intensity_centroid_angle(&level_image, x, y);
                let descriptor = self.describe(&smoothed, x, y, angle);
                candidates.push((
                    Keypoint {
                        x: x as f32 * scale,
                        y: y as f32 * scale,
                        response: score,
                        angle,
                        level,
                    },
                    descriptor,
                ));
            }
            scale *= self.params.scale_factor;
        }

        candidates.sort_by(|a, b| b.0.response.total_cmp(&a.0.response));
        candidates.truncate(self.params.max_features);

        let (keypoints, descriptors) = candidates.into_iter().unzip();
        Features {
            keypoints,
            descriptors,
        }
    }

    /// FAST corners away from the border, strongest first, with weaker
    /// neighbours inside `SUPPRESSION_RADIUS` dropped.
    fn suppress(&self, image: &GrayImage, cap: usize) -> Vec<(i32, i32, f32)> {
        let (width, height) = (image.width() as i32, image.height() as i32);
        let mut corners: Vec<_> = corners_fast9(image, self.params.fast_threshold)
            .into_iter()
            .map(|c| (c.x as i32, c.y as i32, c.score))
            .filter(|(x, y, _)| {
                *x >= BORDER && *y >= BORDER && *x < width - BORDER && *y < height - BORDER
            })
            .collect();
        corners.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut taken = vec![false; (width * height) as usize];
        let mut kept = Vec::new();
        for (x, y, score) in corners {
            if taken[(y * width + x) as usize] {
                continue;
            }
            for ny in (y - SUPPRESSION_RADIUS).max(0)..=(y + SUPPRESSION_RADIUS).min(height - 1) {
                for nx in (x - SUPPRESSION_RADIUS).max(0)..=(x + SUPPRESSION_RADIUS).min(width - 1)
                {
                    taken[(ny * width + nx) as usize] = true;
                }
            }
            kept.push((x, y, score));
            if kept.len() >= cap {
                break;
            }
        }
        kept
    }

    fn describe(&self, smoothed: &GrayImage, x: i32, y: i32, angle: f32) -> Descriptor {
        let (sin, cos) = angle.sin_cos();
        let sample = |(px, py): (f32, f32)| {
            let rx = (cos * px - sin * py).round() as i32;
            let ry = (sin * px + cos * py).round() as i32;
            smoothed.get_pixel((x + rx) as u32, (y + ry) as u32)[0]
        };

        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        for (bit, pair) in self.pattern.iter().enumerate() {
            if sample(pair[0]) < sample(pair[1]) {
                bytes[bit / 8] |= 1 << (bit % 8);
            }
        }
        Descriptor(bytes)
    }
}

/// Seeded BRIEF test pairs inside the patch disc.
fn sampling_pattern(seed: u64) -> Vec<[(f32, f32); 2]> {
    let mut rng = StdRng::seed_from_u64(seed);
    let radius = PATCH_RADIUS as f32;
    let mut point = move || loop {
        let x = rng.gen_range(-radius..=radius);
        let y = rng.gen_range(-radius..=radius);
        if x * x + y * y <= radius * radius {
            return (x, y);
        }
    };
    (0..DESCRIPTOR_BYTES * 8)
        .map(|_| [point(), point()])
        .collect()
}

/// Orientation from first-order moments over the patch disc.
fn intensity_centroid_angle(image: &GrayImage, x: i32, y: i32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            if dx * dx + dy * dy > PATCH_RADIUS * PATCH_RADIUS {
                continue;
            }
            let intensity = image.get_pixel((x + dx) as u32, (y + dy) as u32)[0] as f32;
            m10 += dx as f32 * intensity;
            m01 += dy as f32 * intensity;
        }
    }
    m01.atan2(m10)
}

/// A descriptor correspondence between a query and a train set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

/// Brute-force Hamming matching, sorted by ascending distance.
///
/// With `cross_check`, a pair is kept only when each descriptor is the
/// other's nearest neighbour.
pub fn match_descriptors(
    query: &[Descriptor],
    train: &[Descriptor],
    cross_check: bool,
) -> Vec<FeatureMatch> {
    if query.is_empty() || train.is_empty() {
        return Vec::new();
    }

    let forward: Vec<(usize, u32)> = query.par_iter().map(|q| nearest(q, train)).collect();
    let backward: Option<Vec<usize>> = cross_check
        .then(|| train.par_iter().map(|t| nearest(t, query).0).collect());

    let mut matches: Vec<FeatureMatch> = forward
        .into_iter()
        .enumerate()
        .filter(|(query_idx, (train_idx, _))| {
            backward
                .as_ref()
                .is_none_or(|back| back[*train_idx] == *query_idx)
        })
        .map(|(query_idx, (train_idx, distance))| FeatureMatch {
            query: query_idx,
            train: train_idx,
            distance,
        })
        .collect();
    matches.sort_by_key(|m| (m.distance, m.query));
    matches
}

/// Keep the best `fraction` of distance-sorted matches (truncating).
pub fn retain_best(matches: &mut Vec<FeatureMatch>, fraction: f32) {
    let keep = (matches.len() as f32 * fraction.clamp(0.0, 1.0)) as usize;
    matches.truncate(keep);
}

fn nearest(descriptor: &Descriptor, candidates: &[Descriptor]) -> (usize, u32) {
    candidates
        .iter()
        .enumerate()
        .map(|(idx, c)| (idx, descriptor.hamming(c)))
        .min_by_key(|(idx, distance)| (*distance, *idx))
        .unwrap_or((0, u32::MAX))
}
