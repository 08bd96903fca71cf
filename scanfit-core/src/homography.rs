//! Planar homography estimation.
//!
//! [`estimate_dlt`] solves the normalized direct linear transform for any
//! number of correspondences >= 4; [`ransac_homography`] wraps it in a seeded
//! RANSAC loop that scores candidates by reprojection error and refits the
//! winner on its inliers.

use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::{SeedableRng, rngs::StdRng, seq::index::sample};

use crate::error::HomographyError;

/// A point correspondence `src -> dst`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointPair {
    pub src: (f64, f64),
    pub dst: (f64, f64),
}

impl PointPair {
    pub fn new(src: (f64, f64), dst: (f64, f64)) -> Self {
        Self { src, dst }
    }
}

/// 3x3 projective transform, normalized so `h[2][2] == 1` when possible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(pub Matrix3<f64>);

impl Homography {
    pub fn identity() -> Self {
        Self(Matrix3::identity())
    }

    pub fn translation(dx: f64, dy: f64) -> Self {
        Self(Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0))
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    /// Map a point; `None` when it lands on the line at infinity.
    pub fn apply(&self, (x, y): (f64, f64)) -> Option<(f64, f64)> {
        let p = self.0 * Vector3::new(x, y, 1.0);
        (p[2].abs() > 1e-12).then(|| (p[0] / p[2], p[1] / p[2]))
    }

    pub fn inverse(&self) -> Option<Self> {
        self.0.try_inverse().map(|m| Self(m).normalized())
    }

    /// Row-major coefficients in single precision.
    pub fn to_row_major_f32(&self) -> [f32; 9] {
        let m = &self.0;
        [
            m[(0, 0)] as f32,
            m[(0, 1)] as f32,
            m[(0, 2)] as f32,
            m[(1, 0)] as f32,
            m[(1, 1)] as f32,
            m[(1, 2)] as f32,
            m[(2, 0)] as f32,
            m[(2, 1)] as f32,
            m[(2, 2)] as f32,
        ]
    }

    /// Euclidean distance between `apply(src)` and `dst`.
    pub fn reprojection_error(&self, pair: &PointPair) -> f64 {
        match self.apply(pair.src) {
            Some((x, y)) => ((x - pair.dst.0).powi(2) + (y - pair.dst.1).powi(2)).sqrt(),
            None => f64::INFINITY,
        }
    }

    fn normalized(self) -> Self {
        let scale = self.0[(2, 2)];
        if scale.abs() > 1e-12 {
            Self(self.0 / scale)
        } else {
            self
        }
    }
}

/// Similarity transform that moves the centroid to the origin and scales the
/// mean distance to sqrt(2).
fn hartley_transform(points: impl Iterator<Item = (f64, f64)> + Clone) -> Matrix3<f64> {
    let n = points.clone().count().max(1) as f64;
    let (sx, sy) = points
        .clone()
        .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
    let (cx, cy) = (sx / n, sy / n);
    let mean_dist = points
        .map(|(x, y)| ((x - cx).powi(2) + (y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

/// Least-squares homography from four or more correspondences.
pub fn estimate_dlt(pairs: &[PointPair]) -> Result<Homography, HomographyError> {
    if pairs.len() < 4 {
        return Err(HomographyError::TooFewPoints(pairs.len()));
    }
    let t_src = hartley_transform(pairs.iter().map(|p| p.src));
    let t_dst = hartley_transform(pairs.iter().map(|p| p.dst));

    let rows = (pairs.len() * 2).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, pair) in pairs.iter().enumerate() {
        let s = t_src * Vector3::new(pair.src.0, pair.src.1, 1.0);
        let d = t_dst * Vector3::new(pair.dst.0, pair.dst.1, 1.0);
        let (x1, y1, x2, y2) = (s[0], s[1], d[0], d[1]);
        let r = 2 * i;
        a.row_mut(r)
            .copy_from_slice(&[-x1, -y1, -1.0, 0.0, 0.0, 0.0, x2 * x1, x2 * y1, x2]);
        a.row_mut(r + 1)
            .copy_from_slice(&[0.0, 0.0, 0.0, -x1, -y1, -1.0, y2 * x1, y2 * y1, y2]);
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(HomographyError::Degenerate)?;
    // nalgebra does not sort singular values; pick the smallest explicitly.
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or(HomographyError::Degenerate)?;
    let h = v_t.row(min_idx);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst.try_inverse().ok_or(HomographyError::Degenerate)?;
    let m = t_dst_inv * hn * t_src;
    if !m.iter().all(|v| v.is_finite()) || m[(2, 2)].abs() < 1e-12 {
        return Err(HomographyError::Degenerate);
    }
    Ok(Homography(m).normalized())
}

/// RANSAC settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RansacParams {
    /// Inlier reprojection threshold in pixels.
    pub threshold: f64,
    pub max_iterations: usize,
    /// Early-exit confidence for the adaptive iteration count.
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            max_iterations: 2000,
            confidence: 0.995,
            seed: 42,
        }
    }
}

/// Best model with its inlier mask.
#[derive(Debug, Clone)]
pub struct RansacResult {
    pub homography: Homography,
    pub inliers: Vec<bool>,
    pub inlier_count: usize,
    pub iterations: usize,
}

/// Robust homography from correspondences contaminated by outliers.
pub fn ransac_homography(
    pairs: &[PointPair],
    params: &RansacParams,
) -> Result<RansacResult, HomographyError> {
    if pairs.len() < 4 {
        return Err(HomographyError::TooFewPoints(pairs.len()));
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<(Homography, usize)> = None;
    let mut needed = params.max_iterations.max(1);
    let mut iterations = 0;

    while iterations < needed {
        iterations += 1;
        let picked: Vec<PointPair> = sample(&mut rng, pairs.len(), 4)
            .into_iter()
            .map(|i| pairs[i])
            .collect();
        if is_degenerate(&picked) {
            continue;
        }
        let Ok(candidate) = estimate_dlt(&picked) else {
            continue;
        };
        let count = pairs
            .iter()
            .filter(|p| candidate.reprojection_error(p) < params.threshold)
            .count();
        if best.is_none_or(|(_, c)| count > c) {
            best = Some((candidate, count));
            needed = needed.min(adaptive_iterations(
                count as f64 / pairs.len() as f64,
                params.confidence,
                params.max_iterations,
            ));
        }
    }

    let Some((model, _)) = best else {
        return Err(HomographyError::NoConsensus(iterations));
    };

    // Refit on the consensus set; keep the sampled model if refitting degrades it.
    let mask = inlier_mask(&model, pairs, params.threshold);
    let inlier_pairs: Vec<PointPair> = pairs
        .iter()
        .zip(&mask)
        .filter_map(|(p, keep)| keep.then_some(*p))
        .collect();
    let mut homography = model;
    let mut inliers = mask;
    if let Ok(refit) = estimate_dlt(&inlier_pairs) {
        let refit_mask = inlier_mask(&refit, pairs, params.threshold);
        if count_true(&refit_mask) >= count_true(&inliers) {
            homography = refit;
            inliers = refit_mask;
        }
    }

    Ok(RansacResult {
        homography,
        inlier_count: count_true(&inliers),
        inliers,
        iterations,
    })
}

fn inlier_mask(model: &Homography, pairs: &[PointPair], threshold: f64) -> Vec<bool> {
    pairs
        .iter()
        .map(|p| model.reprojection_error(p) < threshold)
        .collect()
}

fn count_true(mask: &[bool]) -> usize {
    mask.iter().filter(|v| **v).count()
}

fn adaptive_iterations(inlier_ratio: f64, confidence: f64, cap: usize) -> usize {
    let w4 = inlier_ratio.powi(4);
    if w4 >= 1.0 - 1e-12 {
        return 1;
    }
    if w4 <= 1e-12 {
        return cap;
    }
    let n = (1.0 - confidence).ln() / (1.0 - w4).ln();
    if n.is_finite() {
        (n.ceil() as usize).clamp(1, cap)
    } else {
        cap
    }
}

/// Any three of the sampled points (on either side) nearly collinear.
fn is_degenerate(sample: &[PointPair]) -> bool {
    const MIN_AREA: f64 = 1.0;
    let collinear = |pts: [(f64, f64); 3]| {
        let [(ax, ay), (bx, by), (cx, cy)] = pts;
        ((bx - ax) * (cy - ay) - (by - ay) * (cx - ax)).abs() < MIN_AREA
    };
    for i in 0..sample.len() {
        for j in i + 1..sample.len() {
            for k in j + 1..sample.len() {
                let (a, b, c) = (sample[i], sample[j], sample[k]);
                if collinear([a.src, b.src, c.src]) || collinear([a.dst, b.dst, c.dst]) {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_pairs(h: &Homography) -> Vec<PointPair> {
        let mut pairs = Vec::new();
        for gx in 0..6 {
            for gy in 0..5 {
                let src = (20.0 + gx as f64 * 37.0, 15.0 + gy as f64 * 41.0);
                let dst = h.apply(src).unwrap();
                pairs.push(PointPair::new(src, dst));
            }
        }
        pairs
    }

    fn assert_close(a: &Homography, b: &Homography, tol: f64) {
        for (x, y) in a.0.iter().zip(b.0.iter()) {
            assert!((x - y).abs() < tol, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn dlt_recovers_projective_transform() {
        let truth = Homography(Matrix3::new(
            1.02, 0.03, 12.0, -0.02, 0.98, -7.5, 1e-5, -2e-5, 1.0,
        ));
        let estimated = estimate_dlt(&grid_pairs(&truth)).unwrap();
        assert_close(&estimated, &truth, 1e-6);
    }

    #[test]
    fn dlt_needs_four_points() {
        let pairs = vec![PointPair::new((0.0, 0.0), (1.0, 1.0)); 3];
        assert_eq!(estimate_dlt(&pairs), Err(HomographyError::TooFewPoints(3)));
    }

    #[test]
    fn inverse_undoes_apply() {
        let h = Homography::translation(5.0, -3.0);
        let inv = h.inverse().unwrap();
        let (x, y) = inv.apply(h.apply((10.0, 20.0)).unwrap()).unwrap();
        assert!((x - 10.0).abs() < 1e-9 && (y - 20.0).abs() < 1e-9);
    }

    #[test]
    fn ransac_ignores_outliers() {
        let truth = Homography::translation(8.0, -5.0);
        let mut pairs = grid_pairs(&truth);
        let clean = pairs.len();
        for i in 0..10 {
            let src = (13.0 * i as f64, 200.0 - 7.0 * i as f64);
            pairs.push(PointPair::new(src, (src.1 * 0.5, src.0 + 90.0)));
        }
        let result = ransac_homography(&pairs, &RansacParams::default()).unwrap();
        assert_eq!(result.inlier_count, clean);
        assert!(result.inliers[..clean].iter().all(|v| *v));
        assert_close(&result.homography, &truth, 1e-6);
    }

    #[test]
    fn ransac_is_deterministic_for_a_seed() {
        let pairs = grid_pairs(&Homography::translation(1.0, 2.0));
        let a = ransac_homography(&pairs, &RansacParams::default()).unwrap();
        let b = ransac_homography(&pairs, &RansacParams::default()).unwrap();
        assert_eq!(a.homography, b.homography);
        assert_eq!(a.iterations, b.iterations);
    }

    #[test]
    fn collinear_samples_are_degenerate() {
        let line: Vec<_> = (0..4)
            .map(|i| PointPair::new((i as f64, i as f64), (i as f64, 2.0 * i as f64)))
            .collect();
        assert!(is_degenerate(&line));
        assert!(matches!(
            ransac_homography(
                &line,
                &RansacParams {
                    max_iterations: 10,
                    ..RansacParams::default()
                }
            ),
            Err(HomographyError::NoConsensus(10))
        ));
    }

    #[test]
    fn adaptive_iteration_count() {
        assert_eq!(adaptive_iterations(1.0, 0.995, 2000), 1);
        assert_eq!(adaptive_iterations(0.0, 0.995, 2000), 2000);
        let mid = adaptive_iterations(0.5, 0.995, 2000);
        assert!((80..=90).contains(&mid), "{mid}");
    }
}
