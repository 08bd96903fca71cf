//! ORB + homography alignment of page crops against a reference page.
//!
//! The homography maps reference coordinates into the target page. The ROI
//! centre of the reference is pushed through it, and the displacement of the
//! centre is the offset applied when the ROI is cropped. In
//! [`AlignmentMode::Warp`] the target page is instead resampled into the
//! reference frame and cropped with a zero offset.

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{Interpolation, Projection, warp};
use log::{debug, info, warn};
use rayon::prelude::*;
use scanfit_utils::{AlignmentMode, AlignmentSettings, timing_guard};
use thiserror::Error;

use crate::{
    cropper::PageImage,
    error::HomographyError,
    features::{Features, Orb, OrbParams, match_descriptors, retain_best},
    geometry::{Offset, ScanLayout},
    homography::{Homography, PointPair, RansacParams, ransac_homography},
};

/// Why an image could not be aligned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("only {0} keypoint(s) detected")]
    TooFewFeatures(usize),
    #[error("only {0} good match(es)")]
    TooFewMatches(usize),
    #[error("homography estimation failed: {0}")]
    Homography(#[from] HomographyError),
    #[error("homography maps the ROI centre to infinity")]
    Unprojectable,
    #[error("offset ({dx}, {dy}) exceeds the maximum delta {max_delta}")]
    OffsetTooLarge { dx: i32, dy: i32, max_delta: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentStatus {
    Aligned,
    /// Falls back to a zero offset.
    Rejected(RejectReason),
}

impl AlignmentStatus {
    pub fn is_aligned(&self) -> bool {
        matches!(self, Self::Aligned)
    }
}

/// Result of aligning one page.
#[derive(Debug, Clone)]
pub struct AlignmentOutcome {
    /// Offset to apply when cropping, already clamped to the layout bounds.
    pub offset: Offset,
    /// Displacement measured before clamping (zero when rejected).
    pub raw_offset: Offset,
    pub status: AlignmentStatus,
    pub keypoints: usize,
    pub matches: usize,
    pub inliers: usize,
    pub homography: Option<Homography>,
}

impl AlignmentOutcome {
    fn rejected(reason: RejectReason, keypoints: usize, matches: usize) -> Self {
        Self {
            offset: Offset::ZERO,
            raw_offset: Offset::ZERO,
            status: AlignmentStatus::Rejected(reason),
            keypoints,
            matches,
            inliers: 0,
            homography: None,
        }
    }

    /// Identity outcome used for the reference page itself.
    pub fn reference() -> Self {
        Self {
            offset: Offset::ZERO,
            raw_offset: Offset::ZERO,
            status: AlignmentStatus::Aligned,
            keypoints: 0,
            matches: 0,
            inliers: 0,
            homography: Some(Homography::identity()),
        }
    }
}

/// Aligns pages against a fixed reference page.
pub struct Aligner {
    orb: Orb,
    reference: Features,
    reference_size: (u32, u32),
    settings: AlignmentSettings,
    layout: ScanLayout,
}

impl Aligner {
    /// Detect reference features once; every subsequent [`Aligner::align`]
    /// call matches against them.
    pub fn new(reference: &GrayImage, settings: &AlignmentSettings, layout: ScanLayout) -> Self {
        let _guard = timing_guard("reference features", log::Level::Debug);
        let orb = Orb::new(OrbParams::from(settings));
        let features = orb.detect_and_compute(reference);
        debug!("Reference page: {} keypoint(s)", features.len());
        Self {
            orb,
            reference: features,
            reference_size: reference.dimensions(),
            settings: settings.clone(),
            layout,
        }
    }

    pub fn reference_features(&self) -> &Features {
        &self.reference
    }

    pub fn mode(&self) -> AlignmentMode {
        self.settings.mode
    }

    /// Estimate the ROI offset of `page` relative to the reference.
    pub fn align(&self, page: &GrayImage) -> AlignmentOutcome {
        let target = self.orb.detect_and_compute(page);
        if target.len() < 4 || self.reference.len() < 4 {
            return AlignmentOutcome::rejected(
                RejectReason::TooFewFeatures(target.len().min(self.reference.len())),
                target.len(),
                0,
            );
        }

        let mut matches = match_descriptors(&self.reference.descriptors, &target.descriptors, true);
        retain_best(&mut matches, self.settings.good_match_percent);
        if matches.len() < 4 {
            return AlignmentOutcome::rejected(
                RejectReason::TooFewMatches(matches.len()),
                target.len(),
                matches.len(),
            );
        }

        let pairs: Vec<PointPair> = matches
            .iter()
            .map(|m| {
                let r = self.reference.keypoints[m.query];
                let t = target.keypoints[m.train];
                PointPair::new((r.x as f64, r.y as f64), (t.x as f64, t.y as f64))
            })
            .collect();
        let params = RansacParams {
            threshold: self.settings.ransac_threshold,
            max_iterations: self.settings.ransac_iterations,
            seed: self.settings.seed,
            ..RansacParams::default()
        };
        let fit = match ransac_homography(&pairs, &params) {
            Ok(fit) => fit,
            Err(err) => {
                return AlignmentOutcome::rejected(err.into(), target.len(), matches.len());
            }
        };

        let center = self.layout.roi.center();
        let Some((mx, my)) = fit.homography.apply(center) else {
            return AlignmentOutcome::rejected(
                RejectReason::Unprojectable,
                target.len(),
                matches.len(),
            );
        };
        let raw = Offset::new((mx - center.0).round() as i32, (my - center.1).round() as i32);
        if raw.exceeds(self.settings.max_delta) {
            return AlignmentOutcome::rejected(
                RejectReason::OffsetTooLarge {
                    dx: raw.dx,
                    dy: raw.dy,
                    max_delta: self.settings.max_delta,
                },
                target.len(),
                matches.len(),
            );
        }

        let offset = match self.settings.mode {
            AlignmentMode::Offset => self.layout.bounds.clamp(raw),
            AlignmentMode::Warp => Offset::ZERO,
        };
        if offset != raw && self.settings.mode == AlignmentMode::Offset {
            debug!(
                "Offset ({}, {}) clamped to ({}, {})",
                raw.dx, raw.dy, offset.dx, offset.dy
            );
        }

        AlignmentOutcome {
            offset,
            raw_offset: raw,
            status: AlignmentStatus::Aligned,
            keypoints: target.len(),
            matches: matches.len(),
            inliers: fit.inlier_count,
            homography: Some(fit.homography),
        }
    }

    /// Page to crop from: the page itself in offset mode, the page resampled
    /// into the reference frame in warp mode.
    pub fn apply(&self, page: &GrayImage, outcome: &AlignmentOutcome) -> GrayImage {
        if self.settings.mode != AlignmentMode::Warp || !outcome.status.is_aligned() {
            return page.clone();
        }
        let warped = outcome
            .homography
            .as_ref()
            .and_then(|h| warp_to_reference(page, h, self.reference_size));
        match warped {
            Some(warped) => warped,
            None => {
                warn!("Homography is not invertible; using the unwarped page");
                page.clone()
            }
        }
    }
}

/// Resample `page` so that reference coordinates line up with it. `h` maps
/// reference points into the page.
pub fn warp_to_reference(
    page: &GrayImage,
    h: &Homography,
    reference_size: (u32, u32),
) -> Option<GrayImage> {
    let inverse = h.inverse()?;
    let projection = Projection::from_matrix(inverse.to_row_major_f32())?;
    let warped = warp(page, &projection, Interpolation::Bilinear, Luma([255u8]));
    if warped.dimensions() == reference_size {
        return Some(warped);
    }
    Some(image::imageops::crop_imm(&warped, 0, 0, reference_size.0, reference_size.1).to_image())
}

/// Align every page against `reference`, preserving input order.
///
/// Rejected pages fall back to a zero offset and are reported with a
/// warning naming the page.
pub fn align_images(
    reference: &GrayImage,
    pages: &[PageImage],
    settings: &AlignmentSettings,
    layout: ScanLayout,
) -> Vec<AlignmentOutcome> {
    let _guard = timing_guard("align images", log::Level::Info);
    info!("Aligning {} image(s)...", pages.len());
    let aligner = Aligner::new(reference, settings, layout);

    let outcomes: Vec<AlignmentOutcome> = pages
        .par_iter()
        .map(|page| {
            let name = page.name();
            let outcome = aligner.align(&page.image);
            match &outcome.status {
                AlignmentStatus::Aligned => debug!(
                    "{name}: offset ({}, {}) from {} inlier(s) of {} match(es)",
                    outcome.offset.dx, outcome.offset.dy, outcome.inliers, outcome.matches
                ),
                AlignmentStatus::Rejected(reason) => {
                    warn!("{name}: alignment rejected ({reason}); using zero offset")
                }
            }
            outcome
        })
        .collect();

    let aligned = outcomes.iter().filter(|o| o.status.is_aligned()).count();
    info!("Aligned {aligned}/{} image(s)", outcomes.len());
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{PageRegion, RoiWindow};
    use scanfit_utils::synthetic::{place_page, textured_page};

    fn small_layout() -> ScanLayout {
        ScanLayout::new(
            PageRegion {
                left: 0,
                top: 0,
                width: 260,
                height: 220,
            },
            RoiWindow {
                left: 90,
                top: 80,
                width: 60,
                height: 40,
            },
        )
    }

    fn pages(shift: (i32, i32)) -> (GrayImage, GrayImage) {
        let content = textured_page(300, 260, 21);
        let reference = place_page(&content, 260, 220, -20, -20, 0, 0);
        let moved = place_page(&content, 260, 220, -20, -20, shift.0, shift.1);
        (reference, moved)
    }

    #[test]
    fn recovers_known_shift() {
        let (reference, moved) = pages((7, -5));
        let aligner = Aligner::new(&reference, &AlignmentSettings::default(), small_layout());
        let outcome = aligner.align(&moved);
        assert!(outcome.status.is_aligned(), "{:?}", outcome.status);
        assert_eq!(outcome.offset, Offset::new(7, -5));
        assert!(outcome.inliers >= 4);
    }

    #[test]
    fn reference_aligns_to_zero() {
        let (reference, _) = pages((0, 0));
        let aligner = Aligner::new(&reference, &AlignmentSettings::default(), small_layout());
        let outcome = aligner.align(&reference);
        assert_eq!(outcome.offset, Offset::ZERO);
        assert!(outcome.status.is_aligned());
    }

    #[test]
    fn oversized_offset_is_rejected() {
        let (reference, moved) = pages((12, 0));
        let settings = AlignmentSettings {
            max_delta: 5,
            ..AlignmentSettings::default()
        };
        let aligner = Aligner::new(&reference, &settings, small_layout());
        let outcome = aligner.align(&moved);
        assert_eq!(outcome.offset, Offset::ZERO);
        assert!(matches!(
            outcome.status,
            AlignmentStatus::Rejected(RejectReason::OffsetTooLarge { dx: 12, .. })
        ));
    }

    #[test]
    fn blank_page_is_rejected() {
        let (reference, _) = pages((0, 0));
        let blank = GrayImage::from_pixel(260, 220, Luma([235]));
        let aligner = Aligner::new(&reference, &AlignmentSettings::default(), small_layout());
        let outcome = aligner.align(&blank);
        assert!(matches!(
            outcome.status,
            AlignmentStatus::Rejected(RejectReason::TooFewFeatures(_))
        ));
    }

    #[test]
    fn warp_mode_reports_zero_offset_and_resamples() {
        let (reference, moved) = pages((6, 4));
        let settings = AlignmentSettings {
            mode: AlignmentMode::Warp,
            ..AlignmentSettings::default()
        };
        let aligner = Aligner::new(&reference, &settings, small_layout());
        let outcome = aligner.align(&moved);
        assert!(outcome.status.is_aligned());
        assert_eq!(outcome.offset, Offset::ZERO);
        assert_eq!(outcome.raw_offset, Offset::new(6, 4));

        let warped = aligner.apply(&moved, &outcome);
        assert_eq!(warped.dimensions(), reference.dimensions());
        let roi = small_layout().roi;
        let differing = (roi.top..roi.bottom())
            .flat_map(|y| (roi.left..roi.right()).map(move |x| (x, y)))
            .filter(|(x, y)| {
                let a = reference.get_pixel(*x, *y)[0] as i32;
                let b = warped.get_pixel(*x, *y)[0] as i32;
                (a - b).abs() > 40
            })
            .count();
        assert!(differing < 60, "{differing} pixels differ inside the ROI");
    }

    #[test]
    fn batch_preserves_order() {
        let content = textured_page(300, 260, 21);
        let reference = place_page(&content, 260, 220, -20, -20, 0, 0);
        let shifts = [(3, 1), (-4, 6), (0, -2)];
        let batch: Vec<PageImage> = shifts
            .iter()
            .enumerate()
            .map(|(i, (dx, dy))| PageImage {
                source: format!("page_{i}.png").into(),
                image: place_page(&content, 260, 220, -20, -20, *dx, *dy),
            })
            .collect();
        let outcomes = align_images(
            &reference,
            &batch,
            &AlignmentSettings::default(),
            small_layout(),
        );
        let offsets: Vec<_> = outcomes.iter().map(|o| (o.offset.dx, o.offset.dy)).collect();
        assert_eq!(offsets, shifts);
    }
}
