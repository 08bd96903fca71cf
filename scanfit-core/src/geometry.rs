//! Page and region-of-interest geometry.
//!
//! Raw scans are first cut down to a fixed page region. Alignment then
//! measures how far the content of each page drifted relative to the
//! reference page, and the ROI is shifted by that offset before cropping.
//! [`OffsetBounds`] keeps every shifted ROI inside the page, so a crop never
//! needs padding.

use scanfit_utils::GeometrySettings;
use serde::{Deserialize, Serialize};

/// Page rectangle inside a raw scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRegion {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl PageRegion {
    pub fn right(&self) -> u32 {
        self.left.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.top.saturating_add(self.height)
    }

    /// True when a scan of `width` x `height` pixels contains the whole page.
    pub fn fits_in(&self, width: u32, height: u32) -> bool {
        self.right() <= width && self.bottom() <= height
    }
}

/// ROI rectangle, relative to the page region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiWindow {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl RoiWindow {
    pub fn right(&self) -> u32 {
        self.left.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.top.saturating_add(self.height)
    }

    /// Centre of the window in page coordinates.
    pub fn center(&self) -> (f64, f64) {
        (
            self.left as f64 + self.width as f64 / 2.0,
            self.top as f64 + self.height as f64 / 2.0,
        )
    }

    /// Window moved by `offset` after clamping it to `bounds`.
    ///
    /// ```rust
    /// # use scanfit_core::geometry::{Offset, PageRegion, RoiWindow, OffsetBounds};
    /// let page = PageRegion { left: 0, top: 0, width: 100, height: 80 };
    /// let roi = RoiWindow { left: 10, top: 20, width: 30, height: 20 };
    /// let bounds = OffsetBounds::new(&page, &roi);
    /// let moved = roi.shifted(Offset::new(-50, 5), &bounds);
    /// assert_eq!((moved.left, moved.top), (0, 25));
    /// ```
    pub fn shifted(&self, offset: Offset, bounds: &OffsetBounds) -> RoiWindow {
        let clamped = bounds.clamp(offset);
        RoiWindow {
            left: (self.left as i64 + clamped.dx as i64) as u32,
            top: (self.top as i64 + clamped.dy as i64) as u32,
            width: self.width,
            height: self.height,
        }
    }
}

/// Pixel displacement of page content relative to the reference page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Offset {
    pub dx: i32,
    pub dy: i32,
}

impl Offset {
    pub const ZERO: Offset = Offset { dx: 0, dy: 0 };

    pub const fn new(dx: i32, dy: i32) -> Self {
        Self { dx, dy }
    }

    /// True when either component is larger than `max_delta` in magnitude.
    pub fn exceeds(&self, max_delta: i32) -> bool {
        self.dx.saturating_abs() > max_delta || self.dy.saturating_abs() > max_delta
    }
}

fn to_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Allowed offset range for one page/ROI pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetBounds {
    pub min_dx: i32,
    pub max_dx: i32,
    pub min_dy: i32,
    pub max_dy: i32,
}

impl OffsetBounds {
    /// `min = -crop_left`, `max = page_width - crop_right` (likewise vertically).
    pub fn new(page: &PageRegion, roi: &RoiWindow) -> Self {
        Self {
            min_dx: to_i32(-i64::from(roi.left)),
            max_dx: to_i32(i64::from(page.width) - i64::from(roi.right())),
            min_dy: to_i32(-i64::from(roi.top)),
            max_dy: to_i32(i64::from(page.height) - i64::from(roi.bottom())),
        }
    }

    pub fn contains(&self, offset: Offset) -> bool {
        (self.min_dx..=self.max_dx).contains(&offset.dx)
            && (self.min_dy..=self.max_dy).contains(&offset.dy)
    }

    pub fn clamp(&self, offset: Offset) -> Offset {
        // max() before min() so an inverted range collapses to the lower bound.
        Offset {
            dx: offset.dx.min(self.max_dx).max(self.min_dx),
            dy: offset.dy.min(self.max_dy).max(self.min_dy),
        }
    }
}

/// Page, ROI and derived bounds for a scanner layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLayout {
    pub page: PageRegion,
    pub roi: RoiWindow,
    pub bounds: OffsetBounds,
}

impl ScanLayout {
    pub fn new(page: PageRegion, roi: RoiWindow) -> Self {
        Self {
            page,
            roi,
            bounds: OffsetBounds::new(&page, &roi),
        }
    }

    /// ROI rectangle in page coordinates for a given alignment offset.
    pub fn roi_for(&self, offset: Offset) -> RoiWindow {
        self.roi.shifted(offset, &self.bounds)
    }
}

impl From<&GeometrySettings> for ScanLayout {
    fn from(settings: &GeometrySettings) -> Self {
        Self::new(
            PageRegion {
                left: settings.left,
                top: settings.top,
                width: settings.width,
                height: settings.height,
            },
            RoiWindow {
                left: settings.crop_left,
                top: settings.crop_top,
                width: settings.crop_width,
                height: settings.crop_height,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_layout() -> ScanLayout {
        ScanLayout::from(&GeometrySettings::default())
    }

    #[test]
    fn default_bounds_match_calibrated_layout() {
        let layout = default_layout();
        assert_eq!(layout.page.right(), 727);
        assert_eq!(layout.page.bottom(), 535);
        assert_eq!(
            layout.bounds,
            OffsetBounds {
                min_dx: -215,
                max_dx: 495 - 340,
                min_dy: -290,
                max_dy: 475 - 390,
            }
        );
        assert_eq!(layout.roi.center(), (277.5, 340.0));
    }

    #[test]
    fn clamped_roi_always_inside_page() {
        let layout = default_layout();
        for dx in (-600..=600).step_by(37) {
            for dy in (-600..=600).step_by(41) {
                let roi = layout.roi_for(Offset::new(dx, dy));
                assert!(roi.right() <= layout.page.width, "dx={dx} dy={dy}");
                assert!(roi.bottom() <= layout.page.height, "dx={dx} dy={dy}");
                assert!(layout.bounds.contains(layout.bounds.clamp(Offset::new(dx, dy))));
            }
        }
    }

    #[test]
    fn in_range_offsets_are_untouched() {
        let layout = default_layout();
        let offset = Offset::new(-12, 30);
        assert_eq!(layout.bounds.clamp(offset), offset);
        let roi = layout.roi_for(offset);
        assert_eq!((roi.left, roi.top), (203, 320));
        assert_eq!((roi.width, roi.height), (125, 100));
    }

    #[test]
    fn exceeds_checks_either_axis() {
        assert!(!Offset::new(200, -200).exceeds(200));
        assert!(Offset::new(0, -201).exceeds(200));
        assert!(Offset::new(201, 0).exceeds(200));
    }

    #[test]
    fn extreme_extents_saturate() {
        let page = PageRegion {
            left: u32::MAX - 5,
            top: 10,
            width: 100,
            height: u32::MAX,
        };
        assert_eq!(page.right(), u32::MAX);
        assert_eq!(page.bottom(), u32::MAX);
        assert!(!page.fits_in(u32::MAX - 1, 1000));

        let roi = RoiWindow {
            left: u32::MAX,
            top: 0,
            width: 1,
            height: 1,
        };
        let bounds = OffsetBounds::new(&page, &roi);
        assert_eq!(bounds.min_dx, i32::MIN);
        assert!(bounds.max_dx < 0);
        assert!(Offset::new(i32::MIN, 0).exceeds(200));
    }

    #[test]
    fn page_fit_check() {
        let page = default_layout().page;
        assert!(page.fits_in(727, 535));
        assert!(!page.fits_in(726, 600));
    }
}
