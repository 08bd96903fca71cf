//! Page and ROI extraction.
//!
//! Raw scans are reduced to the page region first so every page shares the
//! same coordinate frame. After alignment the ROI is cut from each page at
//! the clamped offset and written as a grayscale PNG named after the source
//! file stem.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::GrayImage;
use log::{debug, info, warn};
use rayon::prelude::*;
use scanfit_utils::{collect_images, file_stem_string, load_gray, save_gray_png, timing_guard};
use serde::{Deserialize, Serialize};

use crate::{
    align::AlignmentOutcome,
    geometry::{Offset, PageRegion, ScanLayout},
};

/// A page crop together with the file it came from.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub source: PathBuf,
    pub image: GrayImage,
}

impl PageImage {
    pub fn name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn stem(&self) -> String {
        file_stem_string(&self.source)
    }
}

/// Provenance stored inside each saved ROI crop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropProvenance {
    pub source: String,
    pub dx: i32,
    pub dy: i32,
    pub aligned: bool,
}

/// A written ROI crop.
#[derive(Debug, Clone)]
pub struct SavedCrop {
    pub path: PathBuf,
    pub offset: Offset,
}

/// Cut the page region out of a raw scan; `None` when the scan is too small.
pub fn crop_page(scan: &GrayImage, page: &PageRegion) -> Option<GrayImage> {
    let (width, height) = scan.dimensions();
    if !page.fits_in(width, height) {
        return None;
    }
    Some(image::imageops::crop_imm(scan, page.left, page.top, page.width, page.height).to_image())
}

/// Cut the ROI out of a page crop at `offset` (clamped to the layout bounds).
///
/// ```rust
/// # use image::GrayImage;
/// # use scanfit_core::cropper::crop_roi;
/// # use scanfit_core::geometry::{Offset, PageRegion, RoiWindow, ScanLayout};
/// let layout = ScanLayout::new(
///     PageRegion { left: 0, top: 0, width: 50, height: 40 },
///     RoiWindow { left: 10, top: 10, width: 20, height: 10 },
/// );
/// let page = GrayImage::new(50, 40);
/// let roi = crop_roi(&page, &layout, Offset::new(100, -100));
/// assert_eq!(roi.dimensions(), (20, 10));
/// ```
pub fn crop_roi(page: &GrayImage, layout: &ScanLayout, offset: Offset) -> GrayImage {
    let roi = layout.roi_for(offset);
    let (width, height) = page.dimensions();
    // Pages narrower than the layout still yield a crop of the ROI size.
    let left = roi.left.min(width.saturating_sub(roi.width));
    let top = roi.top.min(height.saturating_sub(roi.height));
    image::imageops::crop_imm(page, left, top, roi.width, roi.height).to_image()
}

/// Load every scan under `image_dir`, convert it to grayscale and cut the
/// page region. Unreadable or undersized scans are skipped with a warning.
pub fn load_and_preprocess_images(image_dir: &Path, layout: &ScanLayout) -> Result<Vec<PageImage>> {
    let _guard = timing_guard("load and preprocess images", log::Level::Info);
    info!("Loading and preprocessing images...");
    let paths = collect_images(image_dir)
        .with_context(|| format!("failed to list scans in {}", image_dir.display()))?;
    anyhow::ensure!(!paths.is_empty(), "no images found in {}", image_dir.display());

    let pages: Vec<PageImage> = paths
        .par_iter()
        .filter_map(|path| {
            let scan = match load_gray(path) {
                Ok(scan) => scan,
                Err(err) => {
                    warn!("Skipping {}: {err:#}", path.display());
                    return None;
                }
            };
            let (width, height) = scan.dimensions();
            match crop_page(&scan, &layout.page) {
                Some(image) => Some(PageImage {
                    source: path.clone(),
                    image,
                }),
                None => {
                    warn!(
                        "Skipping {}: {width}x{height} scan does not contain the page region ending at ({}, {})",
                        path.display(),
                        layout.page.right(),
                        layout.page.bottom()
                    );
                    None
                }
            }
        })
        .collect();

    info!("Loaded {}/{} scan(s)", pages.len(), paths.len());
    Ok(pages)
}

/// Crop each page's ROI at its alignment offset and save it under `out_dir`.
///
/// `pages` and `outcomes` are index-aligned; pages are expected to be
/// already resampled when warp alignment is in use.
pub fn preprocess_and_save_images(
    pages: &[PageImage],
    outcomes: &[AlignmentOutcome],
    layout: &ScanLayout,
    out_dir: &Path,
) -> Result<Vec<SavedCrop>> {
    anyhow::ensure!(
        pages.len() == outcomes.len(),
        "{} page(s) but {} alignment result(s)",
        pages.len(),
        outcomes.len()
    );
    let _guard = timing_guard("crop and save", log::Level::Info);
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let mut saved = Vec::with_capacity(pages.len());
    for (page, outcome) in pages.iter().zip(outcomes) {
        let crop = crop_roi(&page.image, layout, outcome.offset);
        let path = out_dir.join(format!("{}.png", page.stem()));
        if saved.iter().any(|s: &SavedCrop| s.path == path) {
            warn!("{} overwrites an earlier crop with the same stem", page.name());
        }
        let provenance = CropProvenance {
            source: page.name(),
            dx: outcome.offset.dx,
            dy: outcome.offset.dy,
            aligned: outcome.status.is_aligned(),
        };
        save_gray_png(&crop, &path, Some(&provenance))
            .with_context(|| format!("failed to save crop for {}", page.name()))?;
        debug!("Saved {}", path.display());
        saved.push(SavedCrop {
            path,
            offset: outcome.offset,
        });
    }
    info!("Saved {} crop(s) to {}", saved.len(), out_dir.display());
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::AlignmentOutcome;
    use crate::geometry::RoiWindow;
    use image::Luma;
    use scanfit_utils::{PNG_TEXT_KEYWORD, read_png_text};
    use tempfile::tempdir;

    fn layout() -> ScanLayout {
        ScanLayout::new(
            PageRegion {
                left: 5,
                top: 4,
                width: 40,
                height: 30,
            },
            RoiWindow {
                left: 10,
                top: 8,
                width: 12,
                height: 6,
            },
        )
    }

    fn gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| Luma([(x + 2 * y) as u8]))
    }

    #[test]
    fn page_crop_uses_region_origin() {
        let scan = gradient(60, 50);
        let page = crop_page(&scan, &layout().page).unwrap();
        assert_eq!(page.dimensions(), (40, 30));
        assert_eq!(page.get_pixel(0, 0)[0], (5 + 2 * 4) as u8);
        assert!(crop_page(&gradient(44, 50), &layout().page).is_none());
    }

    #[test]
    fn roi_follows_offset() {
        let page = gradient(40, 30);
        let roi = crop_roi(&page, &layout(), Offset::new(3, -2));
        assert_eq!(roi.dimensions(), (12, 6));
        assert_eq!(roi.get_pixel(0, 0), page.get_pixel(13, 6));
    }

    #[test]
    fn roi_offsets_are_clamped_to_page() {
        let page = gradient(40, 30);
        let roi = crop_roi(&page, &layout(), Offset::new(500, 500));
        assert_eq!(roi.get_pixel(11, 5), page.get_pixel(39, 29));
    }

    #[test]
    fn saves_crops_with_provenance() {
        let dir = tempdir().unwrap();
        let pages = vec![PageImage {
            source: PathBuf::from("scans/doc_7.jpg"),
            image: gradient(40, 30),
        }];
        let mut outcome = AlignmentOutcome::reference();
        outcome.offset = Offset::new(-2, 1);
        let saved =
            preprocess_and_save_images(&pages, &[outcome], &layout(), dir.path()).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].path, dir.path().join("doc_7.png"));

        let text = read_png_text(&saved[0].path, PNG_TEXT_KEYWORD).unwrap().unwrap();
        let provenance: CropProvenance = serde_json::from_str(&text).unwrap();
        assert_eq!(
            provenance,
            CropProvenance {
                source: "doc_7.jpg".into(),
                dx: -2,
                dy: 1,
                aligned: true,
            }
        );
    }

    #[test]
    fn mismatched_outcomes_are_an_error() {
        let dir = tempdir().unwrap();
        assert!(preprocess_and_save_images(&[], &[AlignmentOutcome::reference()], &layout(), dir.path()).is_err());
    }

    #[test]
    fn loader_skips_small_and_broken_scans() {
        let dir = tempdir().unwrap();
        gradient(60, 50).save(dir.path().join("a.png")).unwrap();
        gradient(20, 20).save(dir.path().join("b.png")).unwrap();
        std::fs::write(dir.path().join("c.png"), b"not a png").unwrap();
        let pages = load_and_preprocess_images(dir.path(), &layout()).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].stem(), "a");
        assert_eq!(pages[0].image.dimensions(), (40, 30));
    }
}
