use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, Luma, imageops::FilterType};
use log::debug;
use ndarray::Array2;
use walkdir::WalkDir;

/// File extensions treated as scans.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "webp", "tif", "tiff"];

/// Load an image from disk into memory.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Load an image and convert it to 8-bit grayscale.
pub fn load_gray<P: AsRef<Path>>(path: P) -> Result<GrayImage> {
    Ok(load_image(path)?.to_luma8())
}

/// Resize a grayscale image to exactly `width` x `height`.
pub fn resize_gray(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    image::imageops::resize(image, width, height, FilterType::Triangle)
}

/// Convert a grayscale image into a `(rows, cols)` array scaled to `[0, 1]`.
pub fn gray_to_unit_array(image: &GrayImage) -> Array2<f32> {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        image.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
    })
}

/// Convert a `[0, 1]` array back into an 8-bit grayscale image (values are clamped).
pub fn unit_array_to_gray(array: &Array2<f32>) -> GrayImage {
    let (rows, cols) = array.dim();
    GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        let v = array[(y as usize, x as usize)].clamp(0.0, 1.0);
        Luma([(v * 255.0).round() as u8])
    })
}

/// True when the path carries one of [`IMAGE_EXTENSIONS`].
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Collect image paths from a file or a directory tree, sorted by path.
pub fn collect_images(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    anyhow::ensure!(
        path.is_dir(),
        "input path is neither file nor directory: {}",
        path.display()
    );

    let mut images = Vec::new();
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if has_image_extension(entry.path()) {
            images.push(entry.path().to_path_buf());
        } else {
            debug!("Skipping non-image file {}", entry.path().display());
        }
    }
    images.sort();
    Ok(images)
}

/// File stem as an owned string (`"scan_01"` for `docs/scan_01.png`).
pub fn file_stem_string(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn unit_array_round_trips_through_gray() {
        let image = GrayImage::from_fn(3, 2, |x, y| Luma([(x * 60 + y * 20) as u8]));
        let array = gray_to_unit_array(&image);
        assert_eq!(array.dim(), (2, 3));
        assert!((array[(1, 2)] - 140.0 / 255.0).abs() < 1e-6);
        assert_eq!(unit_array_to_gray(&array), image);
    }

    #[test]
    fn unit_array_to_gray_clamps() {
        let array = Array2::from_shape_vec((1, 2), vec![-0.5f32, 1.7]).unwrap();
        let gray = unit_array_to_gray(&array);
        assert_eq!(gray.get_pixel(0, 0)[0], 0);
        assert_eq!(gray.get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn collect_images_filters_and_sorts() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        GrayImage::new(2, 2).save(dir.path().join("b.png")).unwrap();
        GrayImage::new(2, 2).save(dir.path().join("nested/a.PNG")).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let found = collect_images(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0] < found[1]);
        assert!(found.iter().all(|p| has_image_extension(p)));
    }

    #[test]
    fn collect_images_rejects_missing_path() {
        let dir = tempdir().unwrap();
        assert!(collect_images(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn resize_is_noop_at_target_size() {
        let image = GrayImage::from_pixel(4, 4, Luma([9]));
        assert_eq!(resize_gray(&image, 4, 4), image);
        assert_eq!(resize_gray(&image, 2, 3).dimensions(), (2, 3));
    }
}
