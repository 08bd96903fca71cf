//! Pipeline configuration shared by the core crate and the CLI.
//!
//! Every section is `#[serde(default)]`, so a settings file only has to name
//! the values it changes. Defaults reproduce the scanner layout the pipeline
//! was calibrated for: a 495x475 page region at (232, 60) and a 125x100
//! region of interest at (215, 290) inside that page.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Input and output locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    /// Directory holding the raw document scans.
    pub image_dir: PathBuf,
    /// Directory that receives the aligned ROI crops.
    pub preprocessed_dir: PathBuf,
    /// Spreadsheet (Excel or CSV) listing image names and their labels.
    pub label_file: PathBuf,
    /// Directory for the comparison table and plots.
    pub output_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("./documents"),
            preprocessed_dir: PathBuf::from("./documents/preprocessed_images"),
            label_file: PathBuf::from("Meta_pic_3.xlsx"),
            output_dir: PathBuf::from("."),
        }
    }
}

/// Page and region-of-interest rectangles in scan pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeometrySettings {
    /// Left edge of the page region inside the raw scan.
    pub left: u32,
    /// Top edge of the page region inside the raw scan.
    pub top: u32,
    pub width: u32,
    pub height: u32,
    /// ROI left edge, relative to the page region.
    pub crop_left: u32,
    /// ROI top edge, relative to the page region.
    pub crop_top: u32,
    pub crop_width: u32,
    pub crop_height: u32,
}

impl Default for GeometrySettings {
    fn default() -> Self {
        Self {
            left: 232,
            top: 60,
            width: 495,
            height: 475,
            crop_left: 215,
            crop_top: 290,
            crop_width: 125,
            crop_height: 100,
        }
    }
}

impl GeometrySettings {
    /// Reject layouts where the ROI does not fit inside the page.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.width > 0 && self.height > 0,
            "page region must have non-zero size"
        );
        anyhow::ensure!(
            self.crop_width > 0 && self.crop_height > 0,
            "crop window must have non-zero size"
        );
        let right = self.crop_left.checked_add(self.crop_width);
        let bottom = self.crop_top.checked_add(self.crop_height);
        let (Some(right), Some(bottom)) = (right, bottom) else {
            anyhow::bail!(
                "crop window {}x{} at ({}, {}) overflows the pixel range",
                self.crop_width,
                self.crop_height,
                self.crop_left,
                self.crop_top
            );
        };
        anyhow::ensure!(
            self.left.checked_add(self.width).is_some()
                && self.top.checked_add(self.height).is_some(),
            "page region {}x{} at ({}, {}) overflows the pixel range",
            self.width,
            self.height,
            self.left,
            self.top
        );
        anyhow::ensure!(
            right <= self.width && bottom <= self.height,
            "crop window {}x{} at ({}, {}) does not fit in the {}x{} page region",
            self.crop_width,
            self.crop_height,
            self.crop_left,
            self.crop_top,
            self.width,
            self.height
        );
        Ok(())
    }
}

/// How an alignment result is applied to a scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMode {
    /// Shift the ROI by the estimated offset (default).
    #[default]
    Offset,
    /// Warp the whole page into the reference frame, then crop at the fixed ROI.
    Warp,
}

impl fmt::Display for AlignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlignmentMode::Offset => "offset",
            AlignmentMode::Warp => "warp",
        })
    }
}

impl FromStr for AlignmentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offset" | "shift" => Ok(AlignmentMode::Offset),
            "warp" | "homography" => Ok(AlignmentMode::Warp),
            other => Err(format!(
                "invalid alignment mode '{other}'; expected 'offset' or 'warp'"
            )),
        }
    }
}

/// ORB keypoint matching and homography estimation parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlignmentSettings {
    /// Keypoints kept per image after response ranking.
    pub max_features: usize,
    /// Fraction of the best matches (by Hamming distance) used for the homography.
    pub good_match_percent: f32,
    /// Offsets larger than this many pixels on either axis are rejected.
    pub max_delta: i32,
    /// FAST intensity threshold.
    pub fast_threshold: u8,
    /// Pyramid levels scanned for keypoints.
    pub pyramid_levels: usize,
    /// Downscale factor between pyramid levels.
    pub scale_factor: f32,
    /// RANSAC inlier reprojection threshold in pixels.
    pub ransac_threshold: f64,
    pub ransac_iterations: usize,
    pub mode: AlignmentMode,
    /// Seed for the BRIEF sampling pattern and RANSAC sampling.
    pub seed: u64,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            max_features: 500,
            good_match_percent: 0.15,
            max_delta: 200,
            fast_threshold: 20,
            pyramid_levels: 3,
            scale_factor: 1.2,
            ransac_threshold: 3.0,
            ransac_iterations: 2_000,
            mode: AlignmentMode::Offset,
            seed: 42,
        }
    }
}

/// Where labels come from and which columns to read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabelSettings {
    /// Column holding image file names (name, `#index` or bare index).
    pub image_column: String,
    /// Column holding the numeric regression target.
    pub label_column: String,
    /// Sheet to read when the label file is a workbook (first sheet otherwise).
    pub sheet: Option<String>,
    pub has_headers: Option<bool>,
    pub delimiter: Option<char>,
    /// Explicit format token (`csv` or `excel`); detected from the extension otherwise.
    pub format: Option<String>,
}

impl Default for LabelSettings {
    fn default() -> Self {
        Self {
            image_column: "filename".to_string(),
            label_column: "label".to_string(),
            sheet: None,
            has_headers: None,
            delimiter: None,
            format: None,
        }
    }
}

/// Dataset assembly: model input size, split and folds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatasetSettings {
    /// Side length of the square model input.
    pub input_size: u32,
    /// Fraction of samples held out for the final evaluation.
    pub test_size: f64,
    pub random_state: u64,
    /// Folds used by cross-validation and the hyperparameter search.
    pub num_folds: usize,
    /// Append Canny edge maps to the flat feature vectors.
    pub edge_features: bool,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            input_size: 128,
            test_size: 0.2,
            random_state: 42,
            num_folds: 5,
            edge_features: false,
            canny_low: 50.0,
            canny_high: 100.0,
        }
    }
}

/// Random augmentation ranges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationSettings {
    /// Augmented copies generated per original sample (0 disables augmentation).
    pub copies: usize,
    /// Maximum rotation in degrees (either direction).
    pub rotation_range: f32,
    /// Maximum shift as a fraction of the image size.
    pub shift_range: f32,
    /// Maximum zoom deviation from 1.0.
    pub zoom_range: f32,
    /// Maximum brightness factor deviation from 1.0 (intensity channel only).
    pub brightness_range: f32,
    pub horizontal_flip: bool,
    pub seed: u64,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            copies: 1,
            rotation_range: 10.0,
            shift_range: 0.1,
            zoom_range: 0.1,
            brightness_range: 0.1,
            horizontal_flip: true,
            seed: 42,
        }
    }
}

/// Convolutional encoder-decoder hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UNetSettings {
    /// Channels of the first encoder block; doubled at each level.
    pub base_channels: usize,
    /// Number of resolution levels (1 = no pooling).
    pub depth: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Epochs without validation improvement before training stops (0 disables).
    pub patience: usize,
    pub seed: u64,
}

impl Default for UNetSettings {
    fn default() -> Self {
        Self {
            base_channels: 8,
            depth: 2,
            epochs: 25,
            batch_size: 32,
            learning_rate: 1e-3,
            patience: 5,
            seed: 42,
        }
    }
}

/// Gradient-boosted tree parameters (XGBoost naming).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BoostingSettings {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// Row fraction sampled per tree.
    pub subsample: f64,
    /// Column fraction sampled per tree.
    pub colsample_bytree: f64,
    /// L2 penalty on leaf weights.
    pub reg_lambda: f64,
    pub min_samples_leaf: usize,
    /// Quantile bins per feature.
    pub max_bins: usize,
    pub seed: u64,
}

impl Default for BoostingSettings {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.1,
            subsample: 1.0,
            colsample_bytree: 1.0,
            reg_lambda: 1.0,
            min_samples_leaf: 1,
            max_bins: 64,
            seed: 42,
        }
    }
}

/// Candidate values searched by the boosting grid search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningSettings {
    pub n_estimators: Vec<usize>,
    pub max_depth: Vec<usize>,
    pub learning_rate: Vec<f64>,
    pub subsample: Vec<f64>,
    pub colsample_bytree: Vec<f64>,
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            n_estimators: vec![50, 100],
            max_depth: vec![3, 5],
            learning_rate: vec![0.05, 0.1],
            subsample: vec![0.8, 1.0],
            colsample_bytree: vec![0.8],
        }
    }
}

impl TuningSettings {
    /// Number of parameter combinations in the grid.
    pub fn grid_size(&self) -> usize {
        self.n_estimators.len()
            * self.max_depth.len()
            * self.learning_rate.len()
            * self.subsample.len()
            * self.colsample_bytree.len()
    }
}

/// Random forest parameters (stacking base learner).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForestSettings {
    pub n_estimators: usize,
    pub max_depth: usize,
    /// Fraction of features considered at each split.
    pub max_features: f64,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestSettings {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 12,
            max_features: 0.33,
            min_samples_leaf: 1,
            seed: 42,
        }
    }
}

/// Gaussian-process grid search over kernel parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GaussianProcessSettings {
    pub length_scales: Vec<f64>,
    pub signal_sigmas: Vec<f64>,
    /// Observation noise added to the kernel diagonal.
    pub noise: f64,
}

impl Default for GaussianProcessSettings {
    fn default() -> Self {
        Self {
            length_scales: vec![0.1, 1.0, 10.0],
            signal_sigmas: vec![0.1, 1.0, 10.0],
            noise: 1.0,
        }
    }
}

/// Settings controlling optional step timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    /// Level for timing output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    pub fn level_filter(&self) -> LevelFilter {
        self.level.trim().parse().unwrap_or(LevelFilter::Debug)
    }

    pub fn set_level(&mut self, level: LevelFilter) {
        self.level = level.as_str().to_ascii_lowercase();
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppSettings {
    pub paths: PathSettings,
    pub geometry: GeometrySettings,
    pub alignment: AlignmentSettings,
    pub labels: LabelSettings,
    pub dataset: DatasetSettings,
    pub augmentation: AugmentationSettings,
    pub unet: UNetSettings,
    pub boosting: BoostingSettings,
    pub tuning: TuningSettings,
    pub forest: ForestSettings,
    pub gp: GaussianProcessSettings,
    pub telemetry: TelemetrySettings,
}

impl AppSettings {
    /// Load settings from a JSON file and check the geometry.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        settings
            .geometry
            .validate()
            .with_context(|| format!("invalid geometry in {}", path.display()))?;
        Ok(settings)
    }

    /// Write pretty-printed JSON, replacing any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }
}

/// Default settings location (`config/scanfit.json` under the working directory).
pub fn default_settings_path() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("config/scanfit.json"))
        .unwrap_or_else(|_| PathBuf::from("config/scanfit.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_round_trip() {
        let file = NamedTempFile::new().expect("tempfile");
        let settings = AppSettings::default();
        settings.save_to_path(file.path()).expect("save");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.geometry, settings.geometry);
        assert_eq!(loaded.alignment, settings.alignment);
        assert_eq!(loaded.paths, settings.paths);
        assert_eq!(loaded.tuning.grid_size(), settings.tuning.grid_size());
        assert_eq!(loaded.telemetry.level, settings.telemetry.level);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{
            "alignment": { "max_features": 250, "mode": "warp" },
            "unet": { "epochs": 3 }
        }"#;
        fs::write(file.path(), json).expect("write settings");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.alignment.max_features, 250);
        assert_eq!(loaded.alignment.mode, AlignmentMode::Warp);
        assert_eq!(loaded.alignment.max_delta, 200);
        assert_eq!(loaded.unet.epochs, 3);
        assert_eq!(loaded.unet.batch_size, 32);
        assert_eq!(loaded.geometry, GeometrySettings::default());
        assert_eq!(loaded.dataset.num_folds, 5);
    }

    #[test]
    fn rejects_roi_outside_page() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{ "geometry": { "crop_left": 400, "crop_width": 125 } }"#;
        fs::write(file.path(), json).expect("write settings");
        let err = AppSettings::load_from_path(file.path()).expect_err("should reject");
        assert!(format!("{err:#}").contains("does not fit"));
    }

    #[test]
    fn overflowing_geometry_is_rejected() {
        let geometry = GeometrySettings {
            crop_left: u32::MAX,
            crop_width: 2,
            ..GeometrySettings::default()
        };
        let err = geometry.validate().expect_err("crop overflow");
        assert!(err.to_string().contains("overflows"));

        let geometry = GeometrySettings {
            top: u32::MAX - 1,
            ..GeometrySettings::default()
        };
        let err = geometry.validate().expect_err("page overflow");
        assert!(err.to_string().contains("page region"));
    }

    #[test]
    fn alignment_mode_parses_aliases() {
        assert_eq!("Warp".parse::<AlignmentMode>(), Ok(AlignmentMode::Warp));
        assert_eq!("shift".parse::<AlignmentMode>(), Ok(AlignmentMode::Offset));
        assert!("rigid".parse::<AlignmentMode>().is_err());
        assert_eq!(AlignmentMode::Warp.to_string(), "warp");
    }

    #[test]
    fn telemetry_level_parses_variants() {
        let telemetry = TelemetrySettings {
            level: "TRACE".into(),
            ..TelemetrySettings::default()
        };
        assert_eq!(telemetry.level_filter(), LevelFilter::Trace);

        let telemetry = TelemetrySettings {
            level: "bogus".into(),
            ..TelemetrySettings::default()
        };
        assert_eq!(telemetry.level_filter(), LevelFilter::Debug);

        let mut telemetry = TelemetrySettings::default();
        telemetry.set_level(LevelFilter::Info);
        assert_eq!(telemetry.level, "info");
    }
}
