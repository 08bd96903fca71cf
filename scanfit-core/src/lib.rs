//! Core scanfit primitives.
//!
//! This crate aligns scanned pages against a reference scan with ORB
//! features and a RANSAC homography, crops the region of interest, builds
//! augmented image datasets, and trains and compares the regression models
//! that predict one value per crop.

/// ORB + homography alignment against a reference page.
pub mod align;
/// Random affine and brightness augmentation.
pub mod augment;
/// Page and ROI extraction.
pub mod cropper;
/// Labelled image tensors, splits and folds.
pub mod dataset;
/// Canny edge maps.
pub mod edges;
/// Typed model and homography errors.
pub mod error;
/// FAST keypoints, steered BRIEF descriptors and Hamming matching.
pub mod features;
/// Page, ROI and offset geometry.
pub mod geometry;
/// DLT and RANSAC homography estimation.
pub mod homography;
/// Regression error metrics and Bland-Altman statistics.
pub mod metrics;
/// Flat-feature and image regressors.
pub mod models;
/// End-to-end preprocessing and training runs.
pub mod pipeline;
/// MAE bar chart and Bland-Altman plots.
pub mod plots;
/// Comparison table and run summary.
pub mod report;
/// Cross-validation, grid search and ensemble training.
pub mod validation;

pub use align::{AlignmentOutcome, AlignmentStatus, Aligner, RejectReason, align_images};
pub use augment::{AugmentParams, augment_images};
pub use cropper::{PageImage, SavedCrop, load_and_preprocess_images, preprocess_and_save_images};
pub use dataset::{
    Dataset, KFold, LabeledCrop, fold_count, load_labels_and_images, train_test_split,
};
pub use error::{HomographyError, ModelError};
pub use geometry::{Offset, OffsetBounds, PageRegion, RoiWindow, ScanLayout};
pub use homography::Homography;
pub use metrics::{BlandAltman, mean_absolute_error, root_mean_squared_error};
pub use models::{ImageRegressor, Regressor, TrainSchedule, build_unet_model};
pub use pipeline::{
    AlignmentRecord, PipelineOptions, PreprocessOutput, align_only, preprocess, run_pipeline,
};
pub use report::{ComparisonRow, ModelSummary, RunSummary, format_table};
pub use validation::{cross_validate_model, train_ensemble_models, tune_hyperparameters};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
