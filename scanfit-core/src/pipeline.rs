//! End-to-end runs: preprocessing (page crop, alignment, ROI crop) and the
//! full training and comparison pipeline.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use scanfit_utils::{AlignmentMode, AppSettings, timing_guard};
use serde::{Deserialize, Serialize};

use crate::{
    align::{AlignmentOutcome, AlignmentStatus, align_images, warp_to_reference},
    augment::augment_images,
    cropper::{PageImage, SavedCrop, load_and_preprocess_images, preprocess_and_save_images},
    dataset::{Dataset, LabeledCrop, fold_count, load_labels_and_images, train_test_split},
    edges::{EdgeThresholds, edge_density, edge_map},
    geometry::ScanLayout,
    models::{ImageRegressor, InputShape, Regressor, TrainSchedule, build_unet_model},
    plots::{MAE_CHART_FILE, plot_all_bland_altman, plot_mae_comparison},
    report::{ModelSummary, RunSummary, SUMMARY_JSON, write_comparison, write_summary},
    validation::{cross_validate_model, train_ensemble_models, tune_hyperparameters},
};

pub const MODEL_UNET: &str = "UNet";
pub const MODEL_BOOSTING: &str = "XGBoost (Tuned)";
pub const MODEL_ENSEMBLE: &str = "Ensemble (Stacked)";

/// Share of the training split held back to drive early stopping of the
/// final image model.
pub const FINAL_VALIDATION_SHARE: f64 = 0.1;

/// Switches for [`run_pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Reuse crops already in the preprocessed directory.
    pub skip_preprocess: bool,
    /// Cross-validate the image model before the final fit.
    pub cross_validate: bool,
    /// Write the MAE chart and Bland-Altman plots.
    pub plots: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            skip_preprocess: false,
            cross_validate: true,
            plots: true,
        }
    }
}

/// Alignment result of one scan, as reported by the `align` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentRecord {
    pub image: String,
    pub dx: i32,
    pub dy: i32,
    pub raw_dx: i32,
    pub raw_dy: i32,
    pub aligned: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    pub keypoints: usize,
    pub matches: usize,
    pub inliers: usize,
}

impl AlignmentRecord {
    fn new(page: &PageImage, outcome: &AlignmentOutcome) -> Self {
        Self {
            image: page.name(),
            dx: outcome.offset.dx,
            dy: outcome.offset.dy,
            raw_dx: outcome.raw_offset.dx,
            raw_dy: outcome.raw_offset.dy,
            aligned: outcome.status.is_aligned(),
            reason: match &outcome.status {
                AlignmentStatus::Aligned => None,
                AlignmentStatus::Rejected(reason) => Some(reason.to_string()),
            },
            keypoints: outcome.keypoints,
            matches: outcome.matches,
            inliers: outcome.inliers,
        }
    }
}

/// Result of the preprocessing stage.
#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    pub records: Vec<AlignmentRecord>,
    pub crops: Vec<SavedCrop>,
}

impl PreprocessOutput {
    pub fn aligned(&self) -> usize {
        self.records.iter().filter(|r| r.aligned).count()
    }
}

/// Load every scan, cut the page region and align it against the first
/// scan. In warp mode aligned pages come back resampled into the reference
/// frame.
fn load_and_align(settings: &AppSettings) -> Result<(Vec<PageImage>, Vec<AlignmentOutcome>)> {
    settings.geometry.validate()?;
    let layout = ScanLayout::from(&settings.geometry);
    let pages = load_and_preprocess_images(&settings.paths.image_dir, &layout)?;
    anyhow::ensure!(
        !pages.is_empty(),
        "no usable scans in {}",
        settings.paths.image_dir.display()
    );
    let reference = pages[0].image.clone();
    debug!("Reference scan: {}", pages[0].name());
    let outcomes = align_images(&reference, &pages, &settings.alignment, layout);

    if settings.alignment.mode != AlignmentMode::Warp {
        return Ok((pages, outcomes));
    }
    let size = reference.dimensions();
    let warped: Vec<PageImage> = pages
        .into_par_iter()
        .zip(outcomes.par_iter())
        .map(|(page, outcome)| {
            let homography = outcome.homography.as_ref().filter(|_| outcome.status.is_aligned());
            match homography.and_then(|h| warp_to_reference(&page.image, h, size)) {
                Some(image) => PageImage {
                    source: page.source,
                    image,
                },
                None => page,
            }
        })
        .collect();
    Ok((warped, outcomes))
}

/// Offsets of every scan without writing anything.
pub fn align_only(settings: &AppSettings) -> Result<Vec<AlignmentRecord>> {
    let (pages, outcomes) = load_and_align(settings)?;
    Ok(pages
        .iter()
        .zip(&outcomes)
        .map(|(page, outcome)| AlignmentRecord::new(page, outcome))
        .collect())
}

/// Align every scan and save its ROI crop to the preprocessed directory.
pub fn preprocess(settings: &AppSettings) -> Result<PreprocessOutput> {
    let _guard = timing_guard("preprocess", log::Level::Info);
    let layout = ScanLayout::from(&settings.geometry);
    let (pages, outcomes) = load_and_align(settings)?;
    let crops = preprocess_and_save_images(
        &pages,
        &outcomes,
        &layout,
        &settings.paths.preprocessed_dir,
    )?;
    let records = pages
        .iter()
        .zip(&outcomes)
        .map(|(page, outcome)| AlignmentRecord::new(page, outcome))
        .collect();
    Ok(PreprocessOutput { records, crops })
}

fn log_edge_density(crops: &[LabeledCrop], thresholds: EdgeThresholds) {
    if crops.is_empty() {
        return;
    }
    let total: f32 = crops
        .par_iter()
        .map(|crop| edge_density(edge_map(&crop.image, thresholds).view()))
        .sum();
    debug!("Mean ROI edge density: {:.4}", total / crops.len() as f32);
}

/// Run the whole pipeline and write the comparison table, plots and summary
/// into `paths.output_dir`.
pub fn run_pipeline(settings: &AppSettings, options: PipelineOptions) -> Result<RunSummary> {
    let _guard = timing_guard("pipeline", log::Level::Info);
    let mut summary = RunSummary::default();

    if options.skip_preprocess {
        info!(
            "Skipping preprocessing; using crops in {}",
            settings.paths.preprocessed_dir.display()
        );
    } else {
        let output = preprocess(settings)?;
        summary.scans_loaded = output.records.len();
        summary.scans_aligned = output.aligned();
    }

    let crops = load_labels_and_images(
        &settings.paths.label_file,
        &settings.paths.preprocessed_dir,
        &settings.labels,
    )?;
    let ds = &settings.dataset;
    anyhow::ensure!(
        crops.len() >= 2,
        "need at least 2 labelled crops, found {}",
        crops.len()
    );
    summary.labelled_samples = crops.len();

    let thresholds = EdgeThresholds {
        low: ds.canny_low,
        high: ds.canny_high,
    };
    log_edge_density(&crops, thresholds);
    let dataset = Dataset::from_crops(&crops, ds.input_size, ds.edge_features.then_some(thresholds))?;

    let dataset = if settings.augmentation.copies > 0 {
        let (images, labels) =
            augment_images(dataset.images.view(), dataset.labels.view(), &settings.augmentation);
        summary.augmented_samples = labels.len();
        dataset.extended(images.view(), &labels, "aug")?
    } else {
        dataset
    };

    let (train_idx, test_idx) = train_test_split(dataset.len(), ds.test_size, ds.random_state);
    anyhow::ensure!(!test_idx.is_empty(), "test split is empty; raise dataset.test_size");
    anyhow::ensure!(
        train_idx.len() >= 2,
        "only {} training sample(s) after the split; add scans or enable augmentation",
        train_idx.len()
    );
    let train = dataset.select(&train_idx);
    let test = dataset.select(&test_idx);
    summary.train_samples = train.len();
    summary.test_samples = test.len();
    info!("Split {} sample(s): {} train / {} test", dataset.len(), train.len(), test.len());

    let shape = InputShape::from_chw(train.sample_shape());
    let schedule = TrainSchedule::from(&settings.unet);
    let folds = fold_count(ds.num_folds, train.len());
    if folds != ds.num_folds {
        warn!(
            "{} training sample(s) for {} folds; using {folds}-fold validation",
            train.len(),
            ds.num_folds
        );
    }
    if options.cross_validate {
        let report = cross_validate_model(
            || build_unet_model(shape, &settings.unet),
            train.images.view(),
            train.labels.view(),
            folds,
            &schedule,
            ds.random_state,
        )?;
        summary.cross_validation = Some(report);
    }

    let x_train = train.flatten();
    let x_test = test.flatten();
    let tuned = tune_hyperparameters(
        x_train.view(),
        train.labels.view(),
        &settings.tuning,
        &settings.boosting,
        folds,
        ds.random_state,
    )?;
    summary.best_boosting = Some(tuned.best.clone());
    let stack = train_ensemble_models(
        x_train.view(),
        train.labels.view(),
        &settings.forest,
        &settings.boosting,
        folds,
        ds.random_state,
    )?;

    info!("Training final UNet...");
    let (fit_idx, val_idx) = train_test_split(train.len(), FINAL_VALIDATION_SHARE, ds.random_state);
    let fit_set = train.select(&fit_idx);
    let val_set = train.select(&val_idx);
    let mut unet = build_unet_model(shape, &settings.unet)?;
    let validation = (!val_set.is_empty()).then(|| (val_set.images.view(), val_set.labels.view()));
    let history = unet
        .fit(fit_set.images.view(), fit_set.labels.view(), &schedule, validation)
        .context("failed to train the final UNet")?;
    info!(
        "UNet trained for {} epoch(s); kept epoch {}",
        history.epochs_run(),
        history.best_epoch + 1
    );
    summary.unet_history = Some(history);

    info!("Evaluating models on {} test sample(s)...", test.len());
    let predictions = [
        (MODEL_UNET, unet.predict(test.images.view())?),
        (MODEL_BOOSTING, tuned.model.predict(x_test.view())?),
        (MODEL_ENSEMBLE, stack.predict(x_test.view())?),
    ];
    let mut agreements = Vec::with_capacity(predictions.len());
    for (name, predicted) in &predictions {
        let (model, agreement) = ModelSummary::evaluate(*name, test.labels.view(), predicted.view())?;
        info!("{name}: MAE {:.4}, RMSE {:.4}", model.mae, model.rmse);
        summary.models.push(model);
        agreements.push((name.to_string(), agreement));
    }

    let out_dir = &settings.paths.output_dir;
    let rows: Vec<_> = summary.models.iter().map(ModelSummary::row).collect();
    summary.artifacts.push(write_comparison(&rows, out_dir)?);
    if options.plots {
        let chart = out_dir.join(MAE_CHART_FILE);
        let bars: Vec<(String, f64)> = rows.iter().map(|r| (r.model.clone(), r.mae)).collect();
        plot_mae_comparison(&bars, &chart)?;
        summary.artifacts.push(chart);
        summary
            .artifacts
            .extend(plot_all_bland_altman(&agreements, out_dir)?);
    }
    summary.artifacts.push(out_dir.join(SUMMARY_JSON));
    write_summary(&summary, out_dir)?;
    Ok(summary)
}
