//! Model selection: K-fold cross-validation of the image model, the boosting
//! grid search and stacked-ensemble training.

use anyhow::{Context, Result};
use log::{debug, info};
use ndarray::{Array1, ArrayView1, ArrayView2, ArrayView4, Axis};
use rayon::prelude::*;
use scanfit_utils::{BoostingSettings, ForestSettings, TuningSettings, timing_guard};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::{KFold, fold_count},
    error::ModelError,
    metrics::mean_absolute_error,
    models::{
        BinnedMatrix, GradientBoostingRegressor, ImageRegressor, Regressor, StackingRegressor,
        TrainSchedule,
    },
};

/// Per-fold MAE of a cross-validated model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationReport {
    pub model: String,
    pub fold_mae: Vec<f64>,
    pub mean_mae: f64,
    /// Population standard deviation across folds.
    pub std_mae: f64,
}

impl CrossValidationReport {
    fn from_folds(model: String, fold_mae: Vec<f64>) -> Self {
        let n = fold_mae.len().max(1) as f64;
        let mean_mae = fold_mae.iter().sum::<f64>() / n;
        let std_mae = (fold_mae.iter().map(|m| (m - mean_mae).powi(2)).sum::<f64>() / n).sqrt();
        Self {
            model,
            fold_mae,
            mean_mae,
            std_mae,
        }
    }
}

/// Train a fresh model from `model_fn` on each of `n_splits` shuffled folds
/// and score it by MAE on the held-out fold. Fewer samples than folds lowers
/// the fold count (see [`fold_count`]).
pub fn cross_validate_model<M, F>(
    model_fn: F,
    images: ArrayView4<f32>,
    labels: ArrayView1<f64>,
    n_splits: usize,
    schedule: &TrainSchedule,
    seed: u64,
) -> Result<CrossValidationReport>
where
    M: ImageRegressor,
    F: Fn() -> Result<M, ModelError>,
{
    let _guard = timing_guard("cross-validate", log::Level::Info);
    anyhow::ensure!(
        images.dim().0 == labels.len(),
        "{} image(s) but {} label(s)",
        images.dim().0,
        labels.len()
    );
    let folds = KFold::new(fold_count(n_splits, labels.len()), seed).split(labels.len())?;
    let mut name = String::new();
    let mut fold_mae = Vec::with_capacity(folds.len());
    for (fold, (train, validation)) in folds.iter().enumerate() {
        let mut model = model_fn().context("failed to build model")?;
        if name.is_empty() {
            name = model.name().to_string();
        }
        let train_images = images.select(Axis(0), train);
        let train_labels = labels.select(Axis(0), train);
        model
            .fit(train_images.view(), train_labels.view(), schedule, None)
            .with_context(|| format!("training fold {} of {}", fold + 1, folds.len()))?;
        let predictions = model.predict(images.select(Axis(0), validation).view())?;
        let mae = mean_absolute_error(labels.select(Axis(0), validation).view(), predictions.view())?;
        info!("{name} fold {}/{}: MAE {mae:.4}", fold + 1, folds.len());
        fold_mae.push(mae);
    }
    let report = CrossValidationReport::from_folds(name, fold_mae);
    info!(
        "{} cross-validation MAE: {:.4} (+/- {:.4})",
        report.model, report.mean_mae, report.std_mae
    );
    Ok(report)
}

/// One evaluated point of the boosting grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningCandidate {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub subsample: f64,
    pub colsample_bytree: f64,
    /// Mean held-out MAE across folds.
    pub mae: f64,
}

impl TuningCandidate {
    fn apply(&self, base: &BoostingSettings) -> BoostingSettings {
        BoostingSettings {
            n_estimators: self.n_estimators,
            max_depth: self.max_depth,
            learning_rate: self.learning_rate,
            subsample: self.subsample,
            colsample_bytree: self.colsample_bytree,
            ..base.clone()
        }
    }
}

/// Grid-search result with the best settings refitted on all rows.
#[derive(Debug, Clone)]
pub struct TuningResult {
    pub candidates: Vec<TuningCandidate>,
    pub best: TuningCandidate,
    pub best_settings: BoostingSettings,
    pub model: GradientBoostingRegressor,
}

fn grid(tuning: &TuningSettings) -> Vec<TuningCandidate> {
    let mut points = Vec::with_capacity(tuning.grid_size());
    for &n_estimators in &tuning.n_estimators {
        for &max_depth in &tuning.max_depth {
            for &learning_rate in &tuning.learning_rate {
                for &subsample in &tuning.subsample {
                    for &colsample_bytree in &tuning.colsample_bytree {
                        points.push(TuningCandidate {
                            n_estimators,
                            max_depth,
                            learning_rate,
                            subsample,
                            colsample_bytree,
                            mae: f64::INFINITY,
                        });
                    }
                }
            }
        }
    }
    points
}

/// Search the boosting grid by K-fold MAE and refit the best point on every
/// row. Features are binned once and shared by all folds; ties keep the
/// earlier grid point.
pub fn tune_hyperparameters(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    tuning: &TuningSettings,
    base: &BoostingSettings,
    n_folds: usize,
    seed: u64,
) -> Result<TuningResult> {
    let _guard = timing_guard("tune boosting", log::Level::Info);
    anyhow::ensure!(x.nrows() == y.len(), "{} row(s) but {} target(s)", x.nrows(), y.len());
    let points = grid(tuning);
    anyhow::ensure!(!points.is_empty(), "tuning grid is empty");
    let n_folds = fold_count(n_folds, x.nrows());
    info!(
        "Tuning gradient boosting over {} combination(s) with {n_folds}-fold CV...",
        points.len()
    );

    let folds = KFold::new(n_folds, seed).split(x.nrows())?;
    let binned = BinnedMatrix::new(x, base.max_bins);
    let targets = y.to_vec();

    let candidates = points
        .into_par_iter()
        .map(|mut point| -> Result<TuningCandidate> {
            let settings = point.apply(base);
            let mut total = 0.0;
            for (train, validation) in &folds {
                let mut model = GradientBoostingRegressor::new(settings.clone());
                model.fit_binned(&binned, &targets, train)?;
                let predicted = Array1::from(model.predict_binned(&binned, validation)?);
                let actual = y.select(Axis(0), validation);
                total += mean_absolute_error(actual.view(), predicted.view())?;
            }
            point.mae = total / folds.len() as f64;
            debug!(
                "n_estimators={} max_depth={} learning_rate={} subsample={} colsample_bytree={}: MAE {:.4}",
                point.n_estimators,
                point.max_depth,
                point.learning_rate,
                point.subsample,
                point.colsample_bytree,
                point.mae
            );
            Ok(point)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut best = &candidates[0];
    for candidate in &candidates {
        if candidate.mae < best.mae {
            best = candidate;
        }
    }
    let best = best.clone();
    let best_settings = best.apply(base);
    info!(
        "Best boosting params: n_estimators={}, max_depth={}, learning_rate={}, subsample={}, colsample_bytree={} (CV MAE {:.4})",
        best.n_estimators,
        best.max_depth,
        best.learning_rate,
        best.subsample,
        best.colsample_bytree,
        best.mae
    );

    let mut model = GradientBoostingRegressor::new(best_settings.clone());
    let rows: Vec<usize> = (0..x.nrows()).collect();
    model
        .fit_binned(&binned, &targets, &rows)
        .context("failed to refit the best boosting model")?;
    Ok(TuningResult {
        candidates,
        best,
        best_settings,
        model,
    })
}

/// Fit the stacked ensemble (random forest + boosting under a linear meta
/// model).
pub fn train_ensemble_models(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    forest: &ForestSettings,
    boosting: &BoostingSettings,
    n_folds: usize,
    seed: u64,
) -> Result<StackingRegressor> {
    let _guard = timing_guard("train ensemble", log::Level::Info);
    info!("Training stacked ensemble on {} sample(s)...", x.nrows());
    let mut stack = StackingRegressor::new(forest.clone(), boosting.clone(), n_folds, seed);
    stack.fit(x, y).context("failed to fit the stacked ensemble")?;
    if let Some((weights, intercept)) = stack.meta_weights() {
        debug!("Meta model weights {weights} + {intercept:.4}");
    }
    Ok(stack)
}
