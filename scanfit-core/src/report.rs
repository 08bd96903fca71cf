//! Model comparison table: printed, written as CSV and summarized as JSON.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Result;
use log::info;
use ndarray::ArrayView1;
use scanfit_utils::{write_csv, write_json};
use serde::{Deserialize, Serialize};

use crate::{
    metrics::{BlandAltman, mean_absolute_error, r2_score, root_mean_squared_error},
    models::TrainingHistory,
    validation::{CrossValidationReport, TuningCandidate},
};

/// Output name of the comparison table.
pub const COMPARISON_CSV: &str = "optimized_model_comparison.csv";
/// Output name of the JSON run summary.
pub const SUMMARY_JSON: &str = "pipeline_summary.json";

/// One row of the comparison table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "MAE")]
    pub mae: f64,
    #[serde(rename = "RMSE")]
    pub rmse: f64,
}

impl ComparisonRow {
    pub fn evaluate(
        model: impl Into<String>,
        actual: ArrayView1<f64>,
        predicted: ArrayView1<f64>,
    ) -> Result<Self> {
        Ok(Self {
            model: model.into(),
            mae: mean_absolute_error(actual, predicted)?,
            rmse: root_mean_squared_error(actual, predicted)?,
        })
    }
}

/// Test-set metrics of one model beyond the table columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model: String,
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    pub bland_altman_bias: f64,
    pub bland_altman_upper: f64,
    pub bland_altman_lower: f64,
    /// Share of test points inside the limits of agreement.
    pub within_limits: f64,
}

impl ModelSummary {
    pub fn evaluate(
        model: impl Into<String>,
        actual: ArrayView1<f64>,
        predicted: ArrayView1<f64>,
    ) -> Result<(Self, BlandAltman)> {
        let agreement = BlandAltman::compute(actual, predicted)?;
        let summary = Self {
            model: model.into(),
            mae: mean_absolute_error(actual, predicted)?,
            rmse: root_mean_squared_error(actual, predicted)?,
            r2: r2_score(actual, predicted)?,
            bland_altman_bias: agreement.mean_diff,
            bland_altman_upper: agreement.upper,
            bland_altman_lower: agreement.lower,
            within_limits: agreement.within_limits(),
        };
        Ok((summary, agreement))
    }

    pub fn row(&self) -> ComparisonRow {
        ComparisonRow {
            model: self.model.clone(),
            mae: self.mae,
            rmse: self.rmse,
        }
    }
}

/// Everything a pipeline run reports, written as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub scans_loaded: usize,
    pub scans_aligned: usize,
    pub labelled_samples: usize,
    pub augmented_samples: usize,
    pub train_samples: usize,
    pub test_samples: usize,
    pub cross_validation: Option<CrossValidationReport>,
    pub best_boosting: Option<TuningCandidate>,
    pub unet_history: Option<TrainingHistory>,
    pub models: Vec<ModelSummary>,
    /// Files written by the run.
    pub artifacts: Vec<PathBuf>,
}

/// Fixed-width text table with a header, as printed to stdout.
pub fn format_table(rows: &[ComparisonRow]) -> String {
    let width = rows
        .iter()
        .map(|r| r.model.len())
        .chain(std::iter::once("Model".len()))
        .max()
        .unwrap_or(5);
    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:>10}  {:>10}", "Model", "MAE", "RMSE");
    for row in rows {
        let _ = writeln!(out, "{:<width$}  {:>10.4}  {:>10.4}", row.model, row.mae, row.rmse);
    }
    out
}

/// Write the comparison CSV under `dir`; returns its path.
pub fn write_comparison(rows: &[ComparisonRow], dir: &Path) -> Result<PathBuf> {
    let path = dir.join(COMPARISON_CSV);
    write_csv(rows, &path)?;
    info!("Wrote {}", path.display());
    Ok(path)
}

/// Write the JSON run summary under `dir`; returns its path.
pub fn write_summary(summary: &RunSummary, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(SUMMARY_JSON);
    write_json(summary, &path)?;
    info!("Wrote {}", path.display());
    Ok(path)
}
