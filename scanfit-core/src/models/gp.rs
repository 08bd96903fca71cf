//! Gaussian-process regression with a squared-exponential kernel, and a grid
//! search over its length scale and signal amplitude.

use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use scanfit_utils::{GaussianProcessSettings, timing_guard};
use serde::{Deserialize, Serialize};

use super::{Regressor, check_features, check_training_set};
use crate::dataset::{KFold, fold_count};
use crate::error::ModelError;

/// Zero-mean GP with kernel `k(a, b) = σ · exp(-|a - b|² / (2ℓ²))` plus
/// `noise` on the diagonal of the training covariance.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    pub length_scale: f64,
    pub signal_sigma: f64,
    pub noise: f64,
    train: Option<Array2<f64>>,
    /// `(K + noise·I)⁻¹ y`
    weights: Option<DVector<f64>>,
    log_marginal_likelihood: f64,
}

impl GaussianProcess {
    pub fn new(length_scale: f64, signal_sigma: f64, noise: f64) -> Self {
        Self {
            length_scale,
            signal_sigma,
            noise,
            train: None,
            weights: None,
            log_marginal_likelihood: f64::NAN,
        }
    }

    fn kernel(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let d2: f64 = a.iter().zip(b.iter()).map(|(p, q)| (p - q) * (p - q)).sum();
        self.signal_sigma * (-d2 / (2.0 * self.length_scale * self.length_scale)).exp()
    }

    /// Log marginal likelihood of the training targets (NaN before `fit`).
    pub fn log_marginal_likelihood(&self) -> f64 {
        self.log_marginal_likelihood
    }
}

impl Regressor for GaussianProcess {
    fn name(&self) -> &str {
        "Gaussian Process"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_set(x, y)?;
        if self.length_scale <= 0.0 || self.signal_sigma <= 0.0 || self.noise < 0.0 {
            return Err(ModelError::InvalidParameter(format!(
                "length scale {} and sigma {} must be positive, noise {} non-negative",
                self.length_scale, self.signal_sigma, self.noise
            )));
        }
        let n = x.nrows();
        let mut covariance = DMatrix::from_fn(n, n, |i, j| self.kernel(x.row(i), x.row(j)));
        for d in 0..n {
            covariance[(d, d)] += self.noise;
        }
        let cholesky = covariance.cholesky().ok_or_else(|| {
            ModelError::Singular(format!("{n}x{n} kernel matrix is not positive definite"))
        })?;
        let targets = DVector::from_iterator(n, y.iter().copied());
        let weights = cholesky.solve(&targets);

        let log_det: f64 = cholesky.l_dirty().diagonal().iter().map(|v| v.ln()).sum();
        self.log_marginal_likelihood = -0.5 * targets.dot(&weights)
            - log_det
            - 0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln();
        self.train = Some(x.to_owned());
        self.weights = Some(weights);
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let (train, weights) = self
            .train
            .as_ref()
            .zip(self.weights.as_ref())
            .ok_or(ModelError::NotFitted)?;
        check_features(x, train.ncols())?;
        Ok(x
            .outer_iter()
            .map(|row| {
                train
                    .outer_iter()
                    .zip(weights.iter())
                    .map(|(t, w)| self.kernel(row, t) * w)
                    .sum()
            })
            .collect())
    }
}

/// How grid candidates are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpObjective {
    /// MSE of predictions on the training data itself.
    #[default]
    TrainingMse,
    /// Mean held-out MSE over shuffled K folds.
    CrossValidated { folds: usize, seed: u64 },
}

/// One evaluated grid point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpCandidate {
    pub length_scale: f64,
    pub signal_sigma: f64,
    pub mse: f64,
    pub log_marginal_likelihood: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpSearchResult {
    /// Candidates in grid order (length scales outer, sigmas inner).
    pub candidates: Vec<GpCandidate>,
    pub best: GpCandidate,
}

fn evaluate(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    length_scale: f64,
    signal_sigma: f64,
    noise: f64,
    objective: GpObjective,
) -> Result<GpCandidate, ModelError> {
    let mut gp = GaussianProcess::new(length_scale, signal_sigma, noise);
    let mse = match objective {
        GpObjective::TrainingMse => {
            gp.fit(x, y)?;
            mean_squared(&gp.predict(x)?, y)
        }
        GpObjective::CrossValidated { folds, seed } => {
            let splits = KFold::new(fold_count(folds, x.nrows()), seed)
                .split(x.nrows())
                .map_err(|e| ModelError::InvalidParameter(e.to_string()))?;
            let mut total = 0.0;
            for (train, validation) in &splits {
                let mut fold_gp = GaussianProcess::new(length_scale, signal_sigma, noise);
                fold_gp.fit(
                    x.select(Axis(0), train).view(),
                    y.select(Axis(0), train).view(),
                )?;
                let pred = fold_gp.predict(x.select(Axis(0), validation).view())?;
                total += mean_squared(&pred, y.select(Axis(0), validation).view());
            }
            gp.fit(x, y)?;
            total / splits.len() as f64
        }
    };
    Ok(GpCandidate {
        length_scale,
        signal_sigma,
        mse,
        log_marginal_likelihood: gp.log_marginal_likelihood(),
    })
}

fn mean_squared(pred: &Array1<f64>, y: ArrayView1<f64>) -> f64 {
    pred.iter()
        .zip(y.iter())
        .map(|(p, t)| (t - p) * (t - p))
        .sum::<f64>()
        / y.len().max(1) as f64
}

/// Evaluate every `(length_scale, signal_sigma)` pair and keep the lowest
/// MSE; ties keep the earlier grid point.
pub fn gp_grid_search(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    settings: &GaussianProcessSettings,
    objective: GpObjective,
) -> Result<GpSearchResult> {
    let _guard = timing_guard("gp grid search", log::Level::Info);
    anyhow::ensure!(
        !settings.length_scales.is_empty() && !settings.signal_sigmas.is_empty(),
        "grid needs at least one length scale and one sigma"
    );
    let grid: Vec<(f64, f64)> = settings
        .length_scales
        .iter()
        .flat_map(|l| settings.signal_sigmas.iter().map(move |s| (*l, *s)))
        .collect();
    info!(
        "Searching {} GP kernel setting(s) on {} sample(s)",
        grid.len(),
        x.nrows()
    );

    let candidates = grid
        .par_iter()
        .map(|&(l, s)| {
            evaluate(x, y, l, s, settings.noise, objective)
                .with_context(|| format!("length scale {l}, sigma {s}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut best = candidates[0];
    for candidate in &candidates {
        debug!(
            "lscale: {}, sigma: {}, mse: {}",
            candidate.length_scale, candidate.signal_sigma, candidate.mse
        );
        if candidate.mse < best.mse {
            best = *candidate;
        }
    }
    info!(
        "Best params - lscale: {}, sigma: {} (MSE {:.6})",
        best.length_scale, best.signal_sigma, best.mse
    );
    Ok(GpSearchResult { candidates, best })
}

/// Read a JSON array of numeric rows; the last column is the target.
pub fn load_matrix(path: &Path) -> Result<(Array2<f64>, Array1<f64>)> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let rows: Vec<Vec<f64>> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse numeric matrix in {}", path.display()))?;
    anyhow::ensure!(!rows.is_empty(), "{} contains no rows", path.display());
    let cols = rows[0].len();
    anyhow::ensure!(
        cols >= 2,
        "{} needs at least one feature column and a target column",
        path.display()
    );
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != cols) {
        anyhow::bail!(
            "row {i} of {} has {} value(s), expected {cols}",
            path.display(),
            row.len()
        );
    }
    let inputs = Array2::from_shape_fn((rows.len(), cols - 1), |(i, j)| rows[i][j]);
    let targets = rows.iter().map(|r| r[cols - 1]).collect();
    Ok((inputs, targets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::fs;
    use tempfile::tempdir;

    fn sine(n: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 / n as f64 * 6.0);
        let y = x.column(0).mapv(f64::sin);
        (x, y)
    }

    #[test]
    fn interpolates_smooth_function_with_small_noise() {
        let (x, y) = sine(30);
        let mut gp = GaussianProcess::new(1.0, 1.0, 1e-6);
        gp.fit(x.view(), y.view()).expect("fit");
        let pred = gp.predict(array![[1.55], [3.05]].view()).expect("predict");
        assert!((pred[0] - 1.55f64.sin()).abs() < 0.02, "{pred}");
        assert!((pred[1] - 3.05f64.sin()).abs() < 0.02, "{pred}");
        assert!(gp.log_marginal_likelihood().is_finite());
    }

    #[test]
    fn far_points_revert_to_zero_mean() {
        let (x, y) = sine(10);
        let mut gp = GaussianProcess::new(0.5, 1.0, 0.1);
        gp.fit(x.view(), y.view()).expect("fit");
        let pred = gp.predict(array![[100.0]].view()).expect("predict");
        assert!(pred[0].abs() < 1e-9);
    }

    #[test]
    fn grid_search_prefers_low_training_error() {
        let (x, y) = sine(25);
        let settings = GaussianProcessSettings::default();
        let result = gp_grid_search(x.view(), y.view(), &settings, GpObjective::TrainingMse)
            .expect("search");
        assert_eq!(result.candidates.len(), 9);
        assert_eq!(result.candidates[0].length_scale, 0.1);
        assert_eq!(result.candidates[1].signal_sigma, 1.0);
        let min = result
            .candidates
            .iter()
            .map(|c| c.mse)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(result.best.mse, min);
    }

    #[test]
    fn cross_validated_objective_runs() {
        let (x, y) = sine(20);
        let settings = GaussianProcessSettings {
            length_scales: vec![0.5, 2.0],
            signal_sigmas: vec![1.0],
            noise: 0.01,
        };
        let result = gp_grid_search(
            x.view(),
            y.view(),
            &settings,
            GpObjective::CrossValidated { folds: 4, seed: 1 },
        )
        .expect("search");
        assert_eq!(result.candidates.len(), 2);
        assert!(result.best.mse.is_finite());
    }

    #[test]
    fn load_matrix_splits_target_and_rejects_ragged_rows() {
        let dir = tempdir().expect("tempdir");
        let good = dir.path().join("data.json");
        fs::write(&good, "[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]").expect("write");
        let (x, y) = load_matrix(&good).expect("load");
        assert_eq!(x, array![[1.0, 2.0], [4.0, 5.0]]);
        assert_eq!(y, array![3.0, 6.0]);

        let ragged = dir.path().join("ragged.json");
        fs::write(&ragged, "[[1.0, 2.0], [3.0]]").expect("write");
        let err = load_matrix(&ragged).expect_err("ragged");
        assert!(err.to_string().contains("row 1"));
    }
}
