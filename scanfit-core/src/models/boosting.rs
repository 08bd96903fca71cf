//! Gradient-boosted regression trees with squared-error loss.
//!
//! Each round fits a tree to the current residuals on a row/column sample,
//! shrinks its leaves by the learning rate and adds it to the ensemble. Leaf
//! values carry the L2 penalty `G / (n + reg_lambda)`.

use log::trace;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::{SeedableRng, rngs::StdRng, seq::index::sample};
use scanfit_utils::BoostingSettings;

use super::tree::{BinnedMatrix, RegressionTree, TreeParams};
use super::{Regressor, check_features, check_training_set};
use crate::error::ModelError;

#[derive(Debug, Clone)]
pub struct GradientBoostingRegressor {
    pub settings: BoostingSettings,
    base_score: f64,
    trees: Vec<RegressionTree>,
    n_features: usize,
    /// Training MSE after each round.
    loss_history: Vec<f64>,
}

impl GradientBoostingRegressor {
    pub fn new(settings: BoostingSettings) -> Self {
        Self {
            settings,
            base_score: 0.0,
            trees: Vec::new(),
            n_features: 0,
            loss_history: Vec::new(),
        }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    /// Predict `rows` of the matrix the model was fitted on with
    /// [`fit_binned`](Self::fit_binned).
    pub fn predict_binned(&self, binned: &BinnedMatrix, rows: &[usize]) -> Result<Vec<f64>, ModelError> {
        if self.trees.is_empty() {
            return Err(ModelError::NotFitted);
        }
        Ok(rows
            .iter()
            .map(|&r| {
                self.base_score
                    + self
                        .trees
                        .iter()
                        .map(|t| t.predict_binned(binned, r))
                        .sum::<f64>()
            })
            .collect())
    }

    fn validate(&self) -> Result<(), ModelError> {
        let s = &self.settings;
        if s.n_estimators == 0 {
            return Err(ModelError::InvalidParameter(
                "n_estimators must be positive".into(),
            ));
        }
        if s.learning_rate.is_nan() || s.learning_rate <= 0.0 {
            return Err(ModelError::InvalidParameter(format!(
                "learning_rate must be positive, got {}",
                s.learning_rate
            )));
        }
        for (name, value) in [("subsample", s.subsample), ("colsample_bytree", s.colsample_bytree)] {
            if value.is_nan() || value <= 0.0 || value > 1.0 {
                return Err(ModelError::InvalidParameter(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Fit on `rows` of a pre-binned matrix; `targets` is indexed by row of
    /// `binned`. Lets a grid search bin the features once for every fold.
    pub fn fit_binned(
        &mut self,
        binned: &BinnedMatrix,
        targets: &[f64],
        rows: &[usize],
    ) -> Result<(), ModelError> {
        self.validate()?;
        if rows.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let s = &self.settings;
        let n_features = binned.n_features();
        let base = rows.iter().map(|r| targets[*r]).sum::<f64>() / rows.len() as f64;
        let params = TreeParams {
            max_depth: s.max_depth,
            min_samples_leaf: s.min_samples_leaf,
            lambda: s.reg_lambda,
            max_features: None,
        };
        let rows_per_tree = ((s.subsample * rows.len() as f64).round() as usize).clamp(1, rows.len());
        let cols_per_tree =
            ((s.colsample_bytree * n_features as f64).round() as usize).clamp(1, n_features.max(1));

        let mut rng = StdRng::seed_from_u64(s.seed);
        let mut predictions = vec![base; binned.n_rows()];
        let mut residuals = vec![0.0; binned.n_rows()];
        let mut trees = Vec::with_capacity(s.n_estimators);
        let mut history = Vec::with_capacity(s.n_estimators);

        for round in 0..s.n_estimators {
            for &r in rows {
                residuals[r] = targets[r] - predictions[r];
            }
            let tree_rows: Vec<usize> = if rows_per_tree < rows.len() {
                sample(&mut rng, rows.len(), rows_per_tree)
                    .into_iter()
                    .map(|i| rows[i])
                    .collect()
            } else {
                rows.to_vec()
            };
            let mut columns: Vec<usize> = if cols_per_tree < n_features {
                sample(&mut rng, n_features, cols_per_tree).into_vec()
            } else {
                (0..n_features).collect()
            };
            columns.sort_unstable();

            let mut tree =
                RegressionTree::fit(binned, &residuals, &tree_rows, &columns, &params, &mut rng)?;
            tree.scale_leaves(s.learning_rate);
            let mut sse = 0.0;
            for &r in rows {
                predictions[r] += tree.predict_binned(binned, r);
                let e = targets[r] - predictions[r];
                sse += e * e;
            }
            let loss = sse / rows.len() as f64;
            trace!("boosting round {round}: train MSE {loss:.6}");
            history.push(loss);
            trees.push(tree);
        }

        self.base_score = base;
        self.trees = trees;
        self.n_features = n_features;
        self.loss_history = history;
        Ok(())
    }
}

impl Default for GradientBoostingRegressor {
    fn default() -> Self {
        Self::new(BoostingSettings::default())
    }
}

impl Regressor for GradientBoostingRegressor {
    fn name(&self) -> &str {
        "Gradient Boosting"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_set(x, y)?;
        let binned = BinnedMatrix::new(x, self.settings.max_bins);
        let targets = y.to_vec();
        let rows: Vec<usize> = (0..x.nrows()).collect();
        self.fit_binned(&binned, &targets, &rows)
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if self.trees.is_empty() {
            return Err(ModelError::NotFitted);
        }
        check_features(x, self.n_features)?;
        Ok(x
            .outer_iter()
            .map(|row| {
                self.base_score + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
            })
            .collect())
    }
}
