//! Bagged regression trees with per-node feature subsampling.

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use scanfit_utils::ForestSettings;

use super::tree::{BinnedMatrix, RegressionTree, TreeParams};
use super::{Regressor, check_features, check_training_set};
use crate::error::ModelError;

const FOREST_BINS: usize = 64;

/// Random forest; tree `i` draws its bootstrap sample and feature subsets
/// from `seed + i`, so results do not depend on thread scheduling.
#[derive(Debug, Clone)]
pub struct RandomForestRegressor {
    pub settings: ForestSettings,
    trees: Vec<RegressionTree>,
    n_features: usize,
}

impl RandomForestRegressor {
    pub fn new(settings: ForestSettings) -> Self {
        Self {
            settings,
            trees: Vec::new(),
            n_features: 0,
        }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    fn tree_params(&self, n_features: usize) -> TreeParams {
        let fraction = self.settings.max_features.clamp(0.0, 1.0);
        let per_node = ((fraction * n_features as f64).ceil() as usize).clamp(1, n_features.max(1));
        TreeParams {
            max_depth: self.settings.max_depth,
            min_samples_leaf: self.settings.min_samples_leaf,
            lambda: 0.0,
            max_features: Some(per_node),
        }
    }

    /// Fit on `rows` of a pre-binned matrix.
    pub fn fit_binned(
        &mut self,
        binned: &BinnedMatrix,
        targets: &[f64],
        rows: &[usize],
    ) -> Result<(), ModelError> {
        if rows.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        if self.settings.n_estimators == 0 {
            return Err(ModelError::InvalidParameter(
                "forest needs at least one tree".into(),
            ));
        }
        let n_features = binned.n_features();
        let params = self.tree_params(n_features);
        let features: Vec<usize> = (0..n_features).collect();
        let seed = self.settings.seed;

        let trees = (0..self.settings.n_estimators)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                let sample: Vec<usize> = (0..rows.len())
                    .map(|_| rows[rng.gen_range(0..rows.len())])
                    .collect();
                RegressionTree::fit(binned, targets, &sample, &features, &params, &mut rng)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.trees = trees;
        self.n_features = n_features;
        Ok(())
    }
}

impl Default for RandomForestRegressor {
    fn default() -> Self {
        Self::new(ForestSettings::default())
    }
}

impl Regressor for RandomForestRegressor {
    fn name(&self) -> &str {
        "Random Forest"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_set(x, y)?;
        let binned = BinnedMatrix::new(x, FOREST_BINS);
        let targets = y.to_vec();
        let rows: Vec<usize> = (0..x.nrows()).collect();
        self.fit_binned(&binned, &targets, &rows)
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if self.trees.is_empty() {
            return Err(ModelError::NotFitted);
        }
        check_features(x, self.n_features)?;
        let n_trees = self.trees.len() as f64;
        let predictions: Vec<f64> = (0..x.nrows())
            .into_par_iter()
            .map(|r| {
                let row = x.row(r);
                self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees
            })
            .collect();
        Ok(Array1::from(predictions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::{mae, step_problem};

    fn small_forest(seed: u64) -> RandomForestRegressor {
        RandomForestRegressor::new(ForestSettings {
            n_estimators: 30,
            max_depth: 6,
            max_features: 0.5,
            min_samples_leaf: 1,
            seed,
        })
    }

    #[test]
    fn fits_step_target() {
        let (x, y) = step_problem(300, 5);
        let mut forest = small_forest(1);
        forest.fit(x.view(), y.view()).expect("fit");
        assert_eq!(forest.n_trees(), 30);

        let (x_test, y_test) = step_problem(100, 6);
        let pred = forest.predict(x_test.view()).expect("predict");
        let err = mae(&pred, &y_test);
        assert!(err < 0.5, "forest MAE {err}");
    }

    #[test]
    fn seeded_forests_are_reproducible() {
        let (x, y) = step_problem(120, 2);
        let mut a = small_forest(9);
        let mut b = small_forest(9);
        a.fit(x.view(), y.view()).expect("fit");
        b.fit(x.view(), y.view()).expect("fit");
        assert_eq!(
            a.predict(x.view()).expect("predict"),
            b.predict(x.view()).expect("predict")
        );
    }

    #[test]
    fn unfitted_forest_refuses_to_predict() {
        let (x, _) = step_problem(4, 0);
        assert_eq!(
            RandomForestRegressor::default().predict(x.view()),
            Err(ModelError::NotFitted)
        );
    }
}
