//! Stacked ensemble: random forest + gradient boosting under a linear meta
//! model fitted on out-of-fold predictions.

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use scanfit_utils::{BoostingSettings, ForestSettings};

use super::{
    GradientBoostingRegressor, LinearRegression, RandomForestRegressor, Regressor,
    check_training_set,
};
use crate::dataset::{KFold, fold_count};
use crate::error::ModelError;

#[derive(Debug, Clone)]
pub struct StackingRegressor {
    pub n_folds: usize,
    pub seed: u64,
    forest: RandomForestRegressor,
    boosting: GradientBoostingRegressor,
    meta: LinearRegression,
    fitted: bool,
}

impl StackingRegressor {
    pub fn new(forest: ForestSettings, boosting: BoostingSettings, n_folds: usize, seed: u64) -> Self {
        Self {
            n_folds,
            seed,
            forest: RandomForestRegressor::new(forest),
            boosting: GradientBoostingRegressor::new(boosting),
            meta: LinearRegression::default(),
            fitted: false,
        }
    }

    /// Meta-model weights on `[forest, boosting]` and its intercept.
    pub fn meta_weights(&self) -> Option<(&Array1<f64>, f64)> {
        self.meta
            .coefficients()
            .filter(|_| self.fitted)
            .map(|w| (w, self.meta.intercept()))
    }

    fn base_predictions(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        let forest = self.forest.predict(x)?;
        let boosting = self.boosting.predict(x)?;
        let mut stacked = Array2::zeros((x.nrows(), 2));
        stacked.column_mut(0).assign(&forest);
        stacked.column_mut(1).assign(&boosting);
        Ok(stacked)
    }
}

impl Default for StackingRegressor {
    fn default() -> Self {
        Self::new(ForestSettings::default(), BoostingSettings::default(), 5, 42)
    }
}

impl Regressor for StackingRegressor {
    fn name(&self) -> &str {
        "Stacked Ensemble"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_set(x, y)?;
        let n = x.nrows();
        if n < 2 {
            return Err(ModelError::InvalidParameter(format!(
                "stacking needs at least 2 samples, got {n}"
            )));
        }
        let folds = KFold::new(fold_count(self.n_folds, n), self.seed)
            .split(n)
            .map_err(|e| ModelError::InvalidParameter(e.to_string()))?;

        let mut out_of_fold = Array2::<f64>::zeros((n, 2));
        for (fold, (train, validation)) in folds.iter().enumerate() {
            let x_train = x.select(Axis(0), train);
            let y_train = y.select(Axis(0), train);
            let x_val = x.select(Axis(0), validation);

            let mut forest = RandomForestRegressor::new(self.forest.settings.clone());
            forest.fit(x_train.view(), y_train.view())?;
            let mut boosting = GradientBoostingRegressor::new(self.boosting.settings.clone());
            boosting.fit(x_train.view(), y_train.view())?;

            let forest_pred = forest.predict(x_val.view())?;
            let boosting_pred = boosting.predict(x_val.view())?;
            for (k, &row) in validation.iter().enumerate() {
                out_of_fold[(row, 0)] = forest_pred[k];
                out_of_fold[(row, 1)] = boosting_pred[k];
            }
            debug!("stacking fold {fold}: {} train / {} held out", train.len(), validation.len());
        }

        self.meta.fit(out_of_fold.view(), y)?;
        self.forest.fit(x, y)?;
        self.boosting.fit(x, y)?;
        self.fitted = true;
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if !self.fitted {
            return Err(ModelError::NotFitted);
        }
        let stacked = self.base_predictions(x)?;
        self.meta.predict(stacked.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::{mae, step_problem};

    fn small_stack() -> StackingRegressor {
        StackingRegressor::new(
            ForestSettings {
                n_estimators: 20,
                ..ForestSettings::default()
            },
            BoostingSettings {
                n_estimators: 40,
                max_depth: 3,
                ..BoostingSettings::default()
            },
            3,
            7,
        )
    }

    #[test]
    fn stack_fits_and_weights_base_models() {
        let (x, y) = step_problem(240, 21);
        let mut stack = small_stack();
        stack.fit(x.view(), y.view()).expect("fit");
        let (weights, _) = stack.meta_weights().expect("fitted");
        assert_eq!(weights.len(), 2);
        assert!(weights.sum() > 0.5, "{weights}");

        let (x_test, y_test) = step_problem(80, 22);
        let err = mae(&stack.predict(x_test.view()).expect("predict"), &y_test);
        assert!(err < 0.5, "stack MAE {err}");
    }

    #[test]
    fn small_sets_use_fewer_folds() {
        let (x, y) = step_problem(3, 1);
        let mut stack = small_stack();
        stack.n_folds = 10;
        stack.fit(x.view(), y.view()).expect("fit with clamped folds");
        assert_eq!(stack.predict(x.view()).expect("predict").len(), 3);
    }

    #[test]
    fn predict_before_fit_fails() {
        let (x, _) = step_problem(4, 1);
        assert_eq!(small_stack().predict(x.view()), Err(ModelError::NotFitted));
        assert!(small_stack().meta_weights().is_none());
    }
}
