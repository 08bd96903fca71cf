//! Regression models used by the pipeline.
//!
//! Flat-feature models implement [`Regressor`]; the convolutional model works
//! on `(samples, channels, height, width)` tensors and implements
//! [`ImageRegressor`].

pub mod boosting;
pub mod forest;
pub mod gp;
mod layers;
pub mod linear;
pub mod scaler;
pub mod stacking;
pub mod tree;
pub mod unet;

use ndarray::{Array1, ArrayView1, ArrayView2, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

pub use boosting::GradientBoostingRegressor;
pub use forest::RandomForestRegressor;
pub use gp::{
    GaussianProcess, GpCandidate, GpObjective, GpSearchResult, gp_grid_search, load_matrix,
};
pub use linear::LinearRegression;
pub use scaler::StandardScaler;
pub use stacking::StackingRegressor;
pub use tree::{BinnedMatrix, RegressionTree, TreeParams};
pub use unet::{InputShape, UNetRegressor, build_unet_model};

/// Model trained on flat `(samples, features)` matrices.
pub trait Regressor: Send + Sync + std::fmt::Debug {
    /// Short display name.
    fn name(&self) -> &str;

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError>;

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError>;
}

/// Mini-batch training schedule for image models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainSchedule {
    pub epochs: usize,
    pub batch_size: usize,
    /// Epochs without validation improvement before stopping (0 disables).
    pub patience: usize,
}

impl Default for TrainSchedule {
    fn default() -> Self {
        Self {
            epochs: 25,
            batch_size: 32,
            patience: 5,
        }
    }
}

impl From<&scanfit_utils::UNetSettings> for TrainSchedule {
    fn from(settings: &scanfit_utils::UNetSettings) -> Self {
        Self {
            epochs: settings.epochs,
            batch_size: settings.batch_size,
            patience: settings.patience,
        }
    }
}

/// Per-epoch losses recorded while training an image model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Mean squared error on the standardized training targets.
    pub train_loss: Vec<f64>,
    /// Validation MAE in label units, when a validation set was supplied.
    pub val_mae: Vec<f64>,
    /// Epoch whose weights were kept (0-based).
    pub best_epoch: usize,
    pub stopped_early: bool,
}

impl TrainingHistory {
    pub fn epochs_run(&self) -> usize {
        self.train_loss.len()
    }
}

/// Validation images and labels passed alongside the training set.
pub type ValidationSet<'a> = (ArrayView4<'a, f32>, ArrayView1<'a, f64>);

/// Model trained directly on image tensors.
pub trait ImageRegressor: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn fit(
        &mut self,
        images: ArrayView4<f32>,
        targets: ArrayView1<f64>,
        schedule: &TrainSchedule,
        validation: Option<ValidationSet<'_>>,
    ) -> Result<TrainingHistory, ModelError>;

    fn predict(&self, images: ArrayView4<f32>) -> Result<Array1<f64>, ModelError>;
}

/// Shared argument checks for `fit`.
pub(crate) fn check_training_set(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
    if x.nrows() == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }
    if x.nrows() != y.len() {
        return Err(ModelError::shape(
            format!("{} target(s)", x.nrows()),
            format!("{} target(s)", y.len()),
        ));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(ModelError::InvalidParameter(
            "training data contains non-finite values".into(),
        ));
    }
    Ok(())
}

/// Shared argument checks for `predict`.
pub(crate) fn check_features(x: ArrayView2<f64>, expected: usize) -> Result<(), ModelError> {
    if x.ncols() != expected {
        return Err(ModelError::shape(
            format!("{expected} feature(s)"),
            format!("{} feature(s)", x.ncols()),
        ));
    }
    Ok(())
}
