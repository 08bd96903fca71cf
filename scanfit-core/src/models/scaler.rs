//! Per-column standardization.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::error::ModelError;

/// Removes the column mean and divides by the population standard
/// deviation. Constant columns keep a scale of 1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StandardScaler {
    mean: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
}

impl StandardScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fit(&mut self, x: ArrayView2<f64>) -> Result<&mut Self, ModelError> {
        if x.nrows() == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        let mean = x
            .mean_axis(Axis(0))
            .ok_or(ModelError::EmptyTrainingSet)?;
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f64::EPSILON { s } else { 1.0 });
        self.mean = Some(mean);
        self.scale = Some(scale);
        Ok(self)
    }

    fn params(&self, width: usize) -> Result<(&Array1<f64>, &Array1<f64>), ModelError> {
        let (mean, scale) = self
            .mean
            .as_ref()
            .zip(self.scale.as_ref())
            .ok_or(ModelError::NotFitted)?;
        if mean.len() != width {
            return Err(ModelError::shape(
                format!("{} column(s)", mean.len()),
                format!("{width} column(s)"),
            ));
        }
        Ok((mean, scale))
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        let (mean, scale) = self.params(x.ncols())?;
        Ok((&x - mean) / scale)
    }

    pub fn fit_transform(&mut self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        self.fit(x)?;
        self.transform(x)
    }

    pub fn inverse_transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        let (mean, scale) = self.params(x.ncols())?;
        Ok(&x * scale + mean)
    }

    /// Standardize a single target column.
    pub fn fit_transform_column(&mut self, y: ArrayView1<f64>) -> Result<Array1<f64>, ModelError> {
        let column = y.insert_axis(Axis(1));
        Ok(self.fit_transform(column)?.column(0).to_owned())
    }

    /// Map standardized values of a single column back to label units.
    pub fn inverse_column(&self, y: ArrayView1<f64>) -> Result<Array1<f64>, ModelError> {
        let column = y.insert_axis(Axis(1));
        Ok(self.inverse_transform(column)?.column(0).to_owned())
    }

    pub fn mean(&self) -> Option<&Array1<f64>> {
        self.mean.as_ref()
    }

    pub fn scale(&self) -> Option<&Array1<f64>> {
        self.scale.as_ref()
    }
}
