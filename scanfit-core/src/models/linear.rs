//! Ridge-stabilized ordinary least squares.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

use super::{Regressor, check_features, check_training_set};
use crate::error::ModelError;

/// Least-squares linear model with an intercept.
///
/// A small ridge term keeps the normal equations solvable when features are
/// collinear or outnumber the samples; in the latter case the dual system
/// `(X Xᵀ + αI) a = y` is solved instead of the primal one.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearRegression {
    pub alpha: f64,
    pub fit_intercept: bool,
    coef: Option<Array1<f64>>,
    intercept: f64,
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self::new(1e-8)
    }
}

impl LinearRegression {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            fit_intercept: true,
            coef: None,
            intercept: 0.0,
        }
    }

    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.coef.as_ref()
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }
}

impl Regressor for LinearRegression {
    fn name(&self) -> &str {
        "Linear Regression"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_set(x, y)?;
        if self.alpha.is_nan() || self.alpha < 0.0 {
            return Err(ModelError::InvalidParameter(format!(
                "alpha must be non-negative, got {}",
                self.alpha
            )));
        }
        let (n, p) = x.dim();
        let (x_mean, y_mean) = if self.fit_intercept {
            (
                x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p)),
                y.mean().unwrap_or(0.0),
            )
        } else {
            (Array1::zeros(p), 0.0)
        };

        let xc = DMatrix::from_fn(n, p, |i, j| x[(i, j)] - x_mean[j]);
        let yc = DVector::from_fn(n, |i, _| y[i] - y_mean);
        // Scale the ridge term with the data so `alpha` stays unit-free.
        let scale = xc.iter().map(|v| v * v).sum::<f64>().max(1.0) / n as f64;
        let ridge = self.alpha * scale;

        let weights = if p <= n {
            let mut gram = xc.transpose() * &xc;
            for d in 0..p {
                gram[(d, d)] += ridge;
            }
            solve_spd(gram, xc.transpose() * &yc)?
        } else {
            let mut gram = &xc * xc.transpose();
            for d in 0..n {
                gram[(d, d)] += ridge;
            }
            let dual = solve_spd(gram, yc)?;
            xc.transpose() * dual
        };

        let coef = Array1::from_iter(weights.iter().copied());
        self.intercept = y_mean - coef.dot(&x_mean);
        self.coef = Some(coef);
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let coef = self.coef.as_ref().ok_or(ModelError::NotFitted)?;
        check_features(x, coef.len())?;
        Ok(x.dot(coef) + self.intercept)
    }
}

/// Solve a symmetric positive (semi-)definite system, retrying with extra
/// diagonal jitter when Cholesky fails.
pub(crate) fn solve_spd(
    matrix: DMatrix<f64>,
    rhs: DVector<f64>,
) -> Result<DVector<f64>, ModelError> {
    let size = matrix.nrows();
    let trace = (0..size).map(|d| matrix[(d, d)]).sum::<f64>() / size.max(1) as f64;
    let mut jitter = 0.0;
    for attempt in 0..6 {
        let mut m = matrix.clone();
        if jitter > 0.0 {
            for d in 0..size {
                m[(d, d)] += jitter;
            }
        }
        if let Some(chol) = m.cholesky() {
            return Ok(chol.solve(&rhs));
        }
        jitter = trace.abs().max(1e-12) * 10f64.powi(attempt - 10);
    }
    Err(ModelError::Singular(format!(
        "{size}x{size} system is not positive definite"
    )))
}
