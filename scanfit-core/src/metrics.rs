//! Regression error metrics and Bland-Altman agreement statistics.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

fn check_pair(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<(), ModelError> {
    if actual.len() != predicted.len() {
        return Err(ModelError::shape(
            format!("{} prediction(s)", actual.len()),
            format!("{} prediction(s)", predicted.len()),
        ));
    }
    if actual.is_empty() {
        return Err(ModelError::EmptyTrainingSet);
    }
    Ok(())
}

pub fn mean_absolute_error(
    actual: ArrayView1<f64>,
    predicted: ArrayView1<f64>,
) -> Result<f64, ModelError> {
    check_pair(actual, predicted)?;
    Ok((&actual - &predicted).mapv(f64::abs).sum() / actual.len() as f64)
}

pub fn mean_squared_error(
    actual: ArrayView1<f64>,
    predicted: ArrayView1<f64>,
) -> Result<f64, ModelError> {
    check_pair(actual, predicted)?;
    Ok((&actual - &predicted).mapv(|d| d * d).sum() / actual.len() as f64)
}

pub fn root_mean_squared_error(
    actual: ArrayView1<f64>,
    predicted: ArrayView1<f64>,
) -> Result<f64, ModelError> {
    Ok(mean_squared_error(actual, predicted)?.sqrt())
}

/// Coefficient of determination. A constant `actual` gives 1.0 for a perfect
/// prediction and 0.0 otherwise.
pub fn r2_score(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<f64, ModelError> {
    check_pair(actual, predicted)?;
    let mean = actual.sum() / actual.len() as f64;
    let ss_res: f64 = (&actual - &predicted).mapv(|d| d * d).sum();
    let ss_tot: f64 = actual.mapv(|v| (v - mean) * (v - mean)).sum();
    if ss_tot == 0.0 {
        return Ok(if ss_res == 0.0 { 1.0 } else { 0.0 });
    }
    Ok(1.0 - ss_res / ss_tot)
}

/// One point of a Bland-Altman plot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgreementPoint {
    /// `(actual + predicted) / 2`
    pub average: f64,
    /// `actual - predicted`
    pub difference: f64,
}

/// Bland-Altman summary: bias and 95% limits of agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlandAltman {
    pub mean_diff: f64,
    /// Population standard deviation of the differences.
    pub std_diff: f64,
    pub upper: f64,
    pub lower: f64,
    pub points: Vec<AgreementPoint>,
}

/// Width of the limits of agreement in standard deviations.
pub const AGREEMENT_Z: f64 = 1.96;

impl BlandAltman {
    pub fn compute(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<Self, ModelError> {
        check_pair(actual, predicted)?;
        let points: Vec<AgreementPoint> = actual
            .iter()
            .zip(predicted.iter())
            .map(|(a, p)| AgreementPoint {
                average: (a + p) / 2.0,
                difference: a - p,
            })
            .collect();
        let n = points.len() as f64;
        let mean_diff = points.iter().map(|p| p.difference).sum::<f64>() / n;
        let variance = points
            .iter()
            .map(|p| (p.difference - mean_diff).powi(2))
            .sum::<f64>()
            / n;
        let std_diff = variance.sqrt();
        Ok(Self {
            mean_diff,
            std_diff,
            upper: mean_diff + AGREEMENT_Z * std_diff,
            lower: mean_diff - AGREEMENT_Z * std_diff,
            points,
        })
    }

    /// Share of points inside the limits of agreement.
    pub fn within_limits(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        let inside = self
            .points
            .iter()
            .filter(|p| p.difference >= self.lower && p.difference <= self.upper)
            .count();
        inside as f64 / self.points.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn error_metrics_on_known_values() {
        let actual = array![1.0, 2.0, 3.0, 4.0];
        let predicted = array![1.5, 2.0, 2.0, 4.0];
        assert_eq!(mean_absolute_error(actual.view(), predicted.view()), Ok(0.375));
        assert_eq!(mean_squared_error(actual.view(), predicted.view()), Ok(0.3125));
        let rmse = root_mean_squared_error(actual.view(), predicted.view()).expect("rmse");
        assert!((rmse - 0.3125f64.sqrt()).abs() < 1e-12);
        let r2 = r2_score(actual.view(), predicted.view()).expect("r2");
        assert!((r2 - (1.0 - 1.25 / 5.0)).abs() < 1e-12);
    }

    #[test]
    fn r2_of_constant_target() {
        let actual = array![2.0, 2.0];
        assert_eq!(r2_score(actual.view(), actual.view()), Ok(1.0));
        assert_eq!(r2_score(actual.view(), array![1.0, 3.0].view()), Ok(0.0));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = mean_absolute_error(array![1.0].view(), array![1.0, 2.0].view());
        assert!(matches!(err, Err(ModelError::ShapeMismatch { .. })));
        let empty = ndarray::Array1::<f64>::zeros(0);
        assert_eq!(
            mean_absolute_error(empty.view(), empty.view()),
            Err(ModelError::EmptyTrainingSet)
        );
    }

    #[test]
    fn bland_altman_uses_population_std() {
        let actual = array![10.0, 12.0, 14.0, 16.0];
        let predicted = array![9.0, 12.0, 15.0, 14.0];
        // differences: 1, 0, -1, 2 -> mean 0.5, population variance 1.25
        let stats = BlandAltman::compute(actual.view(), predicted.view()).expect("stats");
        assert_eq!(stats.mean_diff, 0.5);
        assert!((stats.std_diff - 1.25f64.sqrt()).abs() < 1e-12);
        assert!((stats.upper - (0.5 + 1.96 * 1.25f64.sqrt())).abs() < 1e-12);
        assert!((stats.lower - (0.5 - 1.96 * 1.25f64.sqrt())).abs() < 1e-12);
        assert_eq!(stats.points[0].average, 9.5);
        assert_eq!(stats.points[3].difference, 2.0);
        assert_eq!(stats.within_limits(), 1.0);
    }
}
