use thiserror::Error;

/// Failures raised by the regression models.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("model has not been fitted")]
    NotFitted,
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("singular system: {0}")]
    Singular(String),
}

impl ModelError {
    pub fn shape(expected: impl ToString, found: impl ToString) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// Failures raised while estimating a homography.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HomographyError {
    #[error("need at least 4 correspondences, got {0}")]
    TooFewPoints(usize),
    #[error("no non-degenerate model found after {0} iteration(s)")]
    NoConsensus(usize),
    #[error("point configuration is degenerate")]
    Degenerate,
}
