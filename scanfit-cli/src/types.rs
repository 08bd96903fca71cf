//! Serializable command outputs.

use scanfit_core::{AlignmentRecord, models::GpSearchResult};
use serde::Serialize;

/// Offsets printed by `scanfit align`.
#[derive(Debug, Serialize)]
pub struct AlignmentReport {
    /// Scan every other scan was aligned against.
    pub reference: String,
    pub aligned: usize,
    pub rejected: usize,
    pub images: Vec<AlignmentRecord>,
}

impl From<Vec<AlignmentRecord>> for AlignmentReport {
    fn from(images: Vec<AlignmentRecord>) -> Self {
        let aligned = images.iter().filter(|r| r.aligned).count();
        Self {
            reference: images.first().map(|r| r.image.clone()).unwrap_or_default(),
            aligned,
            rejected: images.len() - aligned,
            images,
        }
    }
}

/// Grid written by `scanfit gp-search --json`.
#[derive(Debug, Serialize)]
pub struct GpReport {
    pub objective: String,
    pub noise: f64,
    #[serde(flatten)]
    pub result: GpSearchResult,
    /// Best-kernel predictions for the input rows, with `--predict`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Vec<f64>>,
}
