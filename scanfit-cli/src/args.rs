//! Command-line argument definitions for scanfit.

use clap::{ArgAction, Args, Parser, Subcommand};
use scanfit_utils::AlignmentMode;
use std::path::PathBuf;

/// Align scanned documents, crop their region of interest and compare
/// regression models on the crops.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Optional settings JSON. Defaults to `config/scanfit.json` when present, otherwise built-in parameters.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, global = true, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,

    /// Log debug output (`RUST_LOG` still wins when set).
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full pipeline: preprocess, train, evaluate, report and plot.
    Run(RunArgs),
    /// Align every scan and save its ROI crop.
    Preprocess(PreprocessArgs),
    /// Print per-scan alignment offsets as JSON without writing crops.
    Align(AlignArgs),
    /// Gaussian-process kernel grid search over a JSON matrix.
    GpSearch(GpSearchArgs),
    /// Write the effective settings to a JSON file.
    InitConfig(InitConfigArgs),
}

/// Input and output locations.
#[derive(Debug, Args, Default)]
pub struct PathArgs {
    /// Directory holding the raw scans.
    #[arg(long)]
    pub image_dir: Option<PathBuf>,

    /// Directory that receives the ROI crops.
    #[arg(long)]
    pub preprocessed_dir: Option<PathBuf>,

    /// Directory for the comparison table, plots and summary.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

/// Alignment overrides.
#[derive(Debug, Args, Default)]
pub struct AlignmentArgs {
    /// How offsets are applied: `offset` (shift the ROI) or `warp` (resample the page).
    #[arg(long, value_name = "MODE")]
    pub alignment_mode: Option<AlignmentMode>,

    /// Keypoints kept per image.
    #[arg(long)]
    pub max_features: Option<usize>,

    /// Fraction of best matches used for the homography (0-1].
    #[arg(long)]
    pub good_match_percent: Option<f32>,

    /// Reject offsets larger than this many pixels on either axis.
    #[arg(long, allow_negative_numbers = true)]
    pub max_delta: Option<i32>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub paths: PathArgs,

    #[command(flatten)]
    pub alignment: AlignmentArgs,

    /// Label sheet (CSV or Excel).
    #[arg(long)]
    pub label_file: Option<PathBuf>,

    /// Column with image names (header name, `#index` or index).
    #[arg(long)]
    pub image_column: Option<String>,

    /// Column with numeric labels (header name, `#index` or index).
    #[arg(long)]
    pub label_column: Option<String>,

    /// Sheet to read from an Excel workbook.
    #[arg(long)]
    pub sheet: Option<String>,

    /// Reuse crops already in the preprocessed directory.
    #[arg(long, action = ArgAction::SetTrue)]
    pub skip_preprocess: bool,

    /// Skip UNet cross-validation.
    #[arg(long = "no-cv", action = ArgAction::SetTrue)]
    pub no_cv: bool,

    /// Do not write the MAE chart and Bland-Altman plots.
    #[arg(long = "no-plots", action = ArgAction::SetTrue)]
    pub no_plots: bool,

    /// Side length of the square model input.
    #[arg(long)]
    pub input_size: Option<u32>,

    /// Augmented copies per sample (0 disables augmentation).
    #[arg(long)]
    pub augment_copies: Option<usize>,

    /// Add a Canny edge channel to every sample.
    #[arg(long)]
    pub edge_features: Option<bool>,

    /// Folds for cross-validation and tuning.
    #[arg(long)]
    pub folds: Option<usize>,

    /// UNet training epochs.
    #[arg(long)]
    pub epochs: Option<usize>,

    /// UNet mini-batch size.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Write the run summary JSON to this file as well.
    #[arg(long)]
    pub json: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct PreprocessArgs {
    #[command(flatten)]
    pub paths: PathArgs,

    #[command(flatten)]
    pub alignment: AlignmentArgs,
}

#[derive(Debug, Args)]
pub struct AlignArgs {
    #[command(flatten)]
    pub paths: PathArgs,

    #[command(flatten)]
    pub alignment: AlignmentArgs,

    /// Write offsets to a JSON file instead of stdout.
    #[arg(long)]
    pub json: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct GpSearchArgs {
    /// JSON array of numeric rows; the last column is the target.
    #[arg(default_value = "data.json")]
    pub input: PathBuf,

    /// Candidate length scales (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub length_scales: Vec<f64>,

    /// Candidate signal sigmas (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub signal_sigmas: Vec<f64>,

    /// Observation noise added to the kernel diagonal.
    #[arg(long)]
    pub noise: Option<f64>,

    /// Score candidates by K-fold held-out MSE instead of training MSE.
    #[arg(long)]
    pub folds: Option<usize>,

    /// Shuffle seed for `--folds`.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Refit the best kernel on every row and print its predictions.
    #[arg(long, action = ArgAction::SetTrue)]
    pub predict: bool,

    /// Write every candidate to a JSON file.
    #[arg(long)]
    pub json: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct InitConfigArgs {
    /// Destination (defaults to `config/scanfit.json`).
    pub path: Option<PathBuf>,

    /// Overwrite an existing file.
    #[arg(long, action = ArgAction::SetTrue)]
    pub force: bool,
}
