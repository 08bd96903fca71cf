//! Common helpers shared across scanfit crates.

/// Pipeline configuration and settings management.
pub mod config;
/// Image loading, resizing, and array conversion.
pub mod image_utils;
/// Label-sheet ingestion (CSV and Excel).
pub mod labels;
/// Artifact writers (PNG crops with provenance, CSV tables, JSON summaries).
pub mod output;
/// Generated document scans for tests and benchmarks.
pub mod synthetic;
/// Instrumentation helpers for optional step timing.
pub mod telemetry;

use std::path::Path;

use anyhow::Result;
use log::LevelFilter;

pub use config::{
    AlignmentMode, AlignmentSettings, AppSettings, AugmentationSettings, BoostingSettings,
    DatasetSettings, ForestSettings, GaussianProcessSettings, GeometrySettings, LabelSettings,
    PathSettings, TelemetrySettings, TuningSettings, UNetSettings, default_settings_path,
};
pub use image_utils::{
    IMAGE_EXTENSIONS, collect_images, file_stem_string, gray_to_unit_array, has_image_extension,
    load_gray, load_image, resize_gray, unit_array_to_gray,
};
pub use labels::{
    ColumnSelector, LabelEntry, LabelFormat, LabelReadOptions, LabelTable,
    detect_format as detect_label_format, load_label_entries,
};
pub use output::{
    PNG_TEXT_KEYWORD, ensure_parent_dir, read_png_text, save_gray_png, write_csv, write_json,
};
pub use telemetry::{
    TELEMETRY_TARGET, TimingGuard, configure as configure_telemetry, telemetry_allows,
    telemetry_enabled, telemetry_level, timing_guard, timing_guard_if,
};

/// Initialize logging once for the CLI and tests.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies. The
/// telemetry target is always let through so timing guards decide for
/// themselves whether to emit.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(TELEMETRY_TARGET, LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
