//! Configuration loading and CLI override logic.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{LevelFilter, info, warn};
use scanfit_utils::{AppSettings, default_settings_path, normalize_path};

use crate::args::{AlignmentArgs, GlobalArgs, GpSearchArgs, PathArgs, RunArgs};

/// Load application settings from a file or use defaults.
pub fn load_settings(config_path: Option<&PathBuf>) -> Result<AppSettings> {
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        let settings = AppSettings::load_from_path(&resolved)?;
        info!("Loaded settings from {}", resolved.display());
        Ok(settings)
    } else {
        let default_path = default_settings_path();
        if default_path.exists() {
            let settings = AppSettings::load_from_path(&default_path).with_context(|| {
                format!(
                    "failed to load default settings from {}",
                    default_path.display()
                )
            })?;
            info!("Loaded settings from {}", default_path.display());
            Ok(settings)
        } else {
            Ok(AppSettings::default())
        }
    }
}

/// Apply telemetry flags shared by every subcommand.
pub fn apply_global_overrides(settings: &mut AppSettings, args: &GlobalArgs) {
    if args.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = args.telemetry_level.as_ref() {
        let normalized = level.trim();
        if !normalized.is_empty() {
            let lower = normalized.to_ascii_lowercase();
            match lower.parse::<LevelFilter>() {
                Ok(LevelFilter::Off) => settings.telemetry.enabled = false,
                Ok(filter) => settings.telemetry.set_level(filter),
                Err(_) => warn!("unknown --telemetry-level '{normalized}', ignoring"),
            }
        }
    }
}

pub fn apply_path_overrides(settings: &mut AppSettings, args: &PathArgs) {
    if let Some(dir) = args.image_dir.as_ref() {
        settings.paths.image_dir = dir.clone();
    }
    if let Some(dir) = args.preprocessed_dir.as_ref() {
        settings.paths.preprocessed_dir = dir.clone();
    }
    if let Some(dir) = args.output_dir.as_ref() {
        settings.paths.output_dir = dir.clone();
    }
}

pub fn apply_alignment_overrides(settings: &mut AppSettings, args: &AlignmentArgs) {
    if let Some(mode) = args.alignment_mode {
        settings.alignment.mode = mode;
    }
    if let Some(max_features) = args.max_features {
        settings.alignment.max_features = max_features;
    }
    if let Some(percent) = args.good_match_percent {
        if percent > 0.0 && percent <= 1.0 {
            settings.alignment.good_match_percent = percent;
        } else {
            warn!("--good-match-percent must be in (0, 1], got {percent}; ignoring");
        }
    }
    if let Some(delta) = args.max_delta {
        settings.alignment.max_delta = delta.saturating_abs();
    }
}

/// Apply `run` flags to loaded or default settings.
pub fn apply_run_overrides(settings: &mut AppSettings, args: &RunArgs) {
    apply_path_overrides(settings, &args.paths);
    apply_alignment_overrides(settings, &args.alignment);

    if let Some(file) = args.label_file.as_ref() {
        settings.paths.label_file = file.clone();
    }
    if let Some(column) = args.image_column.as_ref() {
        settings.labels.image_column = column.clone();
    }
    if let Some(column) = args.label_column.as_ref() {
        settings.labels.label_column = column.clone();
    }
    if let Some(sheet) = args.sheet.as_ref() {
        settings.labels.sheet = Some(sheet.clone());
    }
    if let Some(size) = args.input_size {
        settings.dataset.input_size = size;
    }
    if let Some(copies) = args.augment_copies {
        settings.augmentation.copies = copies;
    }
    if let Some(edges) = args.edge_features {
        settings.dataset.edge_features = edges;
    }
    if let Some(folds) = args.folds {
        settings.dataset.num_folds = folds;
    }
    if let Some(epochs) = args.epochs {
        settings.unet.epochs = epochs;
    }
    if let Some(batch) = args.batch_size {
        settings.unet.batch_size = batch.max(1);
    }
}

pub fn apply_gp_overrides(settings: &mut AppSettings, args: &GpSearchArgs) {
    if !args.length_scales.is_empty() {
        settings.gp.length_scales = args.length_scales.clone();
    }
    if !args.signal_sigmas.is_empty() {
        settings.gp.signal_sigmas = args.signal_sigmas.clone();
    }
    if let Some(noise) = args.noise {
        settings.gp.noise = noise;
    }
}
