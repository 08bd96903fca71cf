mod args;
mod config;
mod types;

use std::{fs::File, io::BufWriter, path::Path};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, info};
use scanfit_core::{
    PipelineOptions, align_only, format_table,
    models::{GaussianProcess, GpObjective, Regressor, gp_grid_search, load_matrix},
    preprocess, run_pipeline,
};
use scanfit_utils::{
    AppSettings, configure_telemetry, default_settings_path, init_logging, write_json,
};
use serde::Serialize;

use crate::{
    args::{AlignArgs, Cli, Command, GpSearchArgs, InitConfigArgs, PreprocessArgs, RunArgs},
    config::{
        apply_alignment_overrides, apply_global_overrides, apply_gp_overrides,
        apply_path_overrides, apply_run_overrides, load_settings,
    },
    types::{AlignmentReport, GpReport},
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.global.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    init_logging(default_level)?;

    let mut settings = load_settings(cli.global.config.as_ref())?;
    apply_global_overrides(&mut settings, &cli.global);
    configure_telemetry(
        settings.telemetry.enabled,
        settings.telemetry.level_filter(),
    );

    match cli.command {
        Command::Run(args) => run(settings, &args),
        Command::Preprocess(args) => preprocess_only(settings, &args),
        Command::Align(args) => align(settings, &args),
        Command::GpSearch(args) => gp_search(settings, &args),
        Command::InitConfig(args) => init_config(&settings, &args),
    }
}

fn run(mut settings: AppSettings, args: &RunArgs) -> Result<()> {
    apply_run_overrides(&mut settings, args);
    let options = PipelineOptions {
        skip_preprocess: args.skip_preprocess,
        cross_validate: !args.no_cv,
        plots: !args.no_plots,
    };
    let summary = run_pipeline(&settings, options)?;
    let rows: Vec<_> = summary.models.iter().map(|m| m.row()).collect();
    print!("{}", format_table(&rows));
    if let Some(path) = args.json.as_ref() {
        write_json(&summary, path)?;
        info!("Wrote run summary to {}", path.display());
    }
    Ok(())
}

fn preprocess_only(mut settings: AppSettings, args: &PreprocessArgs) -> Result<()> {
    apply_path_overrides(&mut settings, &args.paths);
    apply_alignment_overrides(&mut settings, &args.alignment);
    let output = preprocess(&settings)?;
    info!(
        "Preprocessed {} scan(s), {} aligned, crops in {}",
        output.records.len(),
        output.aligned(),
        settings.paths.preprocessed_dir.display()
    );
    Ok(())
}

fn align(mut settings: AppSettings, args: &AlignArgs) -> Result<()> {
    apply_path_overrides(&mut settings, &args.paths);
    apply_alignment_overrides(&mut settings, &args.alignment);
    let report = AlignmentReport::from(align_only(&settings)?);
    emit_json(&report, args.json.as_deref())
}

fn gp_search(mut settings: AppSettings, args: &GpSearchArgs) -> Result<()> {
    apply_gp_overrides(&mut settings, args);
    let (x, y) = load_matrix(&args.input)?;
    let objective = match args.folds {
        Some(folds) => GpObjective::CrossValidated {
            folds,
            seed: args.seed,
        },
        None => GpObjective::TrainingMse,
    };
    let result = gp_grid_search(x.view(), y.view(), &settings.gp, objective)?;
    for candidate in &result.candidates {
        println!(
            "lscale: {}, sigma: {}, mse: {}",
            candidate.length_scale, candidate.signal_sigma, candidate.mse
        );
    }
    println!(
        "Best params - lscale: {}, sigma: {}",
        result.best.length_scale, result.best.signal_sigma
    );
    println!("Best MSE: {}", result.best.mse);

    let predictions = if args.predict {
        let mut gp = GaussianProcess::new(
            result.best.length_scale,
            result.best.signal_sigma,
            settings.gp.noise,
        );
        gp.fit(x.view(), y.view())
            .context("failed to refit the best GP kernel")?;
        let predicted = gp.predict(x.view())?.to_vec();
        println!("Predictions: {predicted:?}");
        Some(predicted)
    } else {
        None
    };

    if let Some(path) = args.json.as_ref() {
        let report = GpReport {
            objective: match objective {
                GpObjective::TrainingMse => "training_mse".to_string(),
                GpObjective::CrossValidated { folds, .. } => format!("{folds}_fold_mse"),
            },
            noise: settings.gp.noise,
            result,
            predictions,
        };
        write_json(&report, path)?;
        info!("Wrote GP grid to {}", path.display());
    }
    Ok(())
}

fn init_config(settings: &AppSettings, args: &InitConfigArgs) -> Result<()> {
    let path = args.path.clone().unwrap_or_else(default_settings_path);
    anyhow::ensure!(
        args.force || !path.exists(),
        "{} already exists (use --force to overwrite)",
        path.display()
    );
    settings.save_to_path(&path)?;
    println!("{}", path.display());
    Ok(())
}

fn emit_json<T: Serialize>(value: &T, destination: Option<&Path>) -> Result<()> {
    if let Some(path) = destination {
        let file = File::create(path)
            .with_context(|| format!("failed to create JSON output {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), value)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        info!("Wrote JSON to {}", path.display());
    } else {
        let json = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
        println!("{json}");
    }
    Ok(())
}
