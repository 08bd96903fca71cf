//! Runs preprocessing and the full training pipeline on generated scans.

use std::{fs, path::Path};

use imageproc::rect::Rect;
use scanfit_core::{
    PipelineOptions,
    cropper::CropProvenance,
    pipeline::{MODEL_BOOSTING, MODEL_ENSEMBLE, MODEL_UNET, align_only, preprocess, run_pipeline},
    plots::{MAE_CHART_FILE, bland_altman_file_name},
    report::{COMPARISON_CSV, SUMMARY_JSON},
};
use scanfit_utils::{
    AppSettings, GeometrySettings, PNG_TEXT_KEYWORD, read_png_text,
    synthetic::{draw_gauge, place_page, textured_page},
};
use tempfile::TempDir;

const SCANS: usize = 12;
const SCAN_SIZE: (u32, u32) = (290, 250);
const PAGE_ORIGIN: (i32, i32) = (12, 14);

fn shift(i: usize) -> (i32, i32) {
    if i == 0 {
        return (0, 0);
    }
    (((i * 5) % 9) as i32 - 4, ((i * 3) % 7) as i32 - 3)
}

fn label(i: usize) -> f64 {
    (i as f64 + 0.5) / SCANS as f64
}

/// Writes `SCANS` scans and a label sheet, returning settings pointed at them.
fn fixture(dir: &Path) -> AppSettings {
    fixture_with(dir, SCANS)
}

fn fixture_with(dir: &Path, scans: usize) -> AppSettings {
    let mut settings = AppSettings::default();
    settings.geometry = GeometrySettings {
        left: PAGE_ORIGIN.0 as u32,
        top: PAGE_ORIGIN.1 as u32,
        width: 260,
        height: 220,
        crop_left: 90,
        crop_top: 80,
        crop_width: 64,
        crop_height: 32,
    };
    settings.paths.image_dir = dir.join("scans");
    settings.paths.preprocessed_dir = dir.join("crops");
    settings.paths.label_file = dir.join("labels.csv");
    settings.paths.output_dir = dir.join("out");
    fs::create_dir_all(&settings.paths.image_dir).expect("scan dir");

    let content = textured_page(260, 220, 21);
    let mut sheet = String::from("filename,label\n");
    for i in 0..scans {
        let mut page = content.clone();
        draw_gauge(&mut page, Rect::at(94, 86).of_size(56, 20), label(i) as f32);
        let (dx, dy) = shift(i);
        let scan = place_page(&page, SCAN_SIZE.0, SCAN_SIZE.1, PAGE_ORIGIN.0, PAGE_ORIGIN.1, dx, dy);
        let name = format!("scan_{i:02}.png");
        scan.save(settings.paths.image_dir.join(&name)).expect("save scan");
        sheet.push_str(&format!("{name},{}\n", label(i)));
    }
    fs::write(&settings.paths.label_file, sheet).expect("label sheet");

    settings.dataset.input_size = 16;
    settings.dataset.num_folds = 3;
    settings.unet.base_channels = 4;
    settings.unet.epochs = 3;
    settings.unet.batch_size = 8;
    settings.unet.patience = 0;
    settings.boosting.n_estimators = 10;
    settings.tuning.n_estimators = vec![10];
    settings.tuning.max_depth = vec![2, 3];
    settings.tuning.learning_rate = vec![0.3];
    settings.tuning.subsample = vec![1.0];
    settings.tuning.colsample_bytree = vec![1.0];
    settings.forest.n_estimators = 5;
    settings
}

#[test]
fn preprocessing_recovers_scan_shifts() {
    let dir = TempDir::new().expect("tempdir");
    let settings = fixture(dir.path());
    let output = preprocess(&settings).expect("preprocess");
    assert_eq!(output.records.len(), SCANS);
    assert_eq!(output.crops.len(), SCANS);

    let mut exact = 0;
    for (i, crop) in output.crops.iter().enumerate() {
        let image = image::open(&crop.path).expect("crop").to_luma8();
        assert_eq!(image.dimensions(), (64, 32));
        let text = read_png_text(&crop.path, PNG_TEXT_KEYWORD)
            .expect("read")
            .expect("provenance");
        let provenance: CropProvenance = serde_json::from_str(&text).expect("json");
        assert_eq!(provenance.source, format!("scan_{i:02}.png"));
        if provenance.aligned && (provenance.dx, provenance.dy) == shift(i) {
            exact += 1;
        }
    }
    assert!(exact >= SCANS - 2, "only {exact}/{SCANS} offsets recovered");
}

#[test]
fn align_only_writes_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let settings = fixture(dir.path());
    let records = align_only(&settings).expect("align");
    assert_eq!(records.len(), SCANS);
    assert_eq!((records[0].dx, records[0].dy), (0, 0));
    assert!(!settings.paths.preprocessed_dir.exists());
}

#[test]
fn full_pipeline_writes_report_and_plots() {
    let dir = TempDir::new().expect("tempdir");
    let settings = fixture(dir.path());
    let summary = run_pipeline(&settings, PipelineOptions::default()).expect("pipeline");

    assert_eq!(summary.scans_loaded, SCANS);
    assert_eq!(summary.labelled_samples, SCANS);
    assert_eq!(summary.augmented_samples, SCANS);
    assert_eq!(summary.train_samples + summary.test_samples, 2 * SCANS);
    assert_eq!(summary.cross_validation.as_ref().map(|cv| cv.fold_mae.len()), Some(3));
    let names: Vec<&str> = summary.models.iter().map(|m| m.model.as_str()).collect();
    assert_eq!(names, vec![MODEL_UNET, MODEL_BOOSTING, MODEL_ENSEMBLE]);
    assert!(summary.models.iter().all(|m| m.mae.is_finite() && m.rmse >= m.mae));

    let out = &settings.paths.output_dir;
    let table = fs::read_to_string(out.join(COMPARISON_CSV)).expect("csv");
    let mut lines = table.lines();
    assert_eq!(lines.next(), Some("Model,MAE,RMSE"));
    assert_eq!(lines.count(), 3);
    assert!(out.join(MAE_CHART_FILE).exists());
    for name in [MODEL_UNET, MODEL_BOOSTING, MODEL_ENSEMBLE] {
        assert!(out.join(bland_altman_file_name(name)).exists(), "{name}");
    }
    assert!(out.join(SUMMARY_JSON).exists());
}

#[test]
fn small_dataset_uses_fewer_folds() {
    let dir = TempDir::new().expect("tempdir");
    let mut settings = fixture_with(dir.path(), 3);
    settings.dataset.num_folds = 5;
    let options = PipelineOptions {
        plots: false,
        ..PipelineOptions::default()
    };
    let summary = run_pipeline(&settings, options).expect("pipeline with fewer samples than folds");

    assert_eq!(summary.labelled_samples, 3);
    assert_eq!((summary.train_samples, summary.test_samples), (4, 2));
    let cv = summary.cross_validation.expect("cross-validation report");
    assert_eq!(cv.fold_mae.len(), 4);
    assert_eq!(summary.models.len(), 3);
    assert!(summary.models.iter().all(|m| m.mae.is_finite()));
}

#[test]
fn two_crops_without_augmentation_are_rejected_after_split() {
    let dir = TempDir::new().expect("tempdir");
    let mut settings = fixture_with(dir.path(), 2);
    settings.augmentation.copies = 0;
    let options = PipelineOptions {
        plots: false,
        ..PipelineOptions::default()
    };
    let err = run_pipeline(&settings, options).expect_err("one training row");
    let message = err.to_string();
    assert!(message.contains("1 training sample(s)"), "{message}");
    assert!(message.contains("enable augmentation"), "{message}");
}
