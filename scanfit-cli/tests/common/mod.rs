//! Common test utilities and macros for CLI integration tests
#![allow(dead_code)]

use std::{fs, path::Path};

use imageproc::rect::Rect;
use scanfit_utils::synthetic::{draw_gauge, place_page, textured_page};

pub const SCANS: usize = 4;

/// Shift applied to scan `i`; the first scan is the reference.
pub fn scan_shift(i: usize) -> (i32, i32) {
    [(0, 0), (3, -2), (-2, 1), (1, 3)][i % SCANS]
}

/// Write `SCANS` shifted scans into `dir` plus a `config.json` describing
/// their layout, returning the config path.
pub fn write_scan_fixture(dir: &Path) -> std::path::PathBuf {
    let scans = dir.join("scans");
    fs::create_dir_all(&scans).expect("create scan dir");
    let content = textured_page(260, 220, 7);
    for i in 0..SCANS {
        let mut page = content.clone();
        draw_gauge(&mut page, Rect::at(94, 86).of_size(56, 20), 0.25 * i as f32);
        let (dx, dy) = scan_shift(i);
        place_page(&page, 290, 250, 12, 14, dx, dy)
            .save(scans.join(format!("scan_{i}.png")))
            .expect("save scan");
    }

    let config = serde_json::json!({
        "paths": {
            "image_dir": scans,
            "preprocessed_dir": dir.join("crops"),
            "output_dir": dir.join("out"),
        },
        "geometry": {
            "left": 12, "top": 14, "width": 260, "height": 220,
            "crop_left": 90, "crop_top": 80, "crop_width": 64, "crop_height": 32,
        },
    });
    let path = dir.join("config.json");
    fs::write(&path, serde_json::to_string_pretty(&config).expect("json")).expect("write config");
    path
}

/// Macro to run the CLI with the given arguments from a working directory.
///
/// Returns the Command output.
///
/// # Usage
///
/// ```ignore
/// let output = run_cli!(temp_dir.path(), ["gp-search", "data.json"]);
/// assert_cli_success!(output, "gp-search should succeed");
/// ```
#[macro_export]
macro_rules! run_cli {
    ($cwd:expr, [$($arg:expr),* $(,)?]) => {{
        std::process::Command::new(env!("CARGO_BIN_EXE_scanfit"))
            .current_dir($cwd)
            .args([$($arg,)*])
            .output()
            .expect("execute CLI")
    }};
}

/// Macro to assert CLI success and print stderr on failure.
#[macro_export]
macro_rules! assert_cli_success {
    ($output:expr, $msg:literal) => {{
        if !$output.status.success() {
            eprintln!("CLI stderr: {}", String::from_utf8_lossy(&$output.stderr));
        }
        assert!($output.status.success(), $msg);
    }};
}

/// Macro to collect files with the given extension from a directory.
///
/// # Usage
///
/// ```ignore
/// let files = verify_output_files!(output_dir, "png");
/// assert!(!files.is_empty(), "Should have output files");
/// ```
#[macro_export]
macro_rules! verify_output_files {
    ($output_dir:expr, $ext:literal) => {{
        std::fs::read_dir(&$output_dir)
            .expect("read output dir")
            .filter_map(Result::ok)
            .filter(|e| {
                e.path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e == $ext)
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>()
    }};
}
