//! PNG charts for the model comparison: an MAE bar chart and Bland-Altman
//! agreement plots, drawn with `imageproc`.

mod font;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut},
    rect::Rect,
};
use log::debug;
use scanfit_utils::ensure_parent_dir;

use crate::metrics::BlandAltman;
pub use font::{draw_text, draw_text_vertical, text_height, text_width};

/// Output name of the MAE bar chart.
pub const MAE_CHART_FILE: &str = "optimized_model_mae_comparison.png";

const WIDTH: u32 = 1000;
const HEIGHT: u32 = 600;
const MARGIN_LEFT: i32 = 90;
const MARGIN_RIGHT: i32 = 30;
const MARGIN_TOP: i32 = 50;
const MARGIN_BOTTOM: i32 = 70;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const TEXT: Rgb<u8> = Rgb([51, 51, 51]);
const GRID: Rgb<u8> = Rgb([224, 224, 224]);
const SKYBLUE: Rgb<u8> = Rgb([135, 206, 235]);
const RED: Rgb<u8> = Rgb([214, 39, 40]);
const GRAY: Rgb<u8> = Rgb([128, 128, 128]);
/// Default scatter blue at 50% opacity over white.
const POINT: Rgb<u8> = Rgb([143, 187, 218]);

/// `bland_altman_<name>.png` with the name lowercased and spaces replaced by
/// underscores.
pub fn bland_altman_file_name(model_name: &str) -> String {
    format!("bland_altman_{}.png", model_name.to_lowercase().replace(' ', "_"))
}

/// Data range mapped onto the plotting frame.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Axis {
    min: f64,
    max: f64,
}

impl Axis {
    /// Cover `values` with 5% padding; a degenerate range widens to ±1.
    fn covering(values: impl IntoIterator<Item = f64>) -> Self {
        let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
        for v in values.into_iter().filter(|v| v.is_finite()) {
            min = min.min(v);
            max = max.max(v);
        }
        if !min.is_finite() {
            return Self { min: 0.0, max: 1.0 };
        }
        if (max - min).abs() < f64::EPSILON {
            return Self {
                min: min - 1.0,
                max: max + 1.0,
            };
        }
        let pad = (max - min) * 0.05;
        Self {
            min: min - pad,
            max: max + pad,
        }
    }

    fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Roughly `target` ticks at 1/2/5 x 10^k spacing.
    fn ticks(&self, target: usize) -> (Vec<f64>, usize) {
        let raw = self.span() / target.max(1) as f64;
        let magnitude = 10f64.powf(raw.log10().floor());
        let step = [1.0, 2.0, 5.0, 10.0]
            .iter()
            .map(|m| m * magnitude)
            .find(|s| *s >= raw)
            .unwrap_or(10.0 * magnitude);
        let decimals = (-step.log10().floor()).max(0.0) as usize;
        let first = (self.min / step).ceil() as i64;
        let last = (self.max / step).floor() as i64;
        ((first..=last).map(|k| k as f64 * step).collect(), decimals)
    }
}

/// Blank chart with a title, axis labels and a plotting frame.
struct Chart {
    image: RgbImage,
    x: Axis,
    y: Axis,
}

impl Chart {
    fn new(title: &str, x_label: &str, y_label: &str, x: Axis, y: Axis) -> Self {
        let mut image = RgbImage::from_pixel(WIDTH, HEIGHT, WHITE);
        let title_w = text_width(title, 2) as i32;
        draw_text(&mut image, (WIDTH as i32 - title_w) / 2, 16, title, 2, TEXT);
        let x_w = text_width(x_label, 1) as i32;
        let frame_mid = MARGIN_LEFT + (WIDTH as i32 - MARGIN_LEFT - MARGIN_RIGHT) / 2;
        draw_text(&mut image, frame_mid - x_w / 2, HEIGHT as i32 - 22, x_label, 1, TEXT);
        let y_h = text_width(y_label, 1) as i32;
        let frame_mid_y = MARGIN_TOP + (HEIGHT as i32 - MARGIN_TOP - MARGIN_BOTTOM) / 2;
        draw_text_vertical(&mut image, 12, frame_mid_y + y_h / 2, y_label, 1, TEXT);
        Self { image, x, y }
    }

    fn frame(&self) -> (i32, i32, i32, i32) {
        (
            MARGIN_LEFT,
            MARGIN_TOP,
            WIDTH as i32 - MARGIN_RIGHT,
            HEIGHT as i32 - MARGIN_BOTTOM,
        )
    }

    fn px_x(&self, value: f64) -> f32 {
        let (left, _, right, _) = self.frame();
        left as f32 + ((value - self.x.min) / self.x.span()) as f32 * (right - left) as f32
    }

    fn px_y(&self, value: f64) -> f32 {
        let (_, top, _, bottom) = self.frame();
        bottom as f32 - ((value - self.y.min) / self.y.span()) as f32 * (bottom - top) as f32
    }

    /// Horizontal grid lines with y tick labels.
    fn y_grid(&mut self) {
        let (left, _, right, _) = self.frame();
        let (ticks, decimals) = self.y.ticks(6);
        for tick in ticks {
            let y = self.px_y(tick);
            draw_line_segment_mut(&mut self.image, (left as f32, y), (right as f32, y), GRID);
            let label = format!("{tick:.decimals$}");
            let w = text_width(&label, 1) as i32;
            draw_text(
                &mut self.image,
                left - 6 - w,
                y as i32 - text_height(1) as i32 / 2,
                &label,
                1,
                TEXT,
            );
        }
    }

    /// Vertical tick labels along the bottom edge.
    fn x_ticks(&mut self) {
        let (_, _, _, bottom) = self.frame();
        let (ticks, decimals) = self.x.ticks(8);
        for tick in ticks {
            let x = self.px_x(tick);
            draw_line_segment_mut(&mut self.image, (x, bottom as f32), (x, bottom as f32 + 4.0), TEXT);
            let label = format!("{tick:.decimals$}");
            let w = text_width(&label, 1) as i32;
            draw_text(&mut self.image, x as i32 - w / 2, bottom + 8, &label, 1, TEXT);
        }
    }

    fn border(&mut self) {
        let (left, top, right, bottom) = self.frame();
        draw_hollow_rect_mut(
            &mut self.image,
            Rect::at(left, top).of_size((right - left) as u32, (bottom - top) as u32),
            TEXT,
        );
    }

    fn dashed_hline(&mut self, value: f64, color: Rgb<u8>) {
        let (left, _, right, _) = self.frame();
        let y = self.px_y(value);
        let mut x = left as f32;
        while x < right as f32 {
            let end = (x + 8.0).min(right as f32);
            draw_line_segment_mut(&mut self.image, (x, y), (end, y), color);
            draw_line_segment_mut(&mut self.image, (x, y + 1.0), (end, y + 1.0), color);
            x += 14.0;
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        ensure_parent_dir(path)?;
        self.image
            .save(path)
            .with_context(|| format!("failed to save chart {}", path.display()))?;
        debug!("Wrote chart {}", path.display());
        Ok(())
    }
}

/// Bar chart of MAE per model.
pub fn plot_mae_comparison(results: &[(String, f64)], path: &Path) -> Result<()> {
    anyhow::ensure!(!results.is_empty(), "no model results to plot");
    let top = results
        .iter()
        .map(|(_, v)| *v)
        .filter(|v| v.is_finite())
        .fold(0.0, f64::max);
    let y = Axis {
        min: 0.0,
        max: if top > 0.0 { top * 1.15 } else { 1.0 },
    };
    let x = Axis {
        min: 0.0,
        max: results.len() as f64,
    };
    let mut chart = Chart::new("Model Comparison - MAE", "Model", "Mean Absolute Error (MAE)", x, y);
    chart.y_grid();

    let (_, _, _, bottom) = chart.frame();
    let slot = chart.px_x(1.0) - chart.px_x(0.0);
    let bar_w = (slot * 0.8).max(1.0);
    for (i, (name, mae)) in results.iter().enumerate() {
        let center = chart.px_x(i as f64 + 0.5);
        let value = if mae.is_finite() { mae.max(0.0) } else { 0.0 };
        let top_px = chart.px_y(value);
        let height = (bottom as f32 - top_px).round().max(1.0) as u32;
        draw_filled_rect_mut(
            &mut chart.image,
            Rect::at((center - bar_w / 2.0) as i32, top_px.round() as i32).of_size(bar_w as u32, height),
            SKYBLUE,
        );
        let value_label = format!("{mae:.3}");
        let w = text_width(&value_label, 1) as i32;
        draw_text(&mut chart.image, center as i32 - w / 2, top_px as i32 - 12, &value_label, 1, TEXT);
        let name_w = text_width(name, 1) as i32;
        draw_text(&mut chart.image, center as i32 - name_w / 2, bottom + 10, name, 1, TEXT);
    }
    chart.border();
    chart.save(path)
}

/// Scatter of difference against average with the bias line (red) and the
/// ±1.96 SD limits of agreement (gray).
pub fn plot_bland_altman(stats: &BlandAltman, model_name: &str, path: &Path) -> Result<()> {
    anyhow::ensure!(!stats.points.is_empty(), "no points to plot for {model_name}");
    let x = Axis::covering(stats.points.iter().map(|p| p.average));
    let y = Axis::covering(
        stats
            .points
            .iter()
            .map(|p| p.difference)
            .chain([stats.upper, stats.lower, stats.mean_diff]),
    );
    let title = format!("Bland-Altman Plot - {model_name}");
    let mut chart = Chart::new(
        &title,
        "Average of Actual and Predicted",
        "Difference between Actual and Predicted",
        x,
        y,
    );
    chart.y_grid();
    chart.x_ticks();
    for point in &stats.points {
        let cx = chart.px_x(point.average).round() as i32;
        let cy = chart.px_y(point.difference).round() as i32;
        draw_filled_circle_mut(&mut chart.image, (cx, cy), 3, POINT);
    }
    chart.dashed_hline(stats.mean_diff, RED);
    chart.dashed_hline(stats.upper, GRAY);
    chart.dashed_hline(stats.lower, GRAY);

    let (_, top, right, _) = chart.frame();
    let entries = [
        ("Mean Difference", RED),
        ("Upper Limit", GRAY),
        ("Lower Limit", GRAY),
    ];
    let legend_w = entries.iter().map(|(l, _)| text_width(l, 1)).max().unwrap_or(0) as i32 + 40;
    let legend_x = right - legend_w - 10;
    let legend_y = top + 10;
    draw_filled_rect_mut(
        &mut chart.image,
        Rect::at(legend_x, legend_y).of_size(legend_w as u32, 54),
        WHITE,
    );
    draw_hollow_rect_mut(
        &mut chart.image,
        Rect::at(legend_x, legend_y).of_size(legend_w as u32, 54),
        GRID,
    );
    for (i, (label, color)) in entries.iter().enumerate() {
        let y = (legend_y + 12 + i as i32 * 15) as f32;
        let x0 = (legend_x + 8) as f32;
        draw_line_segment_mut(&mut chart.image, (x0, y), (x0 + 20.0, y), *color);
        draw_text(&mut chart.image, legend_x + 34, y as i32 - 3, label, 1, TEXT);
    }
    chart.border();
    chart.save(path)
}

/// Write one Bland-Altman plot per model into `dir`; returns the paths.
pub fn plot_all_bland_altman(
    models: &[(String, BlandAltman)],
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    models
        .iter()
        .map(|(name, stats)| {
            let path = dir.join(bland_altman_file_name(name));
            plot_bland_altman(stats, name, &path)?;
            Ok(path)
        })
        .collect()
}
