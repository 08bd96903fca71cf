//! Labelled image tensors and the splits used to train on them.
//!
//! Images are stored as one `(samples, channels, height, width)` tensor with
//! values in `[0, 1]`. Channel 0 holds the intensity; when edge features are
//! enabled channel 1 holds the Canny edge map of the same crop.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use image::GrayImage;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Array4, ArrayView4, Axis, concatenate, s};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use scanfit_utils::{
    ColumnSelector, LabelReadOptions, LabelSettings, collect_images, file_stem_string,
    gray_to_unit_array, load_gray, load_label_entries, resize_gray, timing_guard,
};

use crate::edges::{EdgeThresholds, edge_map};

/// A preprocessed crop matched with its label.
#[derive(Debug, Clone)]
pub struct LabeledCrop {
    pub name: String,
    pub path: PathBuf,
    pub image: GrayImage,
    pub label: f64,
}

/// Read the label sheet and pair each row with its crop in `crops_dir`.
///
/// Sheet references are matched by file stem, ignoring case and extension,
/// so `Scan_01.JPG` in the sheet finds `scan_01.png` on disk. Rows without a
/// crop are skipped with a warning.
pub fn load_labels_and_images(
    label_file: &Path,
    crops_dir: &Path,
    settings: &LabelSettings,
) -> Result<Vec<LabeledCrop>> {
    let _guard = timing_guard("load labels and images", log::Level::Info);
    info!("Loading labels and images...");
    let options = LabelReadOptions {
        format: settings
            .format
            .as_deref()
            .map(scanfit_utils::LabelFormat::parse_token)
            .transpose()?,
        has_headers: settings.has_headers,
        delimiter: settings.delimiter.map(|c| c as u8),
        sheet_name: settings.sheet.clone(),
    };
    let image_column = ColumnSelector::parse_token(&settings.image_column)?;
    let label_column = ColumnSelector::parse_token(&settings.label_column)?;
    let table = load_label_entries(label_file, &options, &image_column, &label_column)
        .with_context(|| format!("failed to read labels from {}", label_file.display()))?;
    if table.skipped > 0 {
        warn!("{} label row(s) skipped", table.skipped);
    }

    let mut by_stem: HashMap<String, PathBuf> = HashMap::new();
    for path in collect_images(crops_dir)
        .with_context(|| format!("failed to list crops in {}", crops_dir.display()))?
    {
        by_stem
            .entry(file_stem_string(&path).to_lowercase())
            .or_insert(path);
    }

    let mut crops = Vec::with_capacity(table.entries.len());
    for entry in table.entries {
        let stem = file_stem_string(Path::new(&entry.image)).to_lowercase();
        let Some(path) = by_stem.get(&stem) else {
            warn!(
                "Label row {} references {} but no crop was found",
                entry.row, entry.image
            );
            continue;
        };
        match load_gray(path) {
            Ok(image) => crops.push(LabeledCrop {
                name: entry.image,
                path: path.clone(),
                image,
                label: entry.value,
            }),
            Err(err) => warn!("Skipping {}: {err:#}", path.display()),
        }
    }
    info!("Matched {} labelled crop(s)", crops.len());
    Ok(crops)
}

/// Labelled image tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub names: Vec<String>,
    /// `(samples, channels, height, width)`, values in `[0, 1]`.
    pub images: Array4<f32>,
    pub labels: Array1<f64>,
}

impl Dataset {
    /// Resize every crop to `input_size` x `input_size`, scale to `[0, 1]`
    /// and optionally append an edge channel.
    pub fn from_crops(
        crops: &[LabeledCrop],
        input_size: u32,
        edges: Option<EdgeThresholds>,
    ) -> Result<Self> {
        anyhow::ensure!(input_size > 0, "input size must be positive");
        let channels = if edges.is_some() { 2 } else { 1 };
        let side = input_size as usize;
        let mut images = Array4::<f32>::zeros((crops.len(), channels, side, side));
        for (i, crop) in crops.iter().enumerate() {
            let resized = resize_gray(&crop.image, input_size, input_size);
            images
                .slice_mut(s![i, 0, .., ..])
                .assign(&gray_to_unit_array(&resized));
            if let Some(thresholds) = edges {
                images
                    .slice_mut(s![i, 1, .., ..])
                    .assign(&edge_map(&resized, thresholds));
            }
        }
        debug!(
            "Built dataset of {} sample(s), {channels} channel(s), {side}x{side}",
            crops.len()
        );
        Ok(Self {
            names: crops.iter().map(|c| c.name.clone()).collect(),
            images,
            labels: crops.iter().map(|c| c.label).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `(channels, height, width)` of one sample.
    pub fn sample_shape(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.images.dim();
        (c, h, w)
    }

    pub fn images_view(&self) -> ArrayView4<'_, f32> {
        self.images.view()
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            names: indices.iter().map(|i| self.names[*i].clone()).collect(),
            images: self.images.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
        }
    }

    /// Append `images`/`labels` (e.g. augmented copies) after the current rows.
    pub fn extended<'a>(
        &'a self,
        images: ArrayView4<'a, f32>,
        labels: &Array1<f64>,
        tag: &str,
    ) -> Result<Self> {
        anyhow::ensure!(
            images.dim().0 == labels.len(),
            "{} image(s) but {} label(s)",
            images.dim().0,
            labels.len()
        );
        let (_, c, h, w) = images.dim();
        anyhow::ensure!(
            (c, h, w) == self.sample_shape(),
            "sample shape {:?} does not match dataset shape {:?}",
            images.dim(),
            self.images.dim()
        );
        let n = self.len().max(1);
        let mut names = self.names.clone();
        names.extend((0..labels.len()).map(|k| format!("{}#{tag}{}", self.names[k % n], k / n)));
        Ok(Self {
            names,
            images: concatenate(Axis(0), &[self.images.view(), images])?,
            labels: concatenate(Axis(0), &[self.labels.view(), labels.view()])?,
        })
    }

    /// Flatten every sample to one row of `f64` features.
    pub fn flatten(&self) -> Array2<f64> {
        flatten_images(self.images.view())
    }
}

/// `(n, c, h, w)` -> `(n, c*h*w)` as `f64`.
pub fn flatten_images(images: ArrayView4<f32>) -> Array2<f64> {
    let (n, c, h, w) = images.dim();
    let mut flat = Array2::<f64>::zeros((n, c * h * w));
    for (mut row, sample) in flat.outer_iter_mut().zip(images.outer_iter()) {
        for (dst, src) in row.iter_mut().zip(sample.iter()) {
            *dst = *src as f64;
        }
    }
    flat
}

/// Shuffled train/test index split.
///
/// The test share is `ceil(test_size * n)`, and at least one sample stays in
/// the training set.
pub fn train_test_split(n: usize, test_size: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let n_test = ((test_size.clamp(0.0, 1.0) * n as f64).ceil() as usize).min(n.saturating_sub(1));
    let train = order.split_off(n_test);
    (train, order)
}

/// Folds used for `n` samples: `requested` capped at `n`, and never fewer
/// than 2. Every K-fold consumer goes through this so small datasets are
/// handled the same way everywhere.
pub fn fold_count(requested: usize, n: usize) -> usize {
    requested.min(n).max(2)
}

/// K-fold cross-validation splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KFold {
    pub n_splits: usize,
    pub shuffle: bool,
    pub seed: u64,
}

impl KFold {
    pub fn new(n_splits: usize, seed: u64) -> Self {
        Self {
            n_splits,
            shuffle: true,
            seed,
        }
    }

    /// `(train, validation)` index pairs. The first `n % k` folds hold one
    /// extra sample.
    pub fn split(&self, n: usize) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
        anyhow::ensure!(self.n_splits >= 2, "need at least 2 folds, got {}", self.n_splits);
        anyhow::ensure!(
            n >= self.n_splits,
            "cannot split {n} sample(s) into {} folds",
            self.n_splits
        );
        let mut order: Vec<usize> = (0..n).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(self.seed));
        }
        let base = n / self.n_splits;
        let extra = n % self.n_splits;
        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for fold in 0..self.n_splits {
            let size = base + usize::from(fold < extra);
            let validation = order[start..start + size].to_vec();
            let train = order[..start]
                .iter()
                .chain(&order[start + size..])
                .copied()
                .collect();
            folds.push((train, validation));
            start += size;
        }
        Ok(folds)
    }
}
