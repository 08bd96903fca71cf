//! Histogram regression trees on quantile-binned features.
//!
//! Features are bucketed once into at most 256 bins ([`BinnedMatrix`]); split
//! search then works on per-bin gradient sums instead of sorted raw values.
//! Splits record both the bin and the raw threshold, so fitted trees predict
//! on raw features without the binner.

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::{Rng, seq::SliceRandom};
use rayon::prelude::*;

use crate::error::ModelError;

/// Feature matrix with every column mapped to `u8` bin indices.
#[derive(Debug, Clone)]
pub struct BinnedMatrix {
    /// Column-major bins: `bins[feature][row]`.
    bins: Vec<Vec<u8>>,
    /// Sorted split points per feature; bin `b` holds values `<= thresholds[b]`.
    thresholds: Vec<Vec<f64>>,
    n_rows: usize,
}

impl BinnedMatrix {
    /// Bin every column into at most `max_bins` quantile buckets.
    pub fn new(x: ArrayView2<f64>, max_bins: usize) -> Self {
        let max_bins = max_bins.clamp(2, 256);
        let (n_rows, n_features) = x.dim();
        let (bins, thresholds): (Vec<Vec<u8>>, Vec<Vec<f64>>) = (0..n_features)
            .into_par_iter()
            .map(|j| {
                let column = x.column(j);
                let cuts = quantile_cuts(column, max_bins);
                let bins: Vec<u8> = column.iter().map(|v| bin_of(&cuts, *v)).collect();
                (bins, cuts)
            })
            .unzip();
        Self {
            bins,
            thresholds,
            n_rows,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_features(&self) -> usize {
        self.bins.len()
    }

    /// Number of occupied bins for `feature`.
    pub fn n_bins(&self, feature: usize) -> usize {
        self.thresholds[feature].len() + 1
    }

    pub fn bin(&self, row: usize, feature: usize) -> u8 {
        self.bins[feature][row]
    }

    pub fn threshold(&self, feature: usize, bin: u8) -> f64 {
        self.thresholds[feature][bin as usize]
    }
}

fn quantile_cuts(column: ArrayView1<f64>, max_bins: usize) -> Vec<f64> {
    let mut values: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
    values.sort_by(f64::total_cmp);
    values.dedup();
    if values.len() <= 1 {
        return Vec::new();
    }
    if values.len() <= max_bins {
        return values.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
    }
    let mut cuts: Vec<f64> = (1..max_bins)
        .map(|k| {
            let pos = k * (values.len() - 1) / max_bins;
            (values[pos] + values[pos + 1]) / 2.0
        })
        .collect();
    cuts.dedup();
    cuts
}

fn bin_of(cuts: &[f64], value: f64) -> u8 {
    cuts.partition_point(|t| *t < value) as u8
}

/// Growth limits for one tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// L2 penalty on leaf values (0 gives plain means).
    pub lambda: f64,
    /// Features drawn at each node (`None` = all allowed features).
    pub max_features: Option<usize>,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 6,
            min_samples_leaf: 1,
            lambda: 0.0,
            max_features: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        bin: u8,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Binary regression tree; rows with `x[feature] <= threshold` go left.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    nodes: Vec<Node>,
    n_features: usize,
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    gain: f64,
    feature: usize,
    bin: u8,
}

impl SplitCandidate {
    /// Higher gain wins; ties go to the lower feature, then the lower bin.
    fn better(self, other: Self) -> Self {
        match self.gain.total_cmp(&other.gain) {
            std::cmp::Ordering::Greater => self,
            std::cmp::Ordering::Less => other,
            std::cmp::Ordering::Equal => {
                if (self.feature, self.bin) <= (other.feature, other.bin) {
                    self
                } else {
                    other
                }
            }
        }
    }
}

impl RegressionTree {
    /// Grow a tree on `rows` of `binned`, fitting `targets` (indexed by row).
    ///
    /// `features` limits the columns the tree may split on; `rng` draws the
    /// per-node feature subsets when `params.max_features` is set.
    pub fn fit<R: Rng + ?Sized>(
        binned: &BinnedMatrix,
        targets: &[f64],
        rows: &[usize],
        features: &[usize],
        params: &TreeParams,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        if rows.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        if targets.len() != binned.n_rows() {
            return Err(ModelError::shape(
                format!("{} target(s)", binned.n_rows()),
                format!("{} target(s)", targets.len()),
            ));
        }
        if params.lambda < 0.0 {
            return Err(ModelError::InvalidParameter(format!(
                "lambda must be non-negative, got {}",
                params.lambda
            )));
        }
        let mut tree = Self {
            nodes: Vec::new(),
            n_features: binned.n_features(),
        };
        let mut rows = rows.to_vec();
        let mut feature_pool = features.to_vec();
        tree.grow(binned, targets, &mut rows, &mut feature_pool, params, 0, rng);
        Ok(tree)
    }

    #[allow(clippy::too_many_arguments)]
    fn grow<R: Rng + ?Sized>(
        &mut self,
        binned: &BinnedMatrix,
        targets: &[f64],
        rows: &mut [usize],
        feature_pool: &mut [usize],
        params: &TreeParams,
        depth: usize,
        rng: &mut R,
    ) -> usize {
        let sum: f64 = rows.iter().map(|r| targets[*r]).sum();
        let count = rows.len() as f64;
        let index = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: sum / (count + params.lambda),
        });

        let min_leaf = params.min_samples_leaf.max(1);
        if depth >= params.max_depth || rows.len() < 2 * min_leaf || feature_pool.is_empty() {
            return index;
        }

        let candidates: &[usize] = match params.max_features {
            Some(k) if k < feature_pool.len() => {
                let (chosen, _) = feature_pool.partial_shuffle(rng, k.max(1));
                chosen.sort_unstable();
                chosen
            }
            _ => &*feature_pool,
        };

        let parent_score = sum * sum / (count + params.lambda);
        let node_rows: &[usize] = rows;
        let best = candidates
            .par_iter()
            .filter_map(|&feature| {
                best_split_for_feature(binned, targets, node_rows, feature, params, sum, min_leaf)
            })
            .reduce_with(SplitCandidate::better);

        let Some(best) = best.filter(|b| b.gain - parent_score > 1e-12) else {
            return index;
        };

        let pivot = partition_rows(rows, |r| binned.bin(r, best.feature) <= best.bin);
        let (left_rows, right_rows) = rows.split_at_mut(pivot);
        let left = self.grow(binned, targets, left_rows, feature_pool, params, depth + 1, rng);
        let right = self.grow(binned, targets, right_rows, feature_pool, params, depth + 1, rng);
        self.nodes[index] = Node::Split {
            feature: best.feature,
            bin: best.bin,
            threshold: binned.threshold(best.feature, best.bin),
            left,
            right,
        };
        index
    }

    /// Predict one raw feature row.
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut node = 0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => node = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    /// Predict a row of the matrix the tree was grown on.
    pub fn predict_binned(&self, binned: &BinnedMatrix, row: usize) -> f64 {
        let mut node = 0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    bin,
                    left,
                    right,
                    ..
                } => {
                    node = if binned.bin(row, *feature) <= *bin {
                        *left
                    } else {
                        *right
                    }
                }
            }
        }
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        super::check_features(x, self.n_features)?;
        Ok(x.outer_iter().map(|row| self.predict_row(row)).collect())
    }

    /// Multiply every leaf value by `factor` (boosting shrinkage).
    pub fn scale_leaves(&mut self, factor: f64) {
        for node in &mut self.nodes {
            if let Node::Leaf { value } = node {
                *value *= factor;
            }
        }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], index: usize) -> usize {
            match &nodes[index] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}

/// Best split of `feature` by the regularized gain
/// `G_L²/(n_L+λ) + G_R²/(n_R+λ)`.
fn best_split_for_feature(
    binned: &BinnedMatrix,
    targets: &[f64],
    rows: &[usize],
    feature: usize,
    params: &TreeParams,
    total_sum: f64,
    min_leaf: usize,
) -> Option<SplitCandidate> {
    let n_bins = binned.n_bins(feature);
    if n_bins < 2 {
        return None;
    }
    let mut sums = vec![0.0f64; n_bins];
    let mut counts = vec![0usize; n_bins];
    for &r in rows {
        let b = binned.bin(r, feature) as usize;
        sums[b] += targets[r];
        counts[b] += 1;
    }

    let total = rows.len();
    let mut left_sum = 0.0;
    let mut left_count = 0usize;
    let mut best: Option<SplitCandidate> = None;
    for b in 0..n_bins - 1 {
        left_sum += sums[b];
        left_count += counts[b];
        if counts[b] == 0 {
            continue;
        }
        let right_count = total - left_count;
        if left_count < min_leaf || right_count < min_leaf {
            continue;
        }
        let right_sum = total_sum - left_sum;
        let gain = left_sum * left_sum / (left_count as f64 + params.lambda)
            + right_sum * right_sum / (right_count as f64 + params.lambda);
        let candidate = SplitCandidate {
            gain,
            feature,
            bin: b as u8,
        };
        best = Some(match best {
            Some(current) => current.better(candidate),
            None => candidate,
        });
    }
    best
}

/// Stable-enough in-place partition; returns the number of rows for which
/// `goes_left` holds (they end up first).
fn partition_rows(rows: &mut [usize], goes_left: impl Fn(usize) -> bool) -> usize {
    let mut pivot = 0;
    for i in 0..rows.len() {
        if goes_left(rows[i]) {
            rows.swap(pivot, i);
            pivot += 1;
        }
    }
    pivot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::step_problem;
    use ndarray::{Array2, array};
    use rand::{SeedableRng, rngs::StdRng};

    fn all(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    #[test]
    fn binning_respects_bin_limit_and_thresholds() {
        let x = Array2::from_shape_fn((1000, 2), |(i, j)| (i * (j + 1)) as f64);
        let binned = BinnedMatrix::new(x.view(), 16);
        assert_eq!(binned.n_rows(), 1000);
        assert!(binned.n_bins(0) <= 16);
        for row in 0..1000 {
            let b = binned.bin(row, 0);
            if (b as usize) < binned.n_bins(0) - 1 {
                assert!(x[(row, 0)] <= binned.threshold(0, b));
            }
            if b > 0 {
                assert!(x[(row, 0)] > binned.threshold(0, b - 1));
            }
        }
    }

    #[test]
    fn constant_column_has_one_bin() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0]];
        let binned = BinnedMatrix::new(x.view(), 64);
        assert_eq!(binned.n_bins(0), 1);
        assert_eq!(binned.n_bins(1), 3);
    }

    #[test]
    fn fits_step_function_exactly() {
        let (x, y) = step_problem(400, 3);
        let binned = BinnedMatrix::new(x.view(), 64);
        let params = TreeParams {
            max_depth: 4,
            ..TreeParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(
            &binned,
            y.as_slice().expect("contiguous"),
            &all(400),
            &all(4),
            &params,
            &mut rng,
        )
        .expect("fit");
        let pred = tree.predict(x.view()).expect("predict");
        let max_err = pred
            .iter()
            .zip(y.iter())
            .map(|(p, t)| (p - t).abs())
            .fold(0.0, f64::max);
        assert!(max_err < 1e-9, "max error {max_err}");
        assert!(tree.depth() <= 4);
        assert_eq!(tree.n_leaves(), 4);
    }

    #[test]
    fn binned_and_raw_predictions_agree() {
        let (x, y) = step_problem(200, 9);
        let binned = BinnedMatrix::new(x.view(), 32);
        let mut rng = StdRng::seed_from_u64(1);
        let tree = RegressionTree::fit(
            &binned,
            y.as_slice().expect("contiguous"),
            &all(200),
            &all(4),
            &TreeParams::default(),
            &mut rng,
        )
        .expect("fit");
        for row in 0..200 {
            assert_eq!(
                tree.predict_binned(&binned, row),
                tree.predict_row(x.row(row))
            );
        }
    }

    #[test]
    fn lambda_shrinks_leaves_and_depth_zero_is_a_stump() {
        let x = array![[0.0], [1.0]];
        let y = [2.0, 2.0];
        let binned = BinnedMatrix::new(x.view(), 8);
        let params = TreeParams {
            max_depth: 0,
            lambda: 2.0,
            ..TreeParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(&binned, &y, &[0, 1], &[0], &params, &mut rng).expect("fit");
        // G / (n + λ) = 4 / 4
        assert_eq!(tree.predict_row(x.row(0)), 1.0);
        assert_eq!(tree.n_leaves(), 1);
    }

    #[test]
    fn min_samples_leaf_limits_splits() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = [0.0, 0.0, 0.0, 10.0];
        let binned = BinnedMatrix::new(x.view(), 8);
        let params = TreeParams {
            min_samples_leaf: 2,
            ..TreeParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let tree =
            RegressionTree::fit(&binned, &y, &all(4), &[0], &params, &mut rng).expect("fit");
        assert_eq!(tree.n_leaves(), 2);
        assert_eq!(tree.predict_row(x.row(3)), 5.0);
    }

    #[test]
    fn rejects_empty_rows() {
        let x = array![[0.0]];
        let binned = BinnedMatrix::new(x.view(), 8);
        let mut rng = StdRng::seed_from_u64(0);
        let err = RegressionTree::fit(&binned, &[1.0], &[], &[0], &TreeParams::default(), &mut rng);
        assert_eq!(err, Err(ModelError::EmptyTrainingSet));
    }
}
