//! Convolutional encoder-decoder regressor.
//!
//! Encoder level `l` runs two 3x3 conv + leaky ReLU layers with
//! `base_channels * 2^l` filters followed by 2x2 max pooling (except at the
//! bottom level). Each decoder level upsamples, concatenates the matching
//! encoder output and runs another conv block. A global average pool and a
//! dense layer turn the final feature map into one value.
//!
//! Training minimizes MSE on standardized targets with Adam. Gradients of a
//! mini-batch are computed per sample in parallel and summed. Early stopping
//! monitors validation MAE (or training loss without a validation set) and
//! restores the best weights.

use log::{debug, info, warn};
use ndarray::{Array1, Array3, ArrayView1, ArrayView3, ArrayView4, ArrayViewD, ArrayViewMutD, Axis};
use rand::{Rng, SeedableRng, distributions::Uniform, rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;
use scanfit_utils::{UNetSettings, timing_guard};

use super::layers::{
    Adam, Conv3x3, concat_channels, global_average_pool, leaky_relu_backward,
    leaky_relu_in_place, max_pool2, max_pool2_backward, split_channels, upsample2,
    upsample2_backward,
};
use super::{ImageRegressor, StandardScaler, TrainSchedule, TrainingHistory, ValidationSet};
use crate::error::ModelError;

/// Training images inspected for dead pooled features before fitting.
const FEATURE_CHECK_SAMPLES: usize = 32;

/// Fresh initializations tried when the pooled features are dead.
const REINIT_ATTEMPTS: u64 = 4;

/// Seed increment between re-initializations.
const REINIT_SEED_STEP: u64 = 4;

/// Model input dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Shape of a `(channels, height, width)` sample.
    pub fn from_chw((channels, height, width): (usize, usize, usize)) -> Self {
        Self::new(height, width, channels)
    }
}

impl Default for InputShape {
    fn default() -> Self {
        Self::new(128, 128, 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ConvBlock {
    first: Conv3x3,
    second: Conv3x3,
}

#[derive(Debug, Clone)]
struct BlockCache {
    input: Array3<f32>,
    mid: Array3<f32>,
    out: Array3<f32>,
}

impl ConvBlock {
    fn new<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        Self {
            first: Conv3x3::new(in_channels, out_channels, rng),
            second: Conv3x3::new(out_channels, out_channels, rng),
        }
    }

    fn forward(&self, input: Array3<f32>) -> BlockCache {
        let mut mid = self.first.forward(input.view());
        leaky_relu_in_place(&mut mid);
        let mut out = self.second.forward(mid.view());
        leaky_relu_in_place(&mut out);
        BlockCache { input, mid, out }
    }

    /// Accumulate parameter gradients; returns the input gradient when asked.
    fn backward(
        &self,
        cache: &BlockCache,
        mut grad_out: Array3<f32>,
        grads: &mut ConvBlock,
        want_input: bool,
    ) -> Option<Array3<f32>> {
        leaky_relu_backward(&mut grad_out, cache.out.view());
        self.second
            .accumulate_param_grads(cache.mid.view(), grad_out.view(), &mut grads.second);
        let mut grad_mid = self.second.input_grad(grad_out.view());
        leaky_relu_backward(&mut grad_mid, cache.mid.view());
        self.first
            .accumulate_param_grads(cache.input.view(), grad_mid.view(), &mut grads.first);
        want_input.then(|| self.first.input_grad(grad_mid.view()))
    }
}

/// Trainable parameters; also used as the gradient accumulator.
#[derive(Debug, Clone, PartialEq)]
struct Network {
    encoders: Vec<ConvBlock>,
    /// `decoders[k]` works at encoder level `depth - 2 - k`.
    decoders: Vec<ConvBlock>,
    head_weight: Array1<f32>,
    head_bias: Array1<f32>,
}

struct ForwardCache {
    encoders: Vec<BlockCache>,
    pool_args: Vec<ndarray::Array3<u8>>,
    decoders: Vec<BlockCache>,
    pooled: Array1<f32>,
    final_shape: (usize, usize, usize),
}

impl Network {
    fn new<R: Rng + ?Sized>(shape: InputShape, base: usize, depth: usize, rng: &mut R) -> Self {
        let channels = |level: usize| base << level;
        let mut encoders = Vec::with_capacity(depth);
        let mut in_channels = shape.channels;
        for level in 0..depth {
            encoders.push(ConvBlock::new(in_channels, channels(level), rng));
            in_channels = channels(level);
        }
        let decoders = (0..depth.saturating_sub(1))
            .map(|k| {
                let level = depth - 2 - k;
                ConvBlock::new(channels(level + 1) + channels(level), channels(level), rng)
            })
            .collect();
        let limit = (6.0 / (base + 1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        Self {
            encoders,
            decoders,
            head_weight: Array1::from_shape_fn(base, |_| rng.sample(dist)),
            head_bias: Array1::zeros(1),
        }
    }

    fn depth(&self) -> usize {
        self.encoders.len()
    }

    fn tensors(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut out = Vec::new();
        for block in self.encoders.iter().chain(&self.decoders) {
            for conv in [&block.first, &block.second] {
                out.push(conv.weight.view().into_dyn());
                out.push(conv.bias.view().into_dyn());
            }
        }
        out.push(self.head_weight.view().into_dyn());
        out.push(self.head_bias.view().into_dyn());
        out
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut out = Vec::new();
        for block in self.encoders.iter_mut().chain(self.decoders.iter_mut()) {
            for conv in [&mut block.first, &mut block.second] {
                out.push(conv.weight.view_mut().into_dyn());
                out.push(conv.bias.view_mut().into_dyn());
            }
        }
        out.push(self.head_weight.view_mut().into_dyn());
        out.push(self.head_bias.view_mut().into_dyn());
        out
    }

    fn parameter_count(&self) -> usize {
        self.tensors().iter().map(|t| t.len()).sum()
    }

    fn zeros_like(&self) -> Self {
        let mut zeros = self.clone();
        for mut tensor in zeros.tensors_mut() {
            tensor.fill(0.0);
        }
        zeros
    }

    fn accumulate(&mut self, other: &Network) {
        for (mut mine, theirs) in self.tensors_mut().into_iter().zip(other.tensors()) {
            mine += &theirs;
        }
    }

    fn forward(&self, sample: ArrayView3<f32>) -> (f32, ForwardCache) {
        let depth = self.depth();
        let mut encoders: Vec<BlockCache> = Vec::with_capacity(depth);
        let mut pool_args = Vec::with_capacity(depth.saturating_sub(1));
        let mut current = sample.to_owned();
        for (level, block) in self.encoders.iter().enumerate() {
            let cache = block.forward(current);
            current = if level + 1 < depth {
                let (pooled, arg) = max_pool2(cache.out.view());
                pool_args.push(arg);
                pooled
            } else {
                cache.out.clone()
            };
            encoders.push(cache);
        }

        let mut decoders = Vec::with_capacity(self.decoders.len());
        for (k, block) in self.decoders.iter().enumerate() {
            let level = depth - 2 - k;
            let up = upsample2(current.view());
            let cache = block.forward(concat_channels(up.view(), encoders[level].out.view()));
            current = cache.out.clone();
            decoders.push(cache);
        }

        let pooled = global_average_pool(current.view());
        let prediction = self.head_weight.dot(&pooled) + self.head_bias[0];
        let cache = ForwardCache {
            encoders,
            pool_args,
            decoders,
            pooled,
            final_shape: current.dim(),
        };
        (prediction, cache)
    }

    fn predict_one(&self, sample: ArrayView3<f32>) -> f32 {
        self.forward(sample).0
    }

    /// Add the gradient of `d_pred * prediction` into `grads`.
    fn backward(&self, cache: &ForwardCache, d_pred: f32, grads: &mut Network) {
        let depth = self.depth();
        grads.head_weight.scaled_add(d_pred, &cache.pooled);
        grads.head_bias[0] += d_pred;

        let (_, h, w) = cache.final_shape;
        let area = (h * w).max(1) as f32;
        let mut grad = Array3::from_shape_fn(cache.final_shape, |(c, _, _)| {
            d_pred * self.head_weight[c] / area
        });

        let mut skip_grads: Vec<Option<Array3<f32>>> = vec![None; depth];
        for k in (0..self.decoders.len()).rev() {
            let level = depth - 2 - k;
            let Some(grad_cat) =
                self.decoders[k].backward(&cache.decoders[k], grad, &mut grads.decoders[k], true)
            else {
                return;
            };
            let up_channels = self.encoders[level + 1].second.out_channels();
            let (grad_up, grad_skip) = split_channels(grad_cat.view(), up_channels);
            skip_grads[level] = Some(grad_skip.to_owned());
            grad = upsample2_backward(grad_up);
        }

        for level in (0..depth).rev() {
            if let Some(skip) = skip_grads[level].take() {
                grad += &skip;
            }
            let Some(grad_in) = self.encoders[level].backward(
                &cache.encoders[level],
                grad,
                &mut grads.encoders[level],
                level > 0,
            ) else {
                return;
            };
            grad = max_pool2_backward(grad_in.view(), &cache.pool_args[level - 1]);
        }
    }
}

/// Convolutional regressor over `(samples, channels, height, width)` tensors.
#[derive(Debug, Clone)]
pub struct UNetRegressor {
    shape: InputShape,
    settings: UNetSettings,
    network: Network,
    target_scaler: StandardScaler,
    fitted: bool,
}

/// Build an untrained model for `shape`.
///
/// Height and width must be divisible by `2^(depth - 1)` so pooled maps
/// upsample back to the skip-connection sizes.
pub fn build_unet_model(
    shape: InputShape,
    settings: &UNetSettings,
) -> Result<UNetRegressor, ModelError> {
    if settings.depth == 0 || settings.base_channels == 0 {
        return Err(ModelError::InvalidParameter(format!(
            "depth ({}) and base_channels ({}) must be positive",
            settings.depth, settings.base_channels
        )));
    }
    if settings.depth > 8 {
        return Err(ModelError::InvalidParameter(format!(
            "depth {} is too large",
            settings.depth
        )));
    }
    if shape.channels == 0 || shape.height == 0 || shape.width == 0 {
        return Err(ModelError::InvalidParameter(format!(
            "input shape {shape:?} has an empty dimension"
        )));
    }
    let factor = 1usize << (settings.depth - 1);
    if shape.height % factor != 0 || shape.width % factor != 0 {
        return Err(ModelError::InvalidParameter(format!(
            "input {}x{} is not divisible by {factor} (depth {})",
            shape.height, shape.width, settings.depth
        )));
    }
    if settings.learning_rate.is_nan() || settings.learning_rate <= 0.0 {
        return Err(ModelError::InvalidParameter(format!(
            "learning rate must be positive, got {}",
            settings.learning_rate
        )));
    }
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let network = Network::new(shape, settings.base_channels, settings.depth, &mut rng);
    debug!(
        "Built UNet for {}x{}x{} input: depth {}, {} parameter(s)",
        shape.height,
        shape.width,
        shape.channels,
        settings.depth,
        network.parameter_count()
    );
    Ok(UNetRegressor {
        shape,
        settings: settings.clone(),
        network,
        target_scaler: StandardScaler::new(),
        fitted: false,
    })
}

impl UNetRegressor {
    pub fn input_shape(&self) -> InputShape {
        self.shape
    }

    pub fn parameter_count(&self) -> usize {
        self.network.parameter_count()
    }

    fn check_images(&self, images: &ArrayView4<f32>) -> Result<(), ModelError> {
        let (_, c, h, w) = images.dim();
        if (c, h, w) != (self.shape.channels, self.shape.height, self.shape.width) {
            return Err(ModelError::shape(
                format!(
                    "(_, {}, {}, {})",
                    self.shape.channels, self.shape.height, self.shape.width
                ),
                format!("{:?}", images.dim()),
            ));
        }
        Ok(())
    }

    fn predict_standardized(&self, images: ArrayView4<f32>) -> Array1<f64> {
        let values: Vec<f64> = (0..images.dim().0)
            .into_par_iter()
            .map(|i| self.network.predict_one(images.index_axis(Axis(0), i)) as f64)
            .collect();
        Array1::from(values)
    }

    /// Largest spread of any pooled feature across the first `limit` samples.
    /// Zero means the head sees the same input for every image.
    fn pooled_feature_spread(&self, images: ArrayView4<f32>, limit: usize) -> f32 {
        let pooled: Vec<Array1<f32>> = (0..images.dim().0.min(limit))
            .into_par_iter()
            .map(|i| self.network.forward(images.index_axis(Axis(0), i)).1.pooled)
            .collect();
        let Some(first) = pooled.first() else {
            return 0.0;
        };
        (0..first.len())
            .map(|c| {
                let (lo, hi) = pooled.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| {
                    (lo.min(p[c]), hi.max(p[c]))
                });
                hi - lo
            })
            .fold(0.0, f32::max)
    }

    /// Re-initialize the network when every checked image pools to the same
    /// features. Identical inputs are left alone.
    fn revive_dead_features(&mut self, images: ArrayView4<f32>) {
        let checked = images.dim().0.min(FEATURE_CHECK_SAMPLES);
        if checked < 2 {
            return;
        }
        let first = images.index_axis(Axis(0), 0);
        let inputs_differ = (1..checked).any(|i| images.index_axis(Axis(0), i) != first);
        if !inputs_differ || self.pooled_feature_spread(images, checked) > f32::EPSILON {
            return;
        }
        for attempt in 1..=REINIT_ATTEMPTS {
            let seed = self.settings.seed.wrapping_add(attempt * REINIT_SEED_STEP);
            let candidate = Network::new(
                self.shape,
                self.settings.base_channels,
                self.settings.depth,
                &mut StdRng::seed_from_u64(seed),
            );
            let previous = std::mem::replace(&mut self.network, candidate);
            if self.pooled_feature_spread(images, checked) > f32::EPSILON {
                warn!(
                    "UNet features were identical for every checked image; \
                     re-initialized with seed {seed}"
                );
                return;
            }
            self.network = previous;
        }
        warn!(
            "UNet features are identical for every checked image; predictions will stay \
             near the target mean (try another seed or learning rate)"
        );
    }

    fn validation_mae(&self, validation: &ValidationSet<'_>) -> Result<f64, ModelError> {
        let (images, targets) = validation;
        let standardized = self.predict_standardized(images.view());
        let predictions = self.target_scaler.inverse_column(standardized.view())?;
        Ok(mean_abs_diff(predictions.view(), targets.view()))
    }
}

fn mean_abs_diff(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(p, q)| (p - q).abs()).sum::<f64>() / a.len() as f64
}

impl ImageRegressor for UNetRegressor {
    fn name(&self) -> &str {
        "UNet"
    }

    fn fit(
        &mut self,
        images: ArrayView4<f32>,
        targets: ArrayView1<f64>,
        schedule: &TrainSchedule,
        validation: Option<ValidationSet<'_>>,
    ) -> Result<TrainingHistory, ModelError> {
        let _guard = timing_guard("train unet", log::Level::Debug);
        let n = images.dim().0;
        if n == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        if n != targets.len() {
            return Err(ModelError::shape(
                format!("{n} target(s)"),
                format!("{} target(s)", targets.len()),
            ));
        }
        self.check_images(&images)?;
        if let Some((val_images, val_targets)) = &validation {
            self.check_images(val_images)?;
            if val_images.dim().0 != val_targets.len() {
                return Err(ModelError::shape(
                    format!("{} validation target(s)", val_images.dim().0),
                    format!("{} validation target(s)", val_targets.len()),
                ));
            }
        }

        self.revive_dead_features(images);

        let standardized = self.target_scaler.fit_transform_column(targets)?;
        self.fitted = true;
        let batch_size = schedule.batch_size.max(1);
        let mut optimizer = Adam::new(self.settings.learning_rate, &self.network.tensors());
        let mut rng = StdRng::seed_from_u64(self.settings.seed.wrapping_add(1));
        let mut order: Vec<usize> = (0..n).collect();

        let mut history = TrainingHistory::default();
        let mut best_metric = f64::INFINITY;
        let mut best_network = self.network.clone();
        let mut waited = 0usize;

        for epoch in 0..schedule.epochs {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0f64;
            for batch in order.chunks(batch_size) {
                let scale = 2.0 / batch.len() as f32;
                let network = &self.network;
                let (grads, loss) = batch
                    .par_iter()
                    .fold(
                        || (network.zeros_like(), 0.0f64),
                        |(mut grads, loss), &i| {
                            let (prediction, cache) =
                                network.forward(images.index_axis(Axis(0), i));
                            let error = prediction - standardized[i] as f32;
                            network.backward(&cache, scale * error, &mut grads);
                            (grads, loss + (error * error) as f64)
                        },
                    )
                    .reduce(
                        || (network.zeros_like(), 0.0f64),
                        |(mut a, la), (b, lb)| {
                            a.accumulate(&b);
                            (a, la + lb)
                        },
                    );
                optimizer.step(self.network.tensors_mut(), grads.tensors());
                epoch_loss += loss;
            }

            let train_loss = epoch_loss / n as f64;
            history.train_loss.push(train_loss);
            let metric = match &validation {
                Some(set) => {
                    let mae = self.validation_mae(set)?;
                    history.val_mae.push(mae);
                    mae
                }
                None => train_loss,
            };
            debug!("epoch {}/{}: loss {train_loss:.5}, monitor {metric:.5}", epoch + 1, schedule.epochs);

            if metric < best_metric {
                best_metric = metric;
                best_network = self.network.clone();
                history.best_epoch = epoch;
                waited = 0;
            } else {
                waited += 1;
                if schedule.patience > 0 && waited >= schedule.patience {
                    history.stopped_early = true;
                    info!(
                        "Early stopping after epoch {}; restoring epoch {}",
                        epoch + 1,
                        history.best_epoch + 1
                    );
                    break;
                }
            }
        }

        if history.epochs_run() > 0 {
            self.network = best_network;
        }
        Ok(history)
    }

    fn predict(&self, images: ArrayView4<f32>) -> Result<Array1<f64>, ModelError> {
        if !self.fitted {
            return Err(ModelError::NotFitted);
        }
        self.check_images(&images)?;
        let standardized = self.predict_standardized(images);
        self.target_scaler.inverse_column(standardized.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, s};

    fn tiny_settings() -> UNetSettings {
        UNetSettings {
            base_channels: 2,
            depth: 2,
            epochs: 40,
            batch_size: 4,
            learning_rate: 1e-2,
            patience: 0,
            seed: 3,
        }
    }

    /// Brightness regression: label = 10 * mean intensity.
    fn brightness_set(n: usize) -> (Array4<f32>, Array1<f64>) {
        let mut images = Array4::<f32>::zeros((n, 1, 8, 8));
        let mut labels = Array1::<f64>::zeros(n);
        for i in 0..n {
            let level = i as f32 / (n - 1) as f32;
            images.slice_mut(s![i, 0, .., ..]).fill(level);
            labels[i] = 10.0 * level as f64;
        }
        (images, labels)
    }

    #[test]
    fn rejects_indivisible_input() {
        let settings = UNetSettings {
            depth: 3,
            ..tiny_settings()
        };
        let err = build_unet_model(InputShape::new(10, 8, 1), &settings).expect_err("10 % 4");
        assert!(matches!(err, ModelError::InvalidParameter(_)));
    }

    #[test]
    fn predict_before_fit_fails() {
        let model = build_unet_model(InputShape::new(8, 8, 1), &tiny_settings()).expect("build");
        let (images, _) = brightness_set(3);
        assert_eq!(model.predict(images.view()), Err(ModelError::NotFitted));
    }

    #[test]
    fn network_gradient_matches_finite_difference() {
        let model = build_unet_model(InputShape::new(4, 4, 1), &tiny_settings()).expect("build");
        let sample = Array3::from_shape_fn((1, 4, 4), |(_, y, x)| ((y * 4 + x) % 5) as f32 / 5.0);
        let (_, cache) = model.network.forward(sample.view());
        let mut grads = model.network.zeros_like();
        model.network.backward(&cache, 1.0, &mut grads);

        let h = 1e-3f32;
        let mut plus = model.network.clone();
        let mut minus = model.network.clone();
        plus.encoders[0].first.bias[0] += h;
        minus.encoders[0].first.bias[0] -= h;
        let numeric = (plus.predict_one(sample.view()) - minus.predict_one(sample.view())) / (2.0 * h);
        let analytic = grads.encoders[0].first.bias[0];
        assert!((numeric - analytic).abs() < 1e-2, "numeric {numeric} vs analytic {analytic}");

        let mut plus = model.network.clone();
        let mut minus = model.network.clone();
        plus.head_weight[1] += h;
        minus.head_weight[1] -= h;
        let numeric = (plus.predict_one(sample.view()) - minus.predict_one(sample.view())) / (2.0 * h);
        assert!((numeric - grads.head_weight[1]).abs() < 1e-3);
    }

    #[test]
    fn learns_brightness_regression() {
        let (images, labels) = brightness_set(16);
        let mut model = build_unet_model(InputShape::new(8, 8, 1), &tiny_settings()).expect("build");
        let schedule = TrainSchedule {
            epochs: 60,
            batch_size: 4,
            patience: 0,
        };
        let history = model
            .fit(images.view(), labels.view(), &schedule, None)
            .expect("fit");
        assert_eq!(history.epochs_run(), 60);
        assert!(history.train_loss[59] < history.train_loss[0]);

        let pred = model.predict(images.view()).expect("predict");
        let mae = mean_abs_diff(pred.view(), labels.view());
        assert!(mae < 2.0, "train MAE {mae}");
    }

    #[test]
    fn fresh_seeds_separate_images() {
        let (images, labels) = brightness_set(16);
        for seed in [3, 7, 11] {
            let settings = UNetSettings {
                seed,
                ..tiny_settings()
            };
            let mut fresh = build_unet_model(InputShape::new(8, 8, 1), &settings).expect("build");
            assert!(
                fresh.pooled_feature_spread(images.view(), 16) > 0.0,
                "seed {seed} starts with constant features"
            );
            let schedule = TrainSchedule {
                epochs: 40,
                batch_size: 4,
                patience: 0,
            };
            fresh
                .fit(images.view(), labels.view(), &schedule, None)
                .expect("fit");
            let pred = fresh.predict(images.view()).expect("predict");
            let spread = pred.fold(f64::NEG_INFINITY, |a, b| a.max(*b))
                - pred.fold(f64::INFINITY, |a, b| a.min(*b));
            assert!(spread > 0.5, "seed {seed} collapsed to a constant ({spread})");
        }
    }

    fn kill_final_block(model: &mut UNetRegressor) {
        let last = model.network.decoders.last_mut().expect("decoder");
        last.second.weight.fill(0.0);
        last.second.bias.fill(-1.0);
    }

    #[test]
    fn dead_final_block_is_reinitialized() {
        let (images, labels) = brightness_set(16);
        let mut model = build_unet_model(InputShape::new(8, 8, 1), &tiny_settings()).expect("build");
        kill_final_block(&mut model);
        assert!(model.pooled_feature_spread(images.view(), 16) < 1e-6);

        model.revive_dead_features(images.view());
        assert!(model.pooled_feature_spread(images.view(), 16) > 0.0);

        let mut model = build_unet_model(InputShape::new(8, 8, 1), &tiny_settings()).expect("build");
        kill_final_block(&mut model);
        let schedule = TrainSchedule {
            epochs: 60,
            batch_size: 4,
            patience: 0,
        };
        model
            .fit(images.view(), labels.view(), &schedule, None)
            .expect("fit");
        let pred = model.predict(images.view()).expect("predict");
        assert!(pred[15] > pred[0], "{pred}");
    }

    #[test]
    fn identical_inputs_keep_their_weights() {
        let images = Array4::<f32>::from_elem((4, 1, 8, 8), 0.5);
        let mut model = build_unet_model(InputShape::new(8, 8, 1), &tiny_settings()).expect("build");
        kill_final_block(&mut model);
        let before = model.network.clone();
        model.revive_dead_features(images.view());
        assert_eq!(model.network, before);
    }

    #[test]
    fn early_stopping_tracks_validation_and_restores_best() {
        let (images, labels) = brightness_set(12);
        let mut model = build_unet_model(InputShape::new(8, 8, 1), &tiny_settings()).expect("build");
        let schedule = TrainSchedule {
            epochs: 30,
            batch_size: 4,
            patience: 2,
        };
        let history = model
            .fit(
                images.view(),
                labels.view(),
                &schedule,
                Some((images.view(), labels.view())),
            )
            .expect("fit");
        assert_eq!(history.val_mae.len(), history.epochs_run());
        let best = history.val_mae[history.best_epoch];
        assert!(history.val_mae.iter().all(|v| *v >= best));
        let restored = mean_abs_diff(model.predict(images.view()).expect("predict").view(), labels.view());
        assert!((restored - best).abs() < 1e-4, "{restored} vs {best}");
    }

    #[test]
    fn depth_one_has_no_decoder() {
        let settings = UNetSettings {
            depth: 1,
            ..tiny_settings()
        };
        let mut model = build_unet_model(InputShape::new(5, 7, 2), &settings).expect("build");
        let images = Array4::<f32>::from_elem((3, 2, 5, 7), 0.5);
        let labels = Array1::from(vec![1.0, 2.0, 3.0]);
        let schedule = TrainSchedule {
            epochs: 2,
            batch_size: 2,
            patience: 0,
        };
        model
            .fit(images.view(), labels.view(), &schedule, None)
            .expect("fit");
        assert_eq!(model.predict(images.view()).expect("predict").len(), 3);
    }
}
