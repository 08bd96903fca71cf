//! CPU building blocks for the convolutional regressor: 3x3 convolutions,
//! 2x2 max pooling, nearest-neighbour upsampling and the Adam optimizer.
//!
//! Tensors are single samples in `(channels, height, width)` layout.

use std::ops::Range;

use ndarray::{Array1, Array3, Array4, ArrayD, ArrayView3, ArrayViewD, ArrayViewMutD, Axis, Zip, s};
use rand::{Rng, distributions::Uniform};

/// Negative-side slope of the activation; keeps gradients flowing through
/// units that start out negative.
pub(crate) const LEAK: f32 = 0.01;

/// Initial conv bias, so fresh units start on the active side.
const BIAS_INIT: f32 = 0.01;

/// Same-padded 3x3 convolution.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Conv3x3 {
    /// `(out_channels, in_channels, 3, 3)`
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
}

/// Output and input index ranges for kernel tap `k` (0, 1 or 2) along an
/// axis of length `len`; output index `i` reads input `i + k - 1`.
fn tap_ranges(len: usize, k: usize) -> (Range<usize>, Range<usize>) {
    match k {
        0 => (1..len, 0..len - 1),
        1 => (0..len, 0..len),
        _ => (0..len - 1, 1..len),
    }
}

impl Conv3x3 {
    /// He-uniform weights, small positive biases.
    pub fn new<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (in_channels * 9) as f32).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        Self {
            weight: Array4::from_shape_fn((out_channels, in_channels, 3, 3), |_| rng.sample(dist)),
            bias: Array1::from_elem(out_channels, BIAS_INIT),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn forward(&self, input: ArrayView3<f32>) -> Array3<f32> {
        let (_, h, w) = input.dim();
        let mut out = Array3::<f32>::zeros((self.out_channels(), h, w));
        for (o, mut plane) in out.outer_iter_mut().enumerate() {
            plane.fill(self.bias[o]);
            for (i, src) in input.outer_iter().enumerate() {
                for ky in 0..3 {
                    let (dy, sy) = tap_ranges(h, ky);
                    for kx in 0..3 {
                        let (dx, sx) = tap_ranges(w, kx);
                        plane.slice_mut(s![dy.clone(), dx]).scaled_add(
                            self.weight[(o, i, ky, kx)],
                            &src.slice(s![sy.clone(), sx]),
                        );
                    }
                }
            }
        }
        out
    }

    /// Add this layer's weight and bias gradients into `grads`.
    pub fn accumulate_param_grads(
        &self,
        input: ArrayView3<f32>,
        grad_out: ArrayView3<f32>,
        grads: &mut Conv3x3,
    ) {
        let (_, h, w) = input.dim();
        for (o, g) in grad_out.outer_iter().enumerate() {
            grads.bias[o] += g.sum();
            for (i, src) in input.outer_iter().enumerate() {
                for ky in 0..3 {
                    let (dy, sy) = tap_ranges(h, ky);
                    for kx in 0..3 {
                        let (dx, sx) = tap_ranges(w, kx);
                        let acc = Zip::from(g.slice(s![dy.clone(), dx]))
                            .and(src.slice(s![sy.clone(), sx]))
                            .fold(0.0f32, |acc, a, b| acc + a * b);
                        grads.weight[(o, i, ky, kx)] += acc;
                    }
                }
            }
        }
    }

    /// Gradient with respect to the layer input.
    pub fn input_grad(&self, grad_out: ArrayView3<f32>) -> Array3<f32> {
        let (_, h, w) = grad_out.dim();
        let mut grad_in = Array3::<f32>::zeros((self.in_channels(), h, w));
        for (i, mut dst) in grad_in.outer_iter_mut().enumerate() {
            for (o, g) in grad_out.outer_iter().enumerate() {
                for ky in 0..3 {
                    let (dy, sy) = tap_ranges(h, ky);
                    for kx in 0..3 {
                        let (dx, sx) = tap_ranges(w, kx);
                        dst.slice_mut(s![sy.clone(), sx])
                            .scaled_add(self.weight[(o, i, ky, kx)], &g.slice(s![dy.clone(), dx]));
                    }
                }
            }
        }
        grad_in
    }
}

/// Leaky ReLU.
pub(crate) fn leaky_relu_in_place(x: &mut Array3<f32>) {
    x.mapv_inplace(|v| if v > 0.0 { v } else { LEAK * v });
}

/// Scale the gradient by the slope on the side the activation landed on.
pub(crate) fn leaky_relu_backward(grad: &mut Array3<f32>, output: ArrayView3<f32>) {
    Zip::from(grad).and(output).for_each(|g, &o| {
        if o <= 0.0 {
            *g *= LEAK;
        }
    });
}

/// 2x2 max pooling with stride 2. Returns the pooled tensor and, per output
/// cell, the position (0..4, row-major) of the winning input.
pub(crate) fn max_pool2(input: ArrayView3<f32>) -> (Array3<f32>, Array3<u8>) {
    let (c, h, w) = input.dim();
    let (oh, ow) = (h / 2, w / 2);
    let mut out = Array3::<f32>::zeros((c, oh, ow));
    let mut arg = Array3::<u8>::zeros((c, oh, ow));
    for ch in 0..c {
        for y in 0..oh {
            for x in 0..ow {
                let mut best = f32::NEG_INFINITY;
                let mut best_k = 0u8;
                for k in 0..4u8 {
                    let v = input[(ch, 2 * y + (k / 2) as usize, 2 * x + (k % 2) as usize)];
                    if v > best {
                        best = v;
                        best_k = k;
                    }
                }
                out[(ch, y, x)] = best;
                arg[(ch, y, x)] = best_k;
            }
        }
    }
    (out, arg)
}

pub(crate) fn max_pool2_backward(grad_out: ArrayView3<f32>, arg: &Array3<u8>) -> Array3<f32> {
    let (c, oh, ow) = grad_out.dim();
    let mut grad_in = Array3::<f32>::zeros((c, oh * 2, ow * 2));
    for ((ch, y, x), &k) in arg.indexed_iter() {
        grad_in[(ch, 2 * y + (k / 2) as usize, 2 * x + (k % 2) as usize)] += grad_out[(ch, y, x)];
    }
    grad_in
}

/// Nearest-neighbour 2x upsampling.
pub(crate) fn upsample2(input: ArrayView3<f32>) -> Array3<f32> {
    let (c, h, w) = input.dim();
    Array3::from_shape_fn((c, h * 2, w * 2), |(ch, y, x)| input[(ch, y / 2, x / 2)])
}

pub(crate) fn upsample2_backward(grad_out: ArrayView3<f32>) -> Array3<f32> {
    let (c, h, w) = grad_out.dim();
    let mut grad_in = Array3::<f32>::zeros((c, h / 2, w / 2));
    for ((ch, y, x), g) in grad_out.indexed_iter() {
        grad_in[(ch, y / 2, x / 2)] += *g;
    }
    grad_in
}

/// Adam with bias correction (epsilon added outside the square root).
#[derive(Debug, Clone)]
pub(crate) struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    first: Vec<ArrayD<f32>>,
    second: Vec<ArrayD<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f32, shapes: &[ArrayViewD<'_, f32>]) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            first: shapes.iter().map(|t| ArrayD::zeros(t.raw_dim())).collect(),
            second: shapes.iter().map(|t| ArrayD::zeros(t.raw_dim())).collect(),
        }
    }

    pub fn step(&mut self, params: Vec<ArrayViewMutD<'_, f32>>, grads: Vec<ArrayViewD<'_, f32>>) {
        self.step += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let lr = self.learning_rate * (1.0 - b2.powi(self.step)).sqrt() / (1.0 - b1.powi(self.step));
        for (((param, grad), m), v) in params
            .into_iter()
            .zip(grads)
            .zip(self.first.iter_mut())
            .zip(self.second.iter_mut())
        {
            Zip::from(param)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= lr * *m / (v.sqrt() + eps);
                });
        }
    }
}

/// Sum of `(channels, height, width)` planes into a per-channel mean.
pub(crate) fn global_average_pool(input: ArrayView3<f32>) -> Array1<f32> {
    let (_, h, w) = input.dim();
    let area = (h * w).max(1) as f32;
    input.outer_iter().map(|plane| plane.sum() / area).collect()
}

/// Concatenate along the channel axis.
pub(crate) fn concat_channels(a: ArrayView3<f32>, b: ArrayView3<f32>) -> Array3<f32> {
    let (ca, h, w) = a.dim();
    let mut out = Array3::<f32>::zeros((ca + b.dim().0, h, w));
    out.slice_mut(s![..ca, .., ..]).assign(&a);
    out.slice_mut(s![ca.., .., ..]).assign(&b);
    out
}

pub(crate) fn split_channels(x: ArrayView3<'_, f32>, at: usize) -> (ArrayView3<'_, f32>, ArrayView3<'_, f32>) {
    x.split_at(Axis(0), at)
}
