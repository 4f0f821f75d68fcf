//! 2D Convolution
//!
//! Each of the `out_channels` filters spans every input channel and a
//! `kernel_size × kernel_size` window. There is no padding: windows start at
//! integer multiples of `stride` from the top-left corner and must fit
//! entirely inside the input plane.
//!
//! ## Forward Pass
//!
//! ```text
//! out_size = (in_size - k) / stride + 1
//!
//! y[o][x][y] = b[o] + sum over i, kx, ky of
//!              x[i][x*stride + kx][y*stride + ky] · W[o][i][kx][ky]
//! ```
//!
//! ## Backward Pass
//!
//! Parameter gradients are batch means:
//!
//! ```text
//! grad_W[o][i][kx][ky] = mean_b sum over x, y of grad_y[o][x][y] · x[i][x*stride + kx][y*stride + ky]
//! grad_b[o]            = mean_b sum over x, y of grad_y[o][x][y]
//! ```
//!
//! The input gradient is the transpose of the forward gather: every output
//! gradient is scattered back through the filter onto the window it came
//! from. For stride 1 this equals a full correlation of the delta, padded by
//! `k - 1`, with the 180°-rotated filter.
//!
//! ## Implementation Notes
//!
//! - He initialization `N(0, 2 / (in·k·k))` from a seeded RNG, zero bias
//! - Samples are processed in parallel for the forward pass and input
//!   gradient, filters in parallel for the weight gradients
//! - The training input is copied into an owned cache reused across steps

use super::{he_normal, resize_batch, shape_mismatch, Layer, LayerState};
use crate::checkpoint::{read_f64_slice, write_f64_slice};
use crate::error::Result;
use crate::mode::Mode;
use crate::tensor::{Shape3, Tensor3D};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::io::{Read, Write};

/// Default initialization seed
pub const CONV_SEED: u64 = 212;

pub struct Conv2D {
    name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    /// One `in_channels × k × k` tensor per filter
    pub weights: Vec<Tensor3D>,
    pub bias: Vec<f64>,
    pub weight_grads: Vec<Tensor3D>,
    pub bias_grad: Vec<f64>,
    state: LayerState,
    input: Vec<Tensor3D>,
    output: Vec<Tensor3D>,
    input_grad: Vec<Tensor3D>,
}

impl Conv2D {
    /// Create a convolution layer initialized from [`CONV_SEED`]
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Channels of the incoming tensors
    /// * `out_channels` - Number of filters
    /// * `kernel_size` - Odd window side, at least 3
    /// * `stride` - Step between windows
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Self {
        Self::with_seed(name, in_channels, out_channels, kernel_size, stride, CONV_SEED)
    }

    pub fn with_seed(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        seed: u64,
    ) -> Self {
        assert!(
            kernel_size >= 3 && kernel_size % 2 == 1,
            "Conv2D kernel size must be odd and at least 3, got {}",
            kernel_size
        );
        assert!(
            in_channels > 0 && out_channels > 0,
            "Conv2D channel counts must be positive"
        );
        assert!(stride > 0, "Conv2D stride must be positive");

        let mut rng = StdRng::seed_from_u64(seed);
        let fan_in = in_channels * kernel_size * kernel_size;
        let weights = (0..out_channels)
            .map(|_| {
                Tensor3D::from_vec(
                    in_channels,
                    kernel_size,
                    kernel_size,
                    he_normal(&mut rng, fan_in, fan_in),
                )
            })
            .collect();

        Self {
            name: name.into(),
            in_channels,
            out_channels,
            kernel_size,
            stride,
            weights,
            bias: vec![0.0; out_channels],
            weight_grads: vec![Tensor3D::new(in_channels, kernel_size, kernel_size); out_channels],
            bias_grad: vec![0.0; out_channels],
            state: LayerState::default(),
            input: Vec::new(),
            output: Vec::new(),
            input_grad: Vec::new(),
        }
    }
}

/// Output shape, or `ShapeMismatch` naming the smallest acceptable input
fn conv_output_shape(
    layer: &str,
    (c, h, w): Shape3,
    in_channels: usize,
    out_channels: usize,
    k: usize,
    stride: usize,
) -> Result<Shape3> {
    if c != in_channels || h < k || w < k {
        return Err(shape_mismatch(
            layer,
            (in_channels, h.max(k), w.max(k)),
            (c, h, w),
        ));
    }
    Ok((out_channels, (h - k) / stride + 1, (w - k) / stride + 1))
}

impl Layer for Conv2D {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &[Tensor3D], mode: Mode) -> Result<&[Tensor3D]> {
        let (in_c, out_c, k, s) = (
            self.in_channels,
            self.out_channels,
            self.kernel_size,
            self.stride,
        );
        let name = &self.name;
        let built = self.state.begin_forward(name, input, mode, |shape| {
            conv_output_shape(name, shape, in_c, out_c, k, s)
        })?;
        let (_, out_h, out_w) = built.output;

        resize_batch(&mut self.output, input.len(), built.output);
        let weights = &self.weights;
        let bias = &self.bias;
        self.output
            .par_iter_mut()
            .zip(input.par_iter())
            .for_each(|(out, x)| {
                for o in 0..out_c {
                    let w = &weights[o];
                    for ox in 0..out_h {
                        for oy in 0..out_w {
                            let mut sum = bias[o];
                            for i in 0..in_c {
                                for kx in 0..k {
                                    for ky in 0..k {
                                        sum += x[(i, ox * s + kx, oy * s + ky)] * w[(i, kx, ky)];
                                    }
                                }
                            }
                            out[(o, ox, oy)] = sum;
                        }
                    }
                }
            });

        if mode.is_training() {
            resize_batch(&mut self.input, input.len(), built.input);
            for (cache, x) in self.input.iter_mut().zip(input) {
                cache.copy_from(x);
            }
        }

        Ok(&self.output)
    }

    fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]> {
        let built = self.state.begin_backward(&self.name, delta)?;
        let (_, out_h, out_w) = built.output;
        let (in_c, k, s) = (self.in_channels, self.kernel_size, self.stride);
        let batch = delta.len() as f64;
        let inputs = &self.input;
        let delta_ref: &[Tensor3D] = delta;

        // Weight and bias gradients, one filter per task
        self.weight_grads
            .par_iter_mut()
            .zip(self.bias_grad.par_iter_mut())
            .enumerate()
            .for_each(|(o, (wg, bg))| {
                for i in 0..in_c {
                    for kx in 0..k {
                        for ky in 0..k {
                            let mut sum = 0.0;
                            for (d, x) in delta_ref.iter().zip(inputs) {
                                for ox in 0..out_h {
                                    for oy in 0..out_w {
                                        sum += d[(o, ox, oy)] * x[(i, ox * s + kx, oy * s + ky)];
                                    }
                                }
                            }
                            wg[(i, kx, ky)] = sum / batch;
                        }
                    }
                }
                *bg = delta_ref.iter().map(|d| d.channel(o).iter().sum::<f64>()).sum::<f64>()
                    / batch;
            });

        // Input gradient by scattering each output gradient through its filter
        resize_batch(&mut self.input_grad, delta_ref.len(), built.input);
        let weights = &self.weights;
        self.input_grad
            .par_iter_mut()
            .zip(delta_ref.par_iter())
            .for_each(|(grad, d)| {
                grad.set_zero();
                for (o, w) in weights.iter().enumerate() {
                    for ox in 0..out_h {
                        for oy in 0..out_w {
                            let g = d[(o, ox, oy)];
                            for i in 0..in_c {
                                for kx in 0..k {
                                    for ky in 0..k {
                                        grad[(i, ox * s + kx, oy * s + ky)] += w[(i, kx, ky)] * g;
                                    }
                                }
                            }
                        }
                    }
                }
            });

        Ok(&mut self.input_grad)
    }

    fn update_gradients(&mut self, learning_rate: f64) -> Result<()> {
        self.state.begin_update(&self.name)?;
        for (w, g) in self.weights.iter_mut().zip(&self.weight_grads) {
            for (wv, gv) in w.data_mut().iter_mut().zip(g.data()) {
                *wv -= learning_rate * gv;
            }
        }
        for (b, g) in self.bias.iter_mut().zip(&self.bias_grad) {
            *b -= learning_rate * g;
        }
        Ok(())
    }

    fn save_weights(&self, writer: &mut dyn Write) -> Result<()> {
        for filter in &self.weights {
            write_f64_slice(writer, filter.data())?;
        }
        write_f64_slice(writer, &self.bias)?;
        Ok(())
    }

    fn load_weights(&mut self, reader: &mut dyn Read) -> Result<()> {
        for filter in self.weights.iter_mut() {
            read_f64_slice(reader, filter.data_mut())?;
        }
        read_f64_slice(reader, &mut self.bias)?;
        Ok(())
    }

    fn output(&self) -> &[Tensor3D] {
        &self.output
    }

    fn num_params(&self) -> usize {
        self.out_channels * (self.in_channels * self.kernel_size * self.kernel_size + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Small deterministic values in [-1.25, 1.25]
    fn patterned(shape: Shape3, seed: usize) -> Tensor3D {
        let mut i = seed;
        Tensor3D::from_fn(shape, |_, _, _| {
            i += 1;
            ((i * 7 % 11) as f64 - 5.0) / 4.0
        })
    }

    #[test]
    fn test_output_shape_with_stride() {
        let mut conv = Conv2D::new("conv", 3, 4, 3, 2);
        let y = conv
            .forward(&[Tensor3D::new(3, 9, 8)], Mode::Inference)
            .unwrap();
        assert_eq!(y[0].shape(), (4, 4, 3));
        assert_eq!(conv.num_params(), 4 * (3 * 9 + 1));
    }

    #[test]
    fn test_identity_kernel_crops_input() {
        let mut conv = Conv2D::new("conv", 1, 1, 3, 1);
        conv.weights[0].set_zero();
        conv.weights[0][(0, 1, 1)] = 1.0;

        let x = patterned((1, 5, 6), 0);
        let y = conv.forward(&[x.clone()], Mode::Inference).unwrap();
        assert_eq!(y[0], x.crop(1, 1, 3, 4));
    }

    #[test]
    fn test_bias_added_once_per_cell() {
        let mut conv = Conv2D::new("conv", 2, 1, 3, 1);
        conv.weights[0].set_zero();
        conv.bias[0] = 1.5;
        let y = conv
            .forward(&[patterned((2, 3, 3), 1)], Mode::Inference)
            .unwrap();
        assert_eq!(y[0].data(), &[1.5]);
    }

    #[test]
    fn test_input_gradient_equals_full_correlation_with_rotated_filter() {
        let (in_c, out_c, k) = (2, 3, 3);
        let mut conv = Conv2D::new("conv", in_c, out_c, k, 1);
        for (o, w) in conv.weights.iter_mut().enumerate() {
            *w = patterned((in_c, k, k), 10 * o);
        }

        let x = patterned((in_c, 6, 5), 3);
        conv.forward(&[x], Mode::Training).unwrap();
        let d = patterned((out_c, 4, 3), 5);
        let mut delta = vec![d.clone()];
        let grad = conv.backward(&mut delta).unwrap().to_vec();

        let padded = d.pad(k - 1);
        for i in 0..in_c {
            for r in 0..6 {
                for c in 0..5 {
                    let mut expected = 0.0;
                    for o in 0..out_c {
                        let rotated = conv.weights[o].rot180();
                        for kx in 0..k {
                            for ky in 0..k {
                                expected += padded[(o, r + kx, c + ky)] * rotated[(i, kx, ky)];
                            }
                        }
                    }
                    assert_abs_diff_eq!(grad[0][(i, r, c)], expected, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_parameter_gradients_match_finite_differences() {
        let mut conv = Conv2D::new("conv", 2, 2, 3, 2);
        let batch = vec![patterned((2, 7, 7), 0), patterned((2, 7, 7), 4)];
        let coef = vec![patterned((2, 3, 3), 9), patterned((2, 3, 3), 2)];

        // L = mean over the batch of sum(y · coef), so grad_y = coef
        let loss = |conv: &mut Conv2D| -> f64 {
            let y = conv.forward(&batch, Mode::Inference).unwrap();
            y.iter()
                .zip(&coef)
                .map(|(t, c)| t.data().iter().zip(c.data()).map(|(a, b)| a * b).sum::<f64>())
                .sum::<f64>()
                / batch.len() as f64
        };

        conv.forward(&batch, Mode::Training).unwrap();
        let mut delta = coef.clone();
        conv.backward(&mut delta).unwrap();

        let h = 1e-6;
        for &(o, i, kx, ky) in &[(0, 0, 0, 0), (1, 1, 2, 1), (0, 1, 1, 2)] {
            let original = conv.weights[o][(i, kx, ky)];
            conv.weights[o][(i, kx, ky)] = original + h;
            let plus = loss(&mut conv);
            conv.weights[o][(i, kx, ky)] = original - h;
            let minus = loss(&mut conv);
            conv.weights[o][(i, kx, ky)] = original;
            let numeric = (plus - minus) / (2.0 * h);
            assert_abs_diff_eq!(conv.weight_grads[o][(i, kx, ky)], numeric, epsilon = 1e-6);
        }

        let original = conv.bias[1];
        conv.bias[1] = original + h;
        let plus = loss(&mut conv);
        conv.bias[1] = original - h;
        let minus = loss(&mut conv);
        assert_abs_diff_eq!(conv.bias_grad[1], (plus - minus) / (2.0 * h), epsilon = 1e-6);
    }

    #[test]
    fn test_update_applies_sgd() {
        let mut conv = Conv2D::new("conv", 1, 1, 3, 1);
        let before = conv.weights[0].clone();
        let x = patterned((1, 3, 3), 0);
        conv.forward(&[x.clone()], Mode::Training).unwrap();
        let mut delta = vec![Tensor3D::from_vec(1, 1, 1, vec![2.0])];
        conv.backward(&mut delta).unwrap();
        conv.update_gradients(0.5).unwrap();

        // grad_W = 2·x for a single 3x3 window
        for idx in 0..9 {
            assert_abs_diff_eq!(
                conv.weights[0].data()[idx],
                before.data()[idx] - x.data()[idx],
                epsilon = 1e-12
            );
        }
        assert_eq!(conv.bias[0], -1.0);
    }

    #[test]
    fn test_inference_forward_discards_gradients() {
        let mut conv = Conv2D::new("conv", 1, 1, 3, 1);
        let x = vec![patterned((1, 3, 3), 0)];
        conv.forward(&x, Mode::Training).unwrap();
        let mut delta = vec![Tensor3D::from_vec(1, 1, 1, vec![2.0])];
        conv.backward(&mut delta).unwrap();

        conv.forward(&x, Mode::Inference).unwrap();
        let before = conv.weights[0].clone();
        assert!(matches!(
            conv.update_gradients(0.5),
            Err(crate::error::CnnError::UpdateWithoutBackward { .. })
        ));
        assert_eq!(conv.weights[0], before);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = Conv2D::with_seed("a", 3, 2, 5, 1, 7);
        let b = Conv2D::with_seed("b", 3, 2, 5, 1, 7);
        assert_eq!(a.weights, b.weights);
        assert!(a.bias.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_checkpoint_round_trip_is_bit_exact() {
        let mut conv = Conv2D::new("conv", 2, 3, 3, 1);
        conv.bias = vec![0.1, -0.2, 0.3];

        let mut bytes = Vec::new();
        conv.save_weights(&mut bytes).unwrap();
        assert_eq!(bytes.len(), (3 * 2 * 9 + 3) * 8);

        let mut fresh = Conv2D::with_seed("conv", 2, 3, 3, 1, 99);
        fresh.load_weights(&mut bytes.as_slice()).unwrap();
        for (a, b) in conv.weights.iter().zip(&fresh.weights) {
            for (x, y) in a.data().iter().zip(b.data()) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
        assert_eq!(fresh.bias, conv.bias);
    }

    #[test]
    #[should_panic(expected = "odd")]
    fn test_even_kernel_rejected() {
        let _ = Conv2D::new("conv", 1, 1, 4, 1);
    }

    #[test]
    fn test_wrong_input_rejected_on_first_forward() {
        let mut conv = Conv2D::new("conv", 3, 4, 3, 1);
        match conv.forward(&[Tensor3D::new(1, 5, 5)], Mode::Training) {
            Err(crate::error::CnnError::ShapeMismatch { layer, expected, got }) => {
                assert_eq!(layer, "conv");
                assert_eq!(expected, (3, 5, 5));
                assert_eq!(got, (1, 5, 5));
            }
            other => panic!("unexpected {:?}", other.map(|y| y.len())),
        }

        // Kernel larger than the plane
        assert!(matches!(
            conv.forward(&[Tensor3D::new(3, 2, 5)], Mode::Inference),
            Err(crate::error::CnnError::ShapeMismatch { .. })
        ));

        // Still unbuilt, so a valid input builds it
        let y = conv.forward(&[Tensor3D::new(3, 5, 5)], Mode::Inference).unwrap();
        assert_eq!(y[0].shape(), (4, 3, 3));
    }
}
