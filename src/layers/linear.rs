//! Linear Layer (Fully Connected)
//!
//! Every input sample is flattened to a vector of `C·H·W = in_channels`
//! values, and the layer computes an affine map to `out_channels` values.
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [in_channels]            (any C × H × W with C·H·W = in_channels)
//! Weight: W [in_channels · out_channels], input-major: W[j·out + i]
//! Bias:   b [out_channels]
//! Output: y_i = b_i + sum_j x_j · W[j·out + i]     shape out × 1 × 1
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W[j·out + i] = mean_b(grad_y_i · x_j)
//! grad_b_i          = mean_b(grad_y_i)
//! grad_x_j          = sum_i grad_y_i · W[j·out + i]
//! ```
//!
//! The input gradient takes the input's original `C × H × W` shape.
//!
//! ## Implementation Notes
//!
//! - Uses He initialization: `N(0, 2 / in_channels)`, bias zero
//! - Weights keep the input-major layout in checkpoints too
//! - Caches a copy of the training input for the backward pass

use super::{he_normal, resize_batch, shape_mismatch, Layer, LayerState};
use crate::checkpoint::{read_f64_slice, write_f64_slice};
use crate::error::Result;
use crate::mode::Mode;
use crate::tensor::Tensor3D;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::io::{Read, Write};

/// Default initialization seed
pub const LINEAR_SEED: u64 = 1998;

/// Linear layer (fully connected)
///
/// Performs `y = Wᵀx + b` on flattened samples.
pub struct LinearLayer {
    name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub weights: Vec<f64>,
    pub bias: Vec<f64>,
    pub weight_grad: Vec<f64>,
    pub bias_grad: Vec<f64>,
    state: LayerState,
    input: Vec<Tensor3D>,
    output: Vec<Tensor3D>,
    input_grad: Vec<Tensor3D>,
}

impl LinearLayer {
    /// Create a new linear layer initialized from [`LINEAR_SEED`]
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of values in a flattened input sample
    /// * `out_channels` - Number of outputs
    pub fn new(name: impl Into<String>, in_channels: usize, out_channels: usize) -> Self {
        Self::with_seed(name, in_channels, out_channels, LINEAR_SEED)
    }

    pub fn with_seed(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        seed: u64,
    ) -> Self {
        assert!(
            in_channels > 0 && out_channels > 0,
            "LinearLayer channel counts must be positive"
        );
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            name: name.into(),
            in_channels,
            out_channels,
            weights: he_normal(&mut rng, in_channels, in_channels * out_channels),
            bias: vec![0.0; out_channels],
            weight_grad: vec![0.0; in_channels * out_channels],
            bias_grad: vec![0.0; out_channels],
            state: LayerState::default(),
            input: Vec::new(),
            output: Vec::new(),
            input_grad: Vec::new(),
        }
    }
}

impl Layer for LinearLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &[Tensor3D], mode: Mode) -> Result<&[Tensor3D]> {
        let (in_c, out_c) = (self.in_channels, self.out_channels);
        let name = &self.name;
        let built = self.state.begin_forward(name, input, mode, |shape| {
            let (c, h, w) = shape;
            if c * h * w != in_c {
                return Err(shape_mismatch(name, (in_c, 1, 1), shape));
            }
            Ok((out_c, 1, 1))
        })?;

        resize_batch(&mut self.output, input.len(), built.output);
        let weights = &self.weights;
        let bias = &self.bias;
        self.output
            .par_iter_mut()
            .zip(input.par_iter())
            .for_each(|(out, x)| {
                let y = out.data_mut();
                y.copy_from_slice(bias);
                for (j, &xj) in x.data().iter().enumerate() {
                    let row = &weights[j * out_c..(j + 1) * out_c];
                    for (yi, &w) in y.iter_mut().zip(row) {
                        *yi += xj * w;
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
        let out_c = self.out_channels;
        let batch = delta.len() as f64;

        self.weight_grad.fill(0.0);
        self.bias_grad.fill(0.0);
        for (d, x) in delta.iter().zip(&self.input) {
            for (j, &xj) in x.data().iter().enumerate() {
                let row = &mut self.weight_grad[j * out_c..(j + 1) * out_c];
                for (g, &di) in row.iter_mut().zip(d.data()) {
                    *g += di * xj;
                }
            }
            for (g, &di) in self.bias_grad.iter_mut().zip(d.data()) {
                *g += di;
            }
        }
        self.weight_grad.iter_mut().for_each(|g| *g /= batch);
        self.bias_grad.iter_mut().for_each(|g| *g /= batch);

        resize_batch(&mut self.input_grad, delta.len(), built.input);
        let weights = &self.weights;
        self.input_grad
            .par_iter_mut()
            .zip(delta.par_iter())
            .for_each(|(grad, d)| {
                for (j, gj) in grad.data_mut().iter_mut().enumerate() {
                    let row = &weights[j * out_c..(j + 1) * out_c];
                    *gj = row.iter().zip(d.data()).map(|(w, di)| w * di).sum();
                }
            });

        Ok(&mut self.input_grad)
    }

    fn update_gradients(&mut self, learning_rate: f64) -> Result<()> {
        self.state.begin_update(&self.name)?;
        for (w, g) in self.weights.iter_mut().zip(&self.weight_grad) {
            *w -= learning_rate * g;
        }
        for (b, g) in self.bias.iter_mut().zip(&self.bias_grad) {
            *b -= learning_rate * g;
        }
        Ok(())
    }

    fn save_weights(&self, writer: &mut dyn Write) -> Result<()> {
        write_f64_slice(writer, &self.weights)?;
        write_f64_slice(writer, &self.bias)?;
        Ok(())
    }

    fn load_weights(&mut self, reader: &mut dyn Read) -> Result<()> {
        read_f64_slice(reader, &mut self.weights)?;
        read_f64_slice(reader, &mut self.bias)?;
        Ok(())
    }

    fn output(&self) -> &[Tensor3D] {
        &self.output
    }

    fn num_params(&self) -> usize {
        self.in_channels * self.out_channels + self.out_channels
    }
}
