//! Batch Normalization (2D)
//!
//! Normalizes every channel with statistics gathered over the whole batch
//! and all spatial positions, then applies a learnable per-channel scale
//! (gamma) and shift (beta).
//!
//! ## Forward Pass (training)
//!
//! ```text
//! N     = batch · H · W
//! μ     = sum(x) / N
//! σ²    = sum((x - μ)²) / N            (biased)
//! x̂     = (x - μ) / √(σ² + ε)
//! y     = γ · x̂ + β
//!
//! running_μ  = running_μ  · momentum + μ  · (1 - momentum)
//! running_σ² = running_σ² · momentum + σ² · (1 - momentum)
//! ```
//!
//! In inference mode the running statistics replace μ and σ², and nothing
//! is cached or updated.
//!
//! ## Backward Pass
//!
//! The mean and variance depend on every element in the channel, so the
//! gradient goes through them explicitly:
//!
//! ```text
//! grad_x̂ = grad_y · γ
//! grad_σ² = sum(grad_x̂ · (x - μ)) · -½ (σ² + ε)^-3/2
//! grad_μ  = sum(grad_x̂ · -1/√(σ² + ε)) + grad_σ² · sum(-2 (x - μ)) / N
//! grad_x  = grad_x̂ / √(σ² + ε) + grad_σ² · 2 (x - μ) / N + grad_μ / N
//!
//! grad_γ = sum(grad_y · x̂)
//! grad_β = sum(grad_y)
//! ```
//!
//! `grad_x` overwrites the incoming gradient in place. The running
//! statistics are never touched by gradient descent.

use super::{resize_batch, shape_mismatch, Layer, LayerState};
use crate::checkpoint::{read_f64_slice, write_f64_slice};
use crate::error::Result;
use crate::mode::Mode;
use crate::tensor::Tensor3D;
use std::io::{Read, Write};

pub struct BatchNorm2D {
    name: String,
    pub channels: usize,
    pub eps: f64,
    pub momentum: f64,
    pub gamma: Vec<f64>,
    pub beta: Vec<f64>,
    pub running_mean: Vec<f64>,
    pub running_var: Vec<f64>,
    pub gamma_grad: Vec<f64>,
    pub beta_grad: Vec<f64>,
    state: LayerState,
    /// `1 / √(σ² + ε)` per channel from the last training forward
    inv_std: Vec<f64>,
    x_hat: Vec<Tensor3D>,
    output: Vec<Tensor3D>,
}

impl BatchNorm2D {
    /// Create a batch norm layer with `eps = 1e-5` and `momentum = 0.1`
    pub fn new(name: impl Into<String>, channels: usize) -> Self {
        Self::with_hyper(name, channels, 1e-5, 0.1)
    }

    /// # Arguments
    ///
    /// * `channels` - Number of channels the input will carry
    /// * `eps` - Added to the variance before the square root
    /// * `momentum` - Weight of the previous running statistic in each update
    pub fn with_hyper(name: impl Into<String>, channels: usize, eps: f64, momentum: f64) -> Self {
        assert!(channels > 0, "BatchNorm2D needs at least one channel");
        assert!(eps > 0.0, "BatchNorm2D eps must be positive");
        Self {
            name: name.into(),
            channels,
            eps,
            momentum,
            gamma: vec![1.0; channels],
            beta: vec![0.0; channels],
            running_mean: vec![0.0; channels],
            running_var: vec![0.0; channels],
            gamma_grad: vec![0.0; channels],
            beta_grad: vec![0.0; channels],
            state: LayerState::default(),
            inv_std: vec![0.0; channels],
            x_hat: Vec::new(),
            output: Vec::new(),
        }
    }
}

impl Layer for BatchNorm2D {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &[Tensor3D], mode: Mode) -> Result<&[Tensor3D]> {
        let (name, channels) = (&self.name, self.channels);
        let built = self.state.begin_forward(name, input, mode, |shape| {
            if shape.0 != channels {
                return Err(shape_mismatch(name, (channels, shape.1, shape.2), shape));
            }
            Ok(shape)
        })?;
        let n = (input.len() * built.input.1 * built.input.2) as f64;

        resize_batch(&mut self.output, input.len(), built.output);
        if mode.is_training() {
            resize_batch(&mut self.x_hat, input.len(), built.output);
        }

        for c in 0..self.channels {
            let (mean, var) = if mode.is_training() {
                let mean = input.iter().flat_map(|x| x.channel(c)).sum::<f64>() / n;
                let var = input
                    .iter()
                    .flat_map(|x| x.channel(c))
                    .map(|&v| (v - mean) * (v - mean))
                    .sum::<f64>()
                    / n;
                self.running_mean[c] =
                    self.running_mean[c] * self.momentum + mean * (1.0 - self.momentum);
                self.running_var[c] =
                    self.running_var[c] * self.momentum + var * (1.0 - self.momentum);
                (mean, var)
            } else {
                (self.running_mean[c], self.running_var[c])
            };

            let inv_std = 1.0 / (var + self.eps).sqrt();
            let (gamma, beta) = (self.gamma[c], self.beta[c]);
            for (b, x) in input.iter().enumerate() {
                let out = self.output[b].channel_mut(c);
                for (o, &v) in out.iter_mut().zip(x.channel(c)) {
                    *o = gamma * (v - mean) * inv_std + beta;
                }
                if mode.is_training() {
                    let cache = self.x_hat[b].channel_mut(c);
                    for (h, &v) in cache.iter_mut().zip(x.channel(c)) {
                        *h = (v - mean) * inv_std;
                    }
                }
            }
            if mode.is_training() {
                self.inv_std[c] = inv_std;
            }
        }

        Ok(&self.output)
    }

    fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]> {
        let built = self.state.begin_backward(&self.name, delta)?;
        let n = (delta.len() * built.input.1 * built.input.2) as f64;

        for c in 0..self.channels {
            let inv = self.inv_std[c];
            let gamma = self.gamma[c];

            let mut gamma_grad = 0.0;
            let mut beta_grad = 0.0;
            let mut var_grad = 0.0;
            let mut mean_grad = 0.0;
            let mut centered_sum = 0.0;
            for (d, x_hat) in delta.iter().zip(&self.x_hat) {
                for (&g, &h) in d.channel(c).iter().zip(x_hat.channel(c)) {
                    let dx_hat = g * gamma;
                    let centered = h / inv;
                    gamma_grad += g * h;
                    beta_grad += g;
                    var_grad += dx_hat * centered * -0.5 * inv * inv * inv;
                    mean_grad += dx_hat * -inv;
                    centered_sum += -2.0 * centered;
                }
            }
            mean_grad += var_grad * centered_sum / n;

            for (d, x_hat) in delta.iter_mut().zip(&self.x_hat) {
                for (g, &h) in d.channel_mut(c).iter_mut().zip(x_hat.channel(c)) {
                    let centered = h / inv;
                    *g = *g * gamma * inv + var_grad * 2.0 * centered / n + mean_grad / n;
                }
            }

            self.gamma_grad[c] = gamma_grad;
            self.beta_grad[c] = beta_grad;
        }

        Ok(delta)
    }

    fn update_gradients(&mut self, learning_rate: f64) -> Result<()> {
        self.state.begin_update(&self.name)?;
        for c in 0..self.channels {
            self.gamma[c] -= learning_rate * self.gamma_grad[c];
            self.beta[c] -= learning_rate * self.beta_grad[c];
        }
        Ok(())
    }

    fn save_weights(&self, writer: &mut dyn Write) -> Result<()> {
        write_f64_slice(writer, &self.gamma)?;
        write_f64_slice(writer, &self.beta)?;
        write_f64_slice(writer, &self.running_mean)?;
        write_f64_slice(writer, &self.running_var)?;
        Ok(())
    }

    fn load_weights(&mut self, reader: &mut dyn Read) -> Result<()> {
        read_f64_slice(reader, &mut self.gamma)?;
        read_f64_slice(reader, &mut self.beta)?;
        read_f64_slice(reader, &mut self.running_mean)?;
        read_f64_slice(reader, &mut self.running_var)?;
        Ok(())
    }

    fn output(&self) -> &[Tensor3D] {
        &self.output
    }

    fn num_params(&self) -> usize {
        2 * self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CnnError;
    use approx::assert_abs_diff_eq;

    fn sample_batch() -> Vec<Tensor3D> {
        vec![
            Tensor3D::from_vec(2, 2, 2, vec![1.0, 2.0, 3.0, 4.0, -1.0, 0.5, 2.0, 0.0]),
            Tensor3D::from_vec(2, 2, 2, vec![0.0, -2.0, 1.5, 1.0, 3.0, -0.5, 1.0, 2.5]),
        ]
    }

    #[test]
    fn test_constant_channel_normalizes_to_beta() {
        let mut bn = BatchNorm2D::new("bn", 2);
        bn.beta = vec![0.5, -0.25];
        bn.gamma = vec![3.0, 2.0];

        // Channel 0 is constant everywhere, channel 1 varies
        let batch: Vec<Tensor3D> = (0..4)
            .map(|i| {
                let mut t = Tensor3D::new(2, 2, 2);
                t.channel_mut(0).fill(3.0);
                t.channel_mut(1).fill(i as f64);
                t
            })
            .collect();

        let y = bn.forward(&batch, Mode::Training).unwrap();
        for sample in y {
            assert!(sample.channel(0).iter().all(|&v| v == 0.5));
        }
        // Batch variance of channel 0 was exactly zero
        assert_eq!(bn.running_var[0], 0.0);
        assert_abs_diff_eq!(bn.running_mean[0], 2.7, epsilon = 1e-12);
    }

    #[test]
    fn test_training_output_is_standardized() {
        let mut bn = BatchNorm2D::new("bn", 2);
        let y = bn.forward(&sample_batch(), Mode::Training).unwrap();
        for c in 0..2 {
            let values: Vec<f64> = y.iter().flat_map(|t| t.channel(c).to_vec()).collect();
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(var, 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_inference_uses_running_statistics() {
        let mut bn = BatchNorm2D::new("bn", 1);
        bn.running_mean = vec![2.0];
        bn.running_var = vec![4.0 - 1e-5];

        let x = vec![Tensor3D::from_vec(1, 1, 2, vec![2.0, 6.0])];
        let y = bn.forward(&x, Mode::Inference).unwrap();
        assert_abs_diff_eq!(y[0].data()[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y[0].data()[1], 2.0, epsilon = 1e-9);

        // Inference leaves the running statistics alone
        assert_eq!(bn.running_mean, vec![2.0]);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let weights = [0.3, -1.2, 0.7, 2.0, -0.4, 1.1, 0.9, -0.6];
        let loss = |bn: &mut BatchNorm2D, batch: &[Tensor3D]| -> f64 {
            let y = bn.forward(batch, Mode::Training).unwrap();
            y.iter()
                .map(|t| t.data().iter().zip(&weights).map(|(a, b)| a * b).sum::<f64>())
                .sum()
        };

        let mut bn = BatchNorm2D::new("bn", 2);
        bn.gamma = vec![1.5, 0.8];
        bn.beta = vec![0.1, -0.2];
        let batch = sample_batch();

        bn.forward(&batch, Mode::Training).unwrap();
        let mut delta: Vec<Tensor3D> = (0..2)
            .map(|_| Tensor3D::from_vec(2, 2, 2, weights.to_vec()))
            .collect();
        let analytic: Vec<Tensor3D> = bn.backward(&mut delta).unwrap().to_vec();

        let h = 1e-6;
        for b in 0..2 {
            for i in 0..8 {
                let mut plus = batch.clone();
                plus[b].data_mut()[i] += h;
                let mut minus = batch.clone();
                minus[b].data_mut()[i] -= h;
                let numeric = (loss(&mut bn, &plus) - loss(&mut bn, &minus)) / (2.0 * h);
                assert_abs_diff_eq!(analytic[b].data()[i], numeric, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_parameter_gradients_are_sums() {
        let mut bn = BatchNorm2D::new("bn", 2);
        let batch = sample_batch();
        bn.forward(&batch, Mode::Training).unwrap();

        let mut delta = vec![Tensor3D::from_vec(2, 2, 2, vec![1.0; 8]); 2];
        bn.backward(&mut delta).unwrap();
        assert_eq!(bn.beta_grad, vec![8.0, 8.0]);
        // sum of x̂ over a channel is zero
        assert_abs_diff_eq!(bn.gamma_grad[0], 0.0, epsilon = 1e-12);

        bn.update_gradients(0.5).unwrap();
        assert_eq!(bn.beta, vec![-4.0, -4.0]);
    }

    #[test]
    fn test_update_before_backward_fails() {
        let mut bn = BatchNorm2D::new("bn", 1);
        assert!(matches!(
            bn.update_gradients(0.1),
            Err(CnnError::UpdateWithoutBackward { .. })
        ));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut bn = BatchNorm2D::new("bn", 3);
        bn.gamma = vec![0.1, 0.2, 0.3];
        bn.beta = vec![-1.0, 0.0, 1.0];
        bn.running_mean = vec![5.0, 6.0, 7.0];
        bn.running_var = vec![0.5, 0.25, 0.125];

        let mut bytes = Vec::new();
        bn.save_weights(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 4 * 3 * 8);

        let mut fresh = BatchNorm2D::new("bn", 3);
        fresh.load_weights(&mut bytes.as_slice()).unwrap();
        assert_eq!(fresh.gamma, bn.gamma);
        assert_eq!(fresh.beta, bn.beta);
        assert_eq!(fresh.running_mean, bn.running_mean);
        assert_eq!(fresh.running_var, bn.running_var);
    }

    #[test]
    fn test_wrong_channels_rejected_on_first_forward() {
        let mut bn = BatchNorm2D::new("bn", 3);
        assert!(matches!(
            bn.forward(&sample_batch(), Mode::Training),
            Err(CnnError::ShapeMismatch {
                expected: (3, 2, 2),
                got: (2, 2, 2),
                ..
            })
        ));
    }
}
