//! Dropout Layer
//!
//! Channel dropout: during training a random subset of whole channels is
//! zeroed, the same subset for every sample in the batch. During inference
//! every value is scaled by `1 - p` instead, so the expected activation
//! matches what the next layer saw in training.
//!
//! On each training forward the channel index sequence is reshuffled
//! (Fisher–Yates) and the first `floor(p · C)` entries are deactivated. Kept
//! channels pass through unscaled.

use super::{resize_batch, Layer, LayerState};
use crate::error::Result;
use crate::mode::Mode;
use crate::tensor::Tensor3D;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Default shuffling seed
pub const DROPOUT_SEED: u64 = 212;

pub struct Dropout {
    name: String,
    pub rate: f64,
    rng: StdRng,
    /// Channel indices, reshuffled on every training forward
    sequence: Vec<usize>,
    /// Per channel: false if dropped in the last training forward
    active: Vec<bool>,
    state: LayerState,
    output: Vec<Tensor3D>,
}

impl Dropout {
    /// Create a new dropout layer
    ///
    /// # Arguments
    ///
    /// * `rate` - Fraction of channels to drop, in `[0, 1)`
    pub fn new(name: impl Into<String>, rate: f64) -> Self {
        Self::with_seed(name, rate, DROPOUT_SEED)
    }

    pub fn with_seed(name: impl Into<String>, rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout rate must be in [0.0, 1.0), got {}",
            rate
        );
        Self {
            name: name.into(),
            rate,
            rng: StdRng::seed_from_u64(seed),
            sequence: Vec::new(),
            active: Vec::new(),
            state: LayerState::default(),
            output: Vec::new(),
        }
    }

    /// Channels zeroed by the last training forward
    pub fn dropped_channels(&self) -> Vec<usize> {
        self.active
            .iter()
            .enumerate()
            .filter_map(|(c, &keep)| (!keep).then_some(c))
            .collect()
    }
}

impl Layer for Dropout {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &[Tensor3D], mode: Mode) -> Result<&[Tensor3D]> {
        let built = self.state.begin_forward(&self.name, input, mode, |s| Ok(s))?;
        let channels = built.input.0;
        let selected = (self.rate * channels as f64).floor() as usize;
        assert!(
            channels > selected,
            "Dropout would remove all {} channels",
            channels
        );
        if self.sequence.len() != channels {
            self.sequence = (0..channels).collect();
            self.active = vec![true; channels];
        }

        resize_batch(&mut self.output, input.len(), built.output);
        match mode {
            Mode::Training => {
                self.sequence.shuffle(&mut self.rng);
                self.active.fill(true);
                for &c in &self.sequence[..selected] {
                    self.active[c] = false;
                }
                for (out, x) in self.output.iter_mut().zip(input) {
                    out.copy_from(x);
                    for (c, &keep) in self.active.iter().enumerate() {
                        if !keep {
                            out.channel_mut(c).fill(0.0);
                        }
                    }
                }
            }
            Mode::Inference => {
                let scale = 1.0 - self.rate;
                for (out, x) in self.output.iter_mut().zip(input) {
                    for (o, &v) in out.data_mut().iter_mut().zip(x.data()) {
                        *o = v * scale;
                    }
                }
            }
        }

        Ok(&self.output)
    }

    fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]> {
        self.state.begin_backward(&self.name, delta)?;
        for d in delta.iter_mut() {
            for (c, &keep) in self.active.iter().enumerate() {
                if !keep {
                    d.channel_mut(c).fill(0.0);
                }
            }
        }
        Ok(delta)
    }

    fn output(&self) -> &[Tensor3D] {
        &self.output
    }
}
