//! AlexNet-style Classifier
//!
//! A compact convolutional classifier built on [`Sequential`]:
//!
//! ```text
//! conv_1    Conv2D(C → 16, k3, s2)   [bn_1]   relu_1
//! max_pool_1 MaxPool2D(2, 2)
//! conv_2    Conv2D(16 → 32, k3, s2)  [bn_2]   relu_2
//! conv_3    Conv2D(32 → 64, k3, s2)  [bn_3]   relu_3
//! conv_4    Conv2D(64 → 128, k3, s2) [bn_4]   relu_4
//! dropout_1 Dropout(p)
//! linear_1  LinearLayer(128·h·w → num_classes)
//! ```
//!
//! Batch norm layers are only present when `batch_norm` is set. The final
//! feature map size `h × w` follows from the configured input shape
//! (6 × 6 for a 224 × 224 input).
//!
//! ## Example
//!
//! ```rust
//! use alexnet_scratch::{AlexNet, AlexNetConfig, Mode, Tensor3D};
//!
//! let config = AlexNetConfig {
//!     num_classes: 3,
//!     input_shape: (3, 64, 64),
//!     ..AlexNetConfig::default()
//! };
//! let mut net = AlexNet::new(config);
//! let batch = [Tensor3D::new(3, 64, 64)];
//! let logits = net.forward(&batch, Mode::Inference)?;
//! assert_eq!(logits[0].shape(), (3, 1, 1));
//! # Ok::<(), alexnet_scratch::CnnError>(())
//! ```

use crate::error::{CnnError, Result};
use crate::layers::batch_shape;
use crate::layers::conv::CONV_SEED;
use crate::layers::dropout::DROPOUT_SEED;
use crate::layers::linear::LINEAR_SEED;
use crate::layers::{BatchNorm2D, Conv2D, Dropout, LinearLayer, MaxPool2D, ReLU};
use crate::mode::Mode;
use crate::network::Sequential;
use crate::tensor::{Shape3, Tensor3D};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;

/// Filters produced by each convolution block
const BLOCK_CHANNELS: [usize; 4] = [16, 32, 64, 128];
const KERNEL: usize = 3;
const STRIDE: usize = 2;

/// Seed of the default configuration
pub const DEFAULT_SEED: u64 = 212;

/// Architecture hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlexNetConfig {
    pub num_classes: usize,
    pub batch_norm: bool,
    /// Expected `(channels, height, width)` of every input sample
    pub input_shape: Shape3,
    /// Fraction of channels dropped before the classifier
    pub dropout: f64,
    /// Base seed for weight initialization and dropout shuffling
    ///
    /// Each layer's own default seed is shifted by `seed - DEFAULT_SEED`, so
    /// the default configuration reproduces standalone layers exactly.
    pub seed: u64,
}

impl Default for AlexNetConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            batch_norm: false,
            input_shape: (3, 224, 224),
            dropout: 0.4,
            seed: DEFAULT_SEED,
        }
    }
}

impl AlexNetConfig {
    /// Shape of the feature map entering the classifier
    ///
    /// # Panics
    ///
    /// Panics if the input is too small to survive the convolution stack
    pub fn feature_shape(&self) -> Shape3 {
        let conv = |size: usize| {
            assert!(
                size >= KERNEL,
                "Input {:?} is too small for this architecture",
                self.input_shape
            );
            (size - KERNEL) / STRIDE + 1
        };
        let pool = |size: usize| {
            assert!(
                size >= 2,
                "Input {:?} is too small for this architecture",
                self.input_shape
            );
            (size - 2) / 2 + 1
        };

        let (_, mut h, mut w) = self.input_shape;
        for block in 0..BLOCK_CHANNELS.len() {
            h = conv(h);
            w = conv(w);
            if block == 0 {
                h = pool(h);
                w = pool(w);
            }
        }
        (BLOCK_CHANNELS[BLOCK_CHANNELS.len() - 1], h, w)
    }
}

/// Convolutional classifier with a fixed layer stack
pub struct AlexNet {
    config: AlexNetConfig,
    net: Sequential,
}

impl AlexNet {
    pub fn new(config: AlexNetConfig) -> Self {
        assert!(config.num_classes > 0, "AlexNet needs at least one class");
        let (features, h, w) = config.feature_shape();

        let shift = config.seed.wrapping_sub(DEFAULT_SEED);
        let seeded = |default: u64| default.wrapping_add(shift);

        let mut net = Sequential::new();
        let mut in_channels = config.input_shape.0;
        for (i, &out_channels) in BLOCK_CHANNELS.iter().enumerate() {
            let idx = i + 1;
            net.push(Box::new(Conv2D::with_seed(
                format!("conv_{}", idx),
                in_channels,
                out_channels,
                KERNEL,
                STRIDE,
                seeded(CONV_SEED + i as u64),
            )));
            if config.batch_norm {
                net.push(Box::new(BatchNorm2D::new(
                    format!("bn_{}", idx),
                    out_channels,
                )));
            }
            net.push(Box::new(ReLU::new(format!("relu_{}", idx))));
            if i == 0 {
                net.push(Box::new(MaxPool2D::new("max_pool_1", 2, 2)));
            }
            in_channels = out_channels;
        }
        net.push(Box::new(Dropout::with_seed(
            "dropout_1",
            config.dropout,
            seeded(DROPOUT_SEED),
        )));
        net.push(Box::new(LinearLayer::with_seed(
            "linear_1",
            features * h * w,
            config.num_classes,
            seeded(LINEAR_SEED),
        )));

        Self { config, net }
    }

    pub fn config(&self) -> &AlexNetConfig {
        &self.config
    }

    /// Class logits, one `num_classes × 1 × 1` tensor per sample
    ///
    /// Every sample must have the configured input shape.
    pub fn forward<'a>(&'a mut self, input: &'a [Tensor3D], mode: Mode) -> Result<&'a [Tensor3D]> {
        let shape = batch_shape("input", input)?;
        if shape != self.config.input_shape {
            return Err(CnnError::ShapeMismatch {
                layer: "input".to_string(),
                expected: self.config.input_shape,
                got: shape,
            });
        }
        self.net.forward(input, mode)
    }

    pub fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]> {
        self.net.backward(delta)
    }

    pub fn update_gradients(&mut self, learning_rate: f64) -> Result<()> {
        self.net.update_gradients(learning_rate)
    }

    /// Most likely class for each sample, computed in inference mode
    pub fn predict(&mut self, input: &[Tensor3D]) -> Result<Vec<usize>> {
        let logits = self.forward(input, Mode::Inference)?;
        Ok(logits.iter().map(|t| t.argmax()).collect())
    }

    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        self.net.save_weights(path)
    }

    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.net.load_weights(path)
    }

    pub fn save_weights_to(&self, writer: &mut dyn Write) -> Result<()> {
        self.net.save_weights_to(writer)
    }

    pub fn load_weights_from(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.net.load_weights_from(reader)
    }

    pub fn num_params(&self) -> usize {
        self.net.num_params()
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.net.layer_names()
    }

    /// Activations of the named layer from the most recent forward
    pub fn layer_output(&self, name: &str) -> Option<&[Tensor3D]> {
        self.net.layer_output(name)
    }
}
