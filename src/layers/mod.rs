//! Neural Network Layers
//!
//! This module contains every layer a network can be built from. Each layer
//! provides both forward and backward passes for training.
//!
//! ## Layers
//!
//! - **relu**: Rectified linear activation
//! - **pool**: 2D max pooling
//! - **batchnorm**: Per-channel batch normalization
//! - **conv**: 2D convolution
//! - **linear**: Fully connected layer
//! - **dropout**: Channel dropout regularization
//!
//! ## Design Pattern
//!
//! Every layer implements [`Layer`] and owns its output buffer:
//!
//! ```rust,ignore
//! let out: &[Tensor3D] = layer.forward(&batch, Mode::Training)?;
//! let grad: &mut [Tensor3D] = layer.backward(&mut delta)?;
//! layer.update_gradients(learning_rate)?;
//! ```
//!
//! Buffers are allocated on the first forward call and reused afterwards.
//! The per-sample shape is fixed from that point on, while the batch
//! dimension follows whatever batch is passed in.
//!
//! Layers whose backward pass is elementwise (ReLU, batch norm, dropout)
//! rewrite `delta` in place and hand the same slice back. Layers that change
//! shape (pooling, convolution, linear) return their own gradient buffer.

pub mod batchnorm;
pub mod conv;
pub mod dropout;
pub mod linear;
pub mod pool;
pub mod relu;

use crate::error::{CnnError, Result};
use crate::mode::Mode;
use crate::tensor::{Shape3, Tensor3D};
use std::io::{Read, Write};
use tracing::debug;

// Re-export main types for convenience
pub use batchnorm::BatchNorm2D;
pub use conv::Conv2D;
pub use dropout::Dropout;
pub use linear::LinearLayer;
pub use pool::MaxPool2D;
pub use relu::ReLU;

/// A differentiable stage in a network
pub trait Layer: Send {
    fn name(&self) -> &str;

    /// Compute the output for a batch
    ///
    /// In [`Mode::Training`] the layer also keeps whatever its backward pass
    /// needs. The returned slice is the layer's own buffer and stays valid
    /// until the next forward call.
    fn forward(&mut self, input: &[Tensor3D], mode: Mode) -> Result<&[Tensor3D]>;

    /// Turn the gradient w.r.t. this layer's output into the gradient w.r.t.
    /// its input, accumulating parameter gradients on the way
    ///
    /// Must follow a training-mode forward with the same batch size.
    fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]>;

    /// Plain gradient descent step on this layer's parameters
    fn update_gradients(&mut self, _learning_rate: f64) -> Result<()> {
        Ok(())
    }

    /// Append this layer's parameters to a checkpoint
    fn save_weights(&self, _writer: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Read this layer's parameters back, in the order `save_weights` wrote them
    fn load_weights(&mut self, _reader: &mut dyn Read) -> Result<()> {
        Ok(())
    }

    /// Output of the most recent forward call (empty before the first one)
    fn output(&self) -> &[Tensor3D];

    /// Number of trainable parameters
    fn num_params(&self) -> usize {
        0
    }
}

/// Per-sample input and output shapes, fixed on the first forward call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Built {
    pub input: Shape3,
    pub output: Shape3,
}

/// Bookkeeping shared by every layer: build state and call ordering
#[derive(Debug, Default)]
pub(crate) struct LayerState {
    built: Option<Built>,
    /// Batch size of the last forward, if it ran in training mode
    trained_batch: Option<usize>,
    /// Set by backward, cleared by every forward
    has_gradients: bool,
}

impl LayerState {
    pub fn built(&self) -> Option<Built> {
        self.built
    }

    /// Validate a forward batch, building the layer on its first call
    ///
    /// `output_shape` maps the per-sample input shape to the per-sample
    /// output shape and is only consulted when building. An input the layer
    /// cannot accept is rejected there, leaving the layer unbuilt.
    pub fn begin_forward(
        &mut self,
        layer: &str,
        input: &[Tensor3D],
        mode: Mode,
        output_shape: impl FnOnce(Shape3) -> Result<Shape3>,
    ) -> Result<Built> {
        let shape = batch_shape(layer, input)?;
        let built = match self.built {
            Some(built) if built.input != shape => {
                return Err(CnnError::ShapeMismatch {
                    layer: layer.to_string(),
                    expected: built.input,
                    got: shape,
                })
            }
            Some(built) => built,
            None => {
                let built = Built {
                    input: shape,
                    output: output_shape(shape)?,
                };
                debug!(
                    layer,
                    input = ?built.input,
                    output = ?built.output,
                    "allocating layer buffers"
                );
                self.built = Some(built);
                built
            }
        };
        self.trained_batch = mode.is_training().then_some(input.len());
        self.has_gradients = false;
        Ok(built)
    }

    /// Check that `delta` matches the preceding training forward
    pub fn begin_backward(&mut self, layer: &str, delta: &[Tensor3D]) -> Result<Built> {
        let (built, expected) = match (self.built, self.trained_batch) {
            (Some(built), Some(n)) => (built, n),
            _ => {
                return Err(CnnError::BackwardWithoutForward {
                    layer: layer.to_string(),
                })
            }
        };
        if delta.len() != expected {
            return Err(CnnError::BatchSizeMismatch {
                layer: layer.to_string(),
                expected,
                got: delta.len(),
            });
        }
        if let Some(bad) = delta.iter().find(|d| d.shape() != built.output) {
            return Err(CnnError::ShapeMismatch {
                layer: layer.to_string(),
                expected: built.output,
                got: bad.shape(),
            });
        }
        self.has_gradients = true;
        Ok(built)
    }

    pub fn begin_update(&self, layer: &str) -> Result<()> {
        if self.has_gradients {
            Ok(())
        } else {
            Err(CnnError::UpdateWithoutBackward {
                layer: layer.to_string(),
            })
        }
    }
}

pub(crate) fn shape_mismatch(layer: &str, expected: Shape3, got: Shape3) -> CnnError {
    CnnError::ShapeMismatch {
        layer: layer.to_string(),
        expected,
        got,
    }
}

/// Shared per-sample shape of a batch
pub(crate) fn batch_shape(layer: &str, batch: &[Tensor3D]) -> Result<Shape3> {
    let first = batch.first().ok_or_else(|| CnnError::EmptyBatch {
        layer: layer.to_string(),
    })?;
    let shape = first.shape();
    if batch.iter().any(|t| t.shape() != shape) {
        return Err(CnnError::RaggedBatch {
            layer: layer.to_string(),
        });
    }
    Ok(shape)
}

/// Grow or shrink `buffer` to `len` tensors of `shape`, keeping existing ones
pub(crate) fn resize_batch(buffer: &mut Vec<Tensor3D>, len: usize, shape: Shape3) {
    buffer.truncate(len);
    while buffer.len() < len {
        buffer.push(Tensor3D::zeros(shape));
    }
}

/// He-normal initialization: `N(0, 2 / fan_in)`
pub(crate) fn he_normal(rng: &mut impl rand::Rng, fan_in: usize, len: usize) -> Vec<f64> {
    use rand_distr::{Distribution, Normal};

    let std = (2.0 / fan_in as f64).sqrt();
    let normal = Normal::new(0.0, std).expect("fan_in must be positive");
    (0..len).map(|_| normal.sample(&mut *rng)).collect()
}
