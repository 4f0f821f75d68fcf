//! Sequential Network Container
//!
//! A network is a fixed, ordered list of layers. Forward visits the list
//! front-to-back, each layer consuming the previous layer's output buffer;
//! backward visits it back-to-front.
//!
//! ## Checkpoints
//!
//! `save_weights` asks every layer, in order, to append its parameter
//! blocks to one stream (see [`crate::checkpoint`]). `load_weights` reads
//! them back in the same order, so the architecture must match exactly.
//!
//! ## Example
//!
//! ```rust
//! use alexnet_scratch::layers::{Conv2D, LinearLayer, ReLU};
//! use alexnet_scratch::{Mode, Sequential, Tensor3D};
//!
//! let mut net = Sequential::new()
//!     .with(Conv2D::new("conv", 1, 2, 3, 1))
//!     .with(ReLU::new("relu"))
//!     .with(LinearLayer::new("fc", 2 * 3 * 3, 4));
//!
//! let batch = vec![Tensor3D::new(1, 5, 5); 2];
//! let logits = net.forward(&batch, Mode::Inference)?;
//! assert_eq!(logits.len(), 2);
//! assert_eq!(logits[0].shape(), (4, 1, 1));
//! # Ok::<(), alexnet_scratch::CnnError>(())
//! ```

use crate::error::Result;
use crate::layers::Layer;
use crate::mode::Mode;
use crate::tensor::Tensor3D;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{info, warn};

/// Ordered chain of layers
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer (builder style)
    pub fn with(mut self, layer: impl Layer + 'static) -> Self {
        self.push(Box::new(layer));
        self
    }

    pub fn push(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run a batch through every layer
    ///
    /// An empty network returns its input unchanged.
    pub fn forward<'a>(&'a mut self, input: &'a [Tensor3D], mode: Mode) -> Result<&'a [Tensor3D]> {
        let mut current = input;
        for layer in self.layers.iter_mut() {
            current = layer.forward(current, mode)?;
        }
        Ok(current)
    }

    /// Backpropagate the gradient of the loss w.r.t. the network output
    ///
    /// Returns the gradient w.r.t. the network input.
    pub fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]> {
        let mut current = delta;
        for layer in self.layers.iter_mut().rev() {
            current = layer.backward(current)?;
        }
        Ok(current)
    }

    /// One SGD step on every layer
    pub fn update_gradients(&mut self, learning_rate: f64) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.update_gradients(learning_rate)?;
        }
        Ok(())
    }

    pub fn save_weights_to(&self, writer: &mut dyn Write) -> Result<()> {
        for layer in &self.layers {
            layer.save_weights(writer)?;
        }
        Ok(())
    }

    pub fn load_weights_from(&mut self, reader: &mut dyn Read) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.load_weights(reader)?;
        }
        Ok(())
    }

    /// Write a checkpoint file
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.save_weights_to(&mut writer)?;
        writer.flush()?;
        info!(
            path = %path.display(),
            params = self.num_params(),
            "saved checkpoint"
        );
        Ok(())
    }

    /// Read a checkpoint file written for the same architecture
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        self.load_weights_from(&mut reader)?;

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            warn!(path = %path.display(), "checkpoint has trailing bytes");
        }
        info!(path = %path.display(), "loaded checkpoint");
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(|l| l.num_params()).sum()
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    pub fn layer(&self, name: &str) -> Option<&dyn Layer> {
        self.layers
            .iter()
            .find(|l| l.name() == name)
            .map(|l| l.as_ref())
    }

    /// Output buffer of the named layer from the most recent forward
    pub fn layer_output(&self, name: &str) -> Option<&[Tensor3D]> {
        self.layer(name).map(|l| l.output())
    }
}
