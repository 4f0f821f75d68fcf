//! Error Types
//!
//! Construction-time preconditions (odd kernel sizes, non-zero channel
//! counts, dropout rates in range) are asserted and panic. Everything that
//! depends on the data flowing through a network at runtime is reported
//! through [`CnnError`] instead:
//!
//! - a layer receiving a sample shape different from the one it was built for
//! - `backward` without a preceding training-mode `forward`
//! - `update_gradients` without a `backward` since the last `forward`
//! - I/O, JSON and image decoding failures in the surrounding glue

use crate::tensor::Shape3;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CnnError {
    #[error("layer `{layer}` received an empty batch")]
    EmptyBatch { layer: String },

    #[error("layer `{layer}` was built for samples of shape {expected:?} but received {got:?}")]
    ShapeMismatch {
        layer: String,
        expected: Shape3,
        got: Shape3,
    },

    #[error("layer `{layer}` received a batch whose samples do not share one shape")]
    RaggedBatch { layer: String },

    #[error("layer `{layer}` expected a batch of {expected} gradients but received {got}")]
    BatchSizeMismatch {
        layer: String,
        expected: usize,
        got: usize,
    },

    #[error("layer `{layer}`: backward called without a preceding training-mode forward")]
    BackwardWithoutForward { layer: String },

    #[error("layer `{layer}`: update_gradients called without a backward pass since the last forward")]
    UpdateWithoutBackward { layer: String },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, CnnError>;
