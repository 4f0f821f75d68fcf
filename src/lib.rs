//! AlexNet From Scratch
//!
//! A convolutional network training engine with hand-written forward and
//! backward passes. No autograd and no BLAS: every layer spells out its own
//! gradient math over plain `f64` buffers.
//!
//! # Modules
//!
//! - [`tensor`] - Channel-planar `C × H × W` tensors
//! - [`layers`] - Conv, pooling, batch norm, ReLU, dropout and linear layers
//! - [`network`] - Sequential container with checkpointing
//! - [`alexnet`] - The fixed AlexNet-style classifier
//! - [`loss`] / [`metrics`] - Softmax cross-entropy and accuracy
//! - [`data`] - Dataset splitting, batch sources and augmentation
//! - [`train`] / [`training_logger`] - SGD loop and CSV metrics
//!
//! # Example
//!
//! ```rust
//! use alexnet_scratch::loss::{cross_entropy_backward, one_hot_batch, softmax_batch};
//! use alexnet_scratch::{AlexNet, AlexNetConfig, Mode, Tensor3D};
//!
//! let mut net = AlexNet::new(AlexNetConfig {
//!     num_classes: 2,
//!     input_shape: (3, 64, 64),
//!     ..AlexNetConfig::default()
//! });
//! let batch = vec![Tensor3D::new(3, 64, 64); 2];
//!
//! let probs = softmax_batch(net.forward(&batch, Mode::Training)?);
//! let (loss, mut delta) = cross_entropy_backward(&probs, &one_hot_batch(&[0, 1], 2));
//! net.backward(&mut delta)?;
//! net.update_gradients(1e-3)?;
//! assert!(loss.is_finite());
//! # Ok::<(), alexnet_scratch::CnnError>(())
//! ```

pub mod alexnet;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod mode;
pub mod network;
pub mod tensor;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use alexnet::{AlexNet, AlexNetConfig};
pub use data::{BatchSource, DatasetSplit, ImageFolderSource, InMemorySource};
pub use error::{CnnError, Result};
pub use layers::Layer;
pub use metrics::ClassificationEvaluator;
pub use mode::Mode;
pub use network::Sequential;
pub use tensor::{Batch, Shape3, Tensor3D};
pub use train::{Classifier, TrainingConfig};
pub use training_logger::TrainingLogger;
