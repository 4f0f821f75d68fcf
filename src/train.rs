//! Training Loop
//!
//! Plain mini-batch SGD for classifiers built from this crate's layers.
//!
//! ## One Training Step
//!
//! ```text
//! logits = model.forward(batch, Training)
//! probs  = softmax(logits)
//! loss   = cross_entropy(probs, one_hot(labels))
//! delta  = probs - one_hot(labels)
//! model.backward(delta)
//! model.update_gradients(learning_rate)
//! ```
//!
//! [`fit`] repeats that for the configured number of epochs, periodically
//! evaluating on held-out data in inference mode and reporting through
//! [`TrainingLogger`] and `tracing`.

use crate::alexnet::AlexNet;
use crate::data::BatchSource;
use crate::error::{CnnError, Result};
use crate::loss::{cross_entropy_backward, one_hot_batch, softmax_batch};
use crate::metrics::ClassificationEvaluator;
use crate::mode::Mode;
use crate::network::Sequential;
use crate::tensor::Tensor3D;
use crate::training_logger::TrainingLogger;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Anything trainable by [`train_step`]
pub trait Classifier {
    fn forward<'a>(&'a mut self, input: &'a [Tensor3D], mode: Mode) -> Result<&'a [Tensor3D]>;
    fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]>;
    fn update_gradients(&mut self, learning_rate: f64) -> Result<()>;
}

impl Classifier for Sequential {
    fn forward<'a>(&'a mut self, input: &'a [Tensor3D], mode: Mode) -> Result<&'a [Tensor3D]> {
        Sequential::forward(self, input, mode)
    }

    fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]> {
        Sequential::backward(self, delta)
    }

    fn update_gradients(&mut self, learning_rate: f64) -> Result<()> {
        Sequential::update_gradients(self, learning_rate)
    }
}

impl Classifier for AlexNet {
    fn forward<'a>(&'a mut self, input: &'a [Tensor3D], mode: Mode) -> Result<&'a [Tensor3D]> {
        AlexNet::forward(self, input, mode)
    }

    fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]> {
        AlexNet::backward(self, delta)
    }

    fn update_gradients(&mut self, learning_rate: f64) -> Result<()> {
        AlexNet::update_gradients(self, learning_rate)
    }
}

/// Optimization hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub valid_batch_size: usize,
    /// Steps between log rows (and validation passes)
    pub print_every: usize,
    /// Validation batches per evaluation
    pub valid_batches: usize,
    pub shuffle: bool,
    pub augment: bool,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            num_epochs: 10,
            batch_size: 10,
            valid_batch_size: 2,
            print_every: 50,
            valid_batches: 10,
            shuffle: true,
            augment: false,
            seed: 212,
        }
    }
}

impl TrainingConfig {
    /// A few quick steps, useful for smoke tests
    pub fn tiny() -> Self {
        Self {
            learning_rate: 1e-2,
            num_epochs: 2,
            batch_size: 4,
            valid_batch_size: 2,
            print_every: 1,
            valid_batches: 1,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn check_labels(batch: &[Tensor3D], labels: &[usize], num_classes: usize) -> Result<()> {
    if batch.len() != labels.len() {
        return Err(CnnError::Dataset(format!(
            "{} samples but {} labels",
            batch.len(),
            labels.len()
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
        return Err(CnnError::Dataset(format!(
            "label {} out of range for {} classes",
            bad, num_classes
        )));
    }
    Ok(())
}

/// One SGD step on a labelled batch
///
/// # Returns
///
/// Tuple of (mean cross-entropy loss, predicted class per sample). The
/// predictions come from the training-mode forward that produced the loss.
pub fn train_step(
    model: &mut dyn Classifier,
    batch: &[Tensor3D],
    labels: &[usize],
    learning_rate: f64,
) -> Result<(f64, Vec<usize>)> {
    let probs = softmax_batch(model.forward(batch, Mode::Training)?);
    let num_classes = probs.first().map_or(0, |p| p.len());
    check_labels(batch, labels, num_classes)?;

    let predictions = probs.iter().map(|p| p.argmax()).collect();
    let (loss, mut delta) = cross_entropy_backward(&probs, &one_hot_batch(labels, num_classes));
    model.backward(&mut delta)?;
    model.update_gradients(learning_rate)?;
    Ok((loss, predictions))
}

/// Mean loss and accuracy over `num_batches` batches in inference mode
pub fn evaluate(
    model: &mut dyn Classifier,
    source: &mut dyn BatchSource,
    num_batches: usize,
) -> Result<(f64, f64)> {
    let mut evaluator = ClassificationEvaluator::new();
    let mut total_loss = 0.0;
    let num_batches = num_batches.max(1);
    for _ in 0..num_batches {
        let (batch, labels) = source.next_batch()?;
        let probs = softmax_batch(model.forward(&batch, Mode::Inference)?);
        let num_classes = probs.first().map_or(0, |p| p.len());
        check_labels(&batch, &labels, num_classes)?;

        let (loss, _) = cross_entropy_backward(&probs, &one_hot_batch(&labels, num_classes));
        total_loss += loss;
        let predictions: Vec<usize> = probs.iter().map(|p| p.argmax()).collect();
        evaluator.compute(&predictions, &labels);
    }
    Ok((total_loss / num_batches as f64, evaluator.accuracy()))
}

/// Per-epoch results of [`fit`]
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub steps: usize,
    pub epoch_losses: Vec<f64>,
    pub epoch_accuracies: Vec<f64>,
    /// Final `(loss, accuracy)` on the validation source, if one was given
    pub validation: Option<(f64, f64)>,
}

/// Train for `config.num_epochs` passes over `train`
///
/// Every `print_every` steps the running training metrics (and, when a
/// validation source is supplied, `valid_batches` batches of validation
/// metrics) are written to `logger`.
pub fn fit(
    model: &mut dyn Classifier,
    train: &mut dyn BatchSource,
    mut valid: Option<&mut dyn BatchSource>,
    config: &TrainingConfig,
    mut logger: Option<&mut TrainingLogger>,
) -> Result<TrainingHistory> {
    let steps_per_epoch = train.batches_per_epoch();
    let print_every = config.print_every.max(1);
    let mut history = TrainingHistory::default();

    info!(
        epochs = config.num_epochs,
        steps_per_epoch,
        batch_size = train.batch_size(),
        learning_rate = config.learning_rate,
        "starting training"
    );

    for epoch in 1..=config.num_epochs {
        let mut epoch_eval = ClassificationEvaluator::new();
        let mut window_eval = ClassificationEvaluator::new();
        let mut epoch_loss = 0.0;
        let mut window_loss = 0.0;
        let mut window_steps = 0;

        for _ in 0..steps_per_epoch {
            let (batch, labels) = train.next_batch()?;
            let (loss, predictions) = train_step(model, &batch, &labels, config.learning_rate)?;
            history.steps += 1;
            epoch_loss += loss;
            window_loss += loss;
            window_steps += 1;
            epoch_eval.compute(&predictions, &labels);
            window_eval.compute(&predictions, &labels);

            if history.steps % print_every == 0 {
                let validation = match valid.as_deref_mut() {
                    Some(source) => Some(evaluate(model, source, config.valid_batches)?),
                    None => None,
                };
                if let Some(logger) = logger.as_deref_mut() {
                    logger.log(
                        history.steps,
                        config.learning_rate,
                        window_loss / window_steps as f64,
                        window_eval.accuracy(),
                        validation,
                    )?;
                }
                window_eval.reset();
                window_loss = 0.0;
                window_steps = 0;
            }
        }

        let mean_loss = epoch_loss / steps_per_epoch as f64;
        info!(
            epoch,
            loss = mean_loss,
            accuracy = epoch_eval.accuracy(),
            "epoch finished"
        );
        history.epoch_losses.push(mean_loss);
        history.epoch_accuracies.push(epoch_eval.accuracy());
    }

    if let Some(source) = valid {
        let (loss, accuracy) = evaluate(model, source, config.valid_batches)?;
        info!(loss, accuracy, "validation");
        history.validation = Some((loss, accuracy));
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemorySource;
    use crate::layers::LinearLayer;

    /// Two linearly separable classes: the sign of the first feature
    fn separable(n: usize) -> Vec<(Tensor3D, usize)> {
        (0..n)
            .map(|i| {
                let label = i % 2;
                let sign = if label == 0 { 1.0 } else { -1.0 };
                let jitter = (i as f64 * 0.37).sin() * 0.1;
                (
                    Tensor3D::from_vec(2, 1, 1, vec![sign * (1.0 + jitter), jitter]),
                    label,
                )
            })
            .collect()
    }

    #[test]
    fn test_train_step_reduces_loss() {
        let mut model = Sequential::new().with(LinearLayer::new("fc", 2, 2));
        let samples = separable(8);
        let batch: Vec<Tensor3D> = samples.iter().map(|(t, _)| t.clone()).collect();
        let labels: Vec<usize> = samples.iter().map(|(_, l)| *l).collect();

        let (first, predictions) = train_step(&mut model, &batch, &labels, 0.5).unwrap();
        assert_eq!(predictions.len(), 8);
        let mut last = first;
        for _ in 0..20 {
            last = train_step(&mut model, &batch, &labels, 0.5).unwrap().0;
        }
        assert!(last < first, "loss went from {} to {}", first, last);
    }

    #[test]
    fn test_train_step_rejects_bad_labels() {
        let mut model = Sequential::new().with(LinearLayer::new("fc", 2, 2));
        let batch = vec![Tensor3D::vector(2)];
        assert!(matches!(
            train_step(&mut model, &batch, &[5], 0.1),
            Err(CnnError::Dataset(_))
        ));
        assert!(matches!(
            train_step(&mut model, &batch, &[0, 1], 0.1),
            Err(CnnError::Dataset(_))
        ));
    }

    #[test]
    fn test_fit_learns_separable_data() {
        let mut model = Sequential::new().with(LinearLayer::new("fc", 2, 2));
        let mut train = InMemorySource::new(separable(16), 4, true, 1);
        let mut valid = InMemorySource::new(separable(8), 4, false, 0);
        let config = TrainingConfig {
            learning_rate: 0.5,
            num_epochs: 10,
            ..TrainingConfig::tiny()
        };

        let dir = tempfile::tempdir().unwrap();
        let mut logger = TrainingLogger::new(dir.path().join("log.csv")).unwrap();
        let history = fit(
            &mut model,
            &mut train,
            Some(&mut valid as &mut dyn BatchSource),
            &config,
            Some(&mut logger),
        )
        .unwrap();

        assert_eq!(history.steps, 40);
        assert_eq!(history.epoch_losses.len(), 10);
        assert!(history.epoch_losses[9] < history.epoch_losses[0]);
        let (_, accuracy) = history.validation.unwrap();
        assert_eq!(accuracy, 1.0);

        let rows = std::fs::read_to_string(dir.path().join("log.csv")).unwrap();
        assert_eq!(rows.lines().count(), 41);
    }

    #[test]
    fn test_config_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        let config = TrainingConfig {
            augment: true,
            ..TrainingConfig::tiny()
        };
        config.to_json_file(&path).unwrap();
        assert_eq!(TrainingConfig::from_json_file(&path).unwrap(), config);
    }
}
