//! Softmax and Cross-Entropy
//!
//! ## Softmax
//!
//! ```text
//! p_i = exp(x_i - max(x)) / sum_j exp(x_j - max(x))
//! ```
//!
//! Exponents at or above 88 saturate to `f64::MAX` and exponents at or below
//! -88 become exactly 0. Any NaN left after normalization is replaced by 0.
//!
//! ## Cross-Entropy
//!
//! With one-hot labels `t` the loss and its gradient w.r.t. the logits are:
//!
//! ```text
//! loss   = -sum_b sum_i t_i · ln(p_i) / batch
//! grad_x = p - t
//! ```
//!
//! The gradient is per sample (not divided by the batch size); layers that
//! own parameters average their own gradients over the batch.

use crate::tensor::Tensor3D;

/// Exponent magnitude beyond which `exp` saturates
pub const EXP_CLAMP: f64 = 88.0;

fn clamped_exp(x: f64) -> f64 {
    if x >= EXP_CLAMP {
        f64::MAX
    } else if x <= -EXP_CLAMP {
        0.0
    } else {
        x.exp()
    }
}

/// Class probabilities for one sample of logits
///
/// The result is a `num_classes × 1 × 1` vector, whatever the input's shape.
pub fn softmax(logits: &Tensor3D) -> Tensor3D {
    let max_value = logits.max();
    let mut probs = Tensor3D::vector(logits.len());
    let data = probs.data_mut();
    for (p, &x) in data.iter_mut().zip(logits.data()) {
        *p = clamped_exp(x - max_value);
    }
    let sum: f64 = data.iter().sum();
    for p in data.iter_mut() {
        *p /= sum;
        if p.is_nan() {
            *p = 0.0;
        }
    }
    probs
}

/// Softmax applied to every sample in a batch
pub fn softmax_batch(logits: &[Tensor3D]) -> Vec<Tensor3D> {
    logits.iter().map(softmax).collect()
}

/// One-hot vector for `label`
///
/// # Panics
///
/// Panics if `label >= num_classes`
pub fn one_hot(label: usize, num_classes: usize) -> Tensor3D {
    assert!(
        label < num_classes,
        "Label {} out of range for {} classes",
        label,
        num_classes
    );
    let mut code = Tensor3D::vector(num_classes);
    code.data_mut()[label] = 1.0;
    code
}

/// One-hot vectors for a batch of labels
pub fn one_hot_batch(labels: &[usize], num_classes: usize) -> Vec<Tensor3D> {
    labels.iter().map(|&l| one_hot(l, num_classes)).collect()
}

/// Cross-entropy loss and the gradient w.r.t. the logits
///
/// # Arguments
///
/// * `probs` - Softmax output, one vector per sample
/// * `targets` - One-hot (or soft) label vectors of the same length
///
/// # Returns
///
/// Tuple of (mean loss over the batch, `probs - targets` per sample)
pub fn cross_entropy_backward(probs: &[Tensor3D], targets: &[Tensor3D]) -> (f64, Vec<Tensor3D>) {
    assert_eq!(
        probs.len(),
        targets.len(),
        "Batch of {} predictions but {} targets",
        probs.len(),
        targets.len()
    );
    let mut loss = 0.0;
    let delta = probs
        .iter()
        .zip(targets)
        .map(|(p, t)| {
            let mut d = Tensor3D::vector(p.len());
            for ((di, &pi), &ti) in d.data_mut().iter_mut().zip(p.data()).zip(t.data()) {
                *di = pi - ti;
                // 0 · ln(0) is taken as 0
                if ti != 0.0 {
                    loss -= ti * pi.ln();
                }
            }
            d
        })
        .collect();
    (loss / probs.len() as f64, delta)
}
