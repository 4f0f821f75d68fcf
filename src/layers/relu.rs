//! ReLU Activation
//!
//! ## Forward Pass
//!
//! ```text
//! y = max(0, x)
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_x = grad_y   where x > 0
//!        = 0        elsewhere
//! ```
//!
//! The gate is the sign of the forward input, read back from the cached
//! output (`y > 0` exactly when `x > 0`). The gradient is rewritten in place.

use super::{resize_batch, Layer, LayerState};
use crate::error::Result;
use crate::mode::Mode;
use crate::tensor::Tensor3D;

pub struct ReLU {
    name: String,
    state: LayerState,
    output: Vec<Tensor3D>,
}

impl ReLU {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: LayerState::default(),
            output: Vec::new(),
        }
    }
}

impl Layer for ReLU {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &[Tensor3D], mode: Mode) -> Result<&[Tensor3D]> {
        let built = self.state.begin_forward(&self.name, input, mode, |s| Ok(s))?;
        resize_batch(&mut self.output, input.len(), built.output);

        for (out, x) in self.output.iter_mut().zip(input) {
            for (o, &v) in out.data_mut().iter_mut().zip(x.data()) {
                *o = v.max(0.0);
            }
        }
        Ok(&self.output)
    }

    fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]> {
        self.state.begin_backward(&self.name, delta)?;

        for (d, out) in delta.iter_mut().zip(&self.output) {
            for (g, &y) in d.data_mut().iter_mut().zip(out.data()) {
                if y <= 0.0 {
                    *g = 0.0;
                }
            }
        }
        Ok(delta)
    }

    fn output(&self) -> &[Tensor3D] {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CnnError;

    #[test]
    fn test_forward_clamps_negatives() {
        let mut relu = ReLU::new("relu");
        let x = vec![Tensor3D::from_vec(1, 1, 4, vec![-2.0, 0.0, 1.5, -0.1])];
        let y = relu.forward(&x, Mode::Inference).unwrap();
        assert_eq!(y[0].data(), &[0.0, 0.0, 1.5, 0.0]);
    }

    #[test]
    fn test_backward_gates_on_input_sign() {
        let mut relu = ReLU::new("relu");
        let x = vec![Tensor3D::from_vec(1, 1, 4, vec![-2.0, 0.0, 1.5, 3.0])];
        relu.forward(&x, Mode::Training).unwrap();

        // A negative gradient still flows where the input was positive
        let mut delta = vec![Tensor3D::from_vec(1, 1, 4, vec![5.0, 5.0, -1.0, 2.0])];
        let grad = relu.backward(&mut delta).unwrap();
        assert_eq!(grad[0].data(), &[0.0, 0.0, -1.0, 2.0]);
    }

    #[test]
    fn test_backward_is_in_place() {
        let mut relu = ReLU::new("relu");
        let x = vec![Tensor3D::from_vec(1, 1, 2, vec![-1.0, 1.0])];
        relu.forward(&x, Mode::Training).unwrap();

        let mut delta = vec![Tensor3D::from_vec(1, 1, 2, vec![7.0, 7.0])];
        relu.backward(&mut delta).unwrap();
        assert_eq!(delta[0].data(), &[0.0, 7.0]);
    }

    #[test]
    fn test_backward_requires_training_forward() {
        let mut relu = ReLU::new("relu");
        let x = vec![Tensor3D::new(1, 1, 2)];
        relu.forward(&x, Mode::Inference).unwrap();
        let mut delta = vec![Tensor3D::new(1, 1, 2)];
        assert!(matches!(
            relu.backward(&mut delta),
            Err(CnnError::BackwardWithoutForward { .. })
        ));
    }

    #[test]
    fn test_output_follows_batch_size() {
        let mut relu = ReLU::new("relu");
        relu.forward(&vec![Tensor3D::new(2, 2, 2); 4], Mode::Training)
            .unwrap();
        assert_eq!(relu.output().len(), 4);
        relu.forward(&vec![Tensor3D::new(2, 2, 2); 1], Mode::Inference)
            .unwrap();
        assert_eq!(relu.output().len(), 1);
    }
}
