//! Execution Mode
//!
//! Several layers behave differently while training: dropout masks channels,
//! batch normalization uses batch statistics, and pooling/conv/linear layers
//! keep what `backward` will need. The mode is passed explicitly to every
//! forward call rather than held in shared state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Cache activations for backward, use batch statistics, apply dropout
    Training,
    /// Pure function of the input and current parameters
    Inference,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Training)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_training() {
        assert!(Mode::Training.is_training());
        assert!(!Mode::Inference.is_training());
    }
}
