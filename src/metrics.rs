//! Classification accuracy accumulated across batches.

/// Running count of correct predictions
#[derive(Debug, Default, Clone)]
pub struct ClassificationEvaluator {
    correct: usize,
    seen: usize,
}

impl ClassificationEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch of predictions
    pub fn compute(&mut self, predictions: &[usize], labels: &[usize]) {
        assert_eq!(
            predictions.len(),
            labels.len(),
            "{} predictions for {} labels",
            predictions.len(),
            labels.len()
        );
        self.correct += predictions
            .iter()
            .zip(labels)
            .filter(|(p, l)| p == l)
            .count();
        self.seen += labels.len();
    }

    /// Fraction correct so far (0 before any batch)
    pub fn accuracy(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.correct as f64 / self.seen as f64
        }
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn reset(&mut self) {
        self.correct = 0;
        self.seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_across_batches() {
        let mut eval = ClassificationEvaluator::new();
        assert_eq!(eval.accuracy(), 0.0);

        eval.compute(&[1, 2, 3], &[1, 0, 3]);
        eval.compute(&[0], &[0]);
        assert_eq!(eval.seen(), 4);
        assert_eq!(eval.accuracy(), 0.75);

        eval.reset();
        assert_eq!(eval.seen(), 0);
        assert_eq!(eval.accuracy(), 0.0);
    }
}
