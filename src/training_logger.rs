//! Training Logger
//!
//! Records training metrics to a CSV file and mirrors every row to the
//! console, so a run can be followed live and plotted afterwards.
//!
//! ## Example
//!
//! ```rust,no_run
//! use alexnet_scratch::TrainingLogger;
//!
//! let mut logger = TrainingLogger::new("training_log.csv")?;
//! logger.log(100, 0.01, 1.2, 0.55, Some((1.4, 0.48)))?;
//! # Ok::<(), alexnet_scratch::CnnError>(())
//! ```
//!
//! ## CSV Format
//!
//! - `step`: Training step number
//! - `elapsed_seconds`: Time since the logger was created
//! - `learning_rate`: SGD step size
//! - `train_loss`: Mean cross-entropy over the steps since the last row
//! - `train_accuracy`: Fraction of those training samples classified correctly
//! - `val_loss`: Validation loss (empty when not evaluated)
//! - `val_accuracy`: Validation accuracy (empty when not evaluated)
//!
//! Each row is flushed immediately so a crashed run keeps its history.

use crate::error::Result;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

pub const CSV_HEADER: &str =
    "step,elapsed_seconds,learning_rate,train_loss,train_accuracy,val_loss,val_accuracy";

/// CSV + console logger for classification training
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file and write its header
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(log_file, "{}", CSV_HEADER)?;

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Append one row and print it
    ///
    /// # Arguments
    ///
    /// * `step` - Training step number
    /// * `learning_rate` - Current learning rate
    /// * `train_loss` - Mean training loss
    /// * `train_accuracy` - Training accuracy in `[0, 1]`
    /// * `validation` - `(loss, accuracy)` on held-out data, if measured
    pub fn log(
        &mut self,
        step: usize,
        learning_rate: f64,
        train_loss: f64,
        train_accuracy: f64,
        validation: Option<(f64, f64)>,
    ) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let (val_loss, val_accuracy) = match validation {
            Some((loss, acc)) => (format!("{:.4}", loss), format!("{:.4}", acc)),
            None => (String::new(), String::new()),
        };

        writeln!(
            self.log_file,
            "{},{:.2},{:.6},{:.4},{:.4},{},{}",
            step, elapsed, learning_rate, train_loss, train_accuracy, val_loss, val_accuracy
        )?;
        self.log_file.flush()?;

        let step_time = self.last_log_time.elapsed().as_secs_f64();
        print!(
            "Step {:5} | Time: {:7.1}s (+{:.1}s) | LR: {:.6} | Train: {:.4} ({:5.1}%)",
            step,
            elapsed,
            step_time,
            learning_rate,
            train_loss,
            train_accuracy * 100.0
        );
        match validation {
            Some((loss, acc)) => println!(" | Val: {:.4} ({:5.1}%)", loss, acc * 100.0),
            None => println!(),
        }

        self.last_log_time = Instant::now();
        Ok(())
    }
}
