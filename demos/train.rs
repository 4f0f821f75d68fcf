//! Train AlexNet on a Folder-Per-Class Image Dataset
//!
//! ## Usage
//!
//! ```bash
//! # dataset/0/*.jpg, dataset/1/*.jpg, ... (categories discovered from folders)
//! cargo run --release --example train -- --data dataset
//!
//! # Explicit categories, batch norm, smaller images
//! cargo run --release --example train -- --data dataset \
//!     --categories cat,dog --batch-norm --image-size 128
//!
//! # Hyperparameters from JSON, resume from a checkpoint
//! cargo run --release --example train -- --data dataset \
//!     --config train.json --checkpoint runs/alexnet.bin
//! ```
//!
//! Set `RUST_LOG=debug` to see layer buffer allocation.

use alexnet_scratch::data::{discover_categories, get_images_for_classification, Augmentor};
use alexnet_scratch::train::{evaluate, fit};
use alexnet_scratch::{
    AlexNet, AlexNetConfig, BatchSource, ImageFolderSource, TrainingConfig, TrainingLogger,
};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "train", about = "Train an AlexNet-style classifier from scratch")]
struct Args {
    /// Dataset root holding one folder per category
    #[arg(long)]
    data: PathBuf,

    /// Category folder names, in label order (default: every sub-folder, sorted)
    #[arg(long, value_delimiter = ',')]
    categories: Option<Vec<String>>,

    /// TrainingConfig JSON file (default: built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    // Overrides
    /// Number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Training batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Enable random flips, crops and rotations
    #[arg(long)]
    augment: bool,

    // Model
    /// Square input side length
    #[arg(long, default_value_t = 224)]
    image_size: usize,

    /// Insert batch norm after every convolution
    #[arg(long)]
    batch_norm: bool,

    /// Dropout rate before the classifier
    #[arg(long, default_value_t = 0.4)]
    dropout: f64,

    // Files
    /// Checkpoint to resume from
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Output directory for the checkpoint, config and CSV log
    #[arg(long, default_value = "runs")]
    out: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_json_file(path)?,
        None => TrainingConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.num_epochs = epochs;
    }
    if let Some(lr) = args.lr {
        config.learning_rate = lr;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    config.augment |= args.augment;

    let categories = match args.categories {
        Some(categories) => categories,
        None => discover_categories(&args.data)?,
    };
    if categories.is_empty() {
        return Err(format!("no category folders found in {}", args.data.display()).into());
    }
    println!("Categories: {}", categories.join(", "));

    let split = get_images_for_classification(&args.data, &categories, (0.8, 0.1), config.seed)?;

    let input_shape = (3, args.image_size, args.image_size);
    let mut train = ImageFolderSource::new(
        split.train,
        config.batch_size,
        input_shape,
        config.shuffle,
        config.seed,
    );
    if config.augment {
        train = train.with_augmentor(Augmentor::new(config.seed));
    }
    let mut valid =
        ImageFolderSource::new(split.valid, config.valid_batch_size, input_shape, false, config.seed);

    let mut net = AlexNet::new(AlexNetConfig {
        num_classes: categories.len(),
        batch_norm: args.batch_norm,
        input_shape,
        dropout: args.dropout,
        seed: config.seed,
    });
    println!("Model: {} parameters", net.num_params());
    println!("Layers: {}", net.layer_names().join(" -> "));

    if let Some(path) = &args.checkpoint {
        net.load_weights(path)?;
    }

    fs::create_dir_all(&args.out)?;
    config.to_json_file(args.out.join("training_config.json"))?;
    let mut logger = TrainingLogger::new(args.out.join("training_log.csv"))?;

    let valid_source: Option<&mut dyn BatchSource> = if valid.is_empty() {
        None
    } else {
        Some(&mut valid)
    };
    let history = fit(&mut net, &mut train, valid_source, &config, Some(&mut logger))?;
    println!(
        "\nFinished {} steps, final epoch loss {:.4}",
        history.steps,
        history.epoch_losses.last().copied().unwrap_or(f64::NAN)
    );

    if !split.test.is_empty() {
        let test_len = split.test.len();
        let mut test = ImageFolderSource::new(split.test, 1, input_shape, false, config.seed);
        let (loss, accuracy) = evaluate(&mut net, &mut test, test_len)?;
        println!("Test: loss {:.4}, accuracy {:.1}%", loss, accuracy * 100.0);
    }

    net.save_weights(args.out.join("alexnet.bin"))?;
    Ok(())
}
