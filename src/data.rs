//! Datasets and Batch Sources
//!
//! Everything that turns files on disk into batches of tensors:
//!
//! - **get_images_for_classification**: Walks `root/<category>/` folders and
//!   splits the labelled file list into train / valid / test partitions
//! - **BatchSource**: Anything that can hand out `(batch, labels)` forever
//! - **InMemorySource**: Cycles over tensors already in memory
//! - **ImageFolderSource**: Decodes, augments and resizes images on demand
//! - **Augmentor**: Random flips, crops and rotations applied before resizing
//!
//! Sources wrap around at the end of their list, reshuffling first when
//! shuffling is enabled, so `next_batch` always returns a full batch.
//!
//! ## Dataset Layout
//!
//! ```text
//! root/
//!   cat/   img_001.jpg img_002.png ...
//!   dog/   ...
//! ```
//!
//! The label of an image is the index of its folder in the category list.

use crate::error::{CnnError, Result};
use crate::tensor::{Batch, Shape3, Tensor3D, IMAGENET_MEAN, IMAGENET_STD};
use image::imageops::FilterType;
use image::{DynamicImage, Rgb};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `(image path, class label)` pairs
pub type ImageList = Vec<(PathBuf, usize)>;

/// Default seed for dataset shuffling
pub const DATASET_SEED: u64 = 212;

/// The three partitions of a labelled dataset
#[derive(Debug, Clone, Default)]
pub struct DatasetSplit {
    pub train: ImageList,
    pub valid: ImageList,
    pub test: ImageList,
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

/// Sorted names of the sub-directories of `root`
pub fn discover_categories(root: impl AsRef<Path>) -> Result<Vec<String>> {
    let root = root.as_ref();
    let entries = fs::read_dir(root)
        .map_err(|e| CnnError::Dataset(format!("cannot read {}: {}", root.display(), e)))?;
    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// List and split a folder-per-class image dataset
///
/// All images are gathered, shuffled with `seed`, and then cut into
/// `train = ratios.0`, `test = ratios.1` and `valid = the remainder`.
///
/// # Arguments
///
/// * `root` - Dataset directory holding one folder per category
/// * `categories` - Folder names; position in this list is the label
/// * `ratios` - `(train, test)` fractions, both positive, summing to at most 1
/// * `seed` - Shuffle seed
pub fn get_images_for_classification(
    root: impl AsRef<Path>,
    categories: &[impl AsRef<str>],
    ratios: (f64, f64),
    seed: u64,
) -> Result<DatasetSplit> {
    let root = root.as_ref();
    if !(ratios.0 > 0.0 && ratios.1 > 0.0 && ratios.0 + ratios.1 <= 1.0) {
        return Err(CnnError::Dataset(format!(
            "invalid split ratios {:?}",
            ratios
        )));
    }

    let mut all_images = ImageList::new();
    for (label, category) in categories.iter().enumerate() {
        let dir = root.join(category.as_ref());
        if !dir.is_dir() {
            return Err(CnnError::Dataset(format!(
                "category directory {} does not exist",
                dir.display()
            )));
        }
        // read_dir order is platform dependent
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        paths.sort();
        for path in paths {
            if path.is_file() && is_image(&path) {
                all_images.push((path, label));
            } else {
                warn!(path = %path.display(), "skipping non-image entry");
            }
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    all_images.shuffle(&mut rng);

    let total = all_images.len();
    let train_size = (total as f64 * ratios.0) as usize;
    let test_size = (total as f64 * ratios.1) as usize;

    let valid = all_images.split_off(train_size + test_size);
    let test = all_images.split_off(train_size);
    let split = DatasetSplit {
        train: all_images,
        valid,
        test,
    };

    info!(
        train = split.train.len(),
        test = split.test.len(),
        valid = split.valid.len(),
        "dataset split"
    );
    Ok(split)
}

/// A never-ending supply of labelled batches
pub trait BatchSource {
    /// Next `batch_size` samples and their labels
    fn next_batch(&mut self) -> Result<(Batch, Vec<usize>)>;

    /// Number of distinct samples in one pass
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batch_size(&self) -> usize;

    /// Full batches needed to see every sample once (at least one)
    fn batches_per_epoch(&self) -> usize {
        (self.len() / self.batch_size().max(1)).max(1)
    }
}

/// Visiting order shared by both sources
#[derive(Debug)]
struct Cursor {
    order: Vec<usize>,
    position: usize,
    shuffle: bool,
    rng: StdRng,
}

impl Cursor {
    fn new(len: usize, shuffle: bool, seed: u64) -> Self {
        let mut cursor = Self {
            order: (0..len).collect(),
            position: 0,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        };
        if shuffle {
            cursor.order.shuffle(&mut cursor.rng);
        }
        cursor
    }

    /// Index of the next sample, reshuffling after every full pass
    fn next_index(&mut self) -> usize {
        if self.position >= self.order.len() {
            self.position = 0;
            if self.shuffle {
                self.order.shuffle(&mut self.rng);
            }
        }
        let idx = self.order[self.position];
        self.position += 1;
        idx
    }
}

/// Batches drawn from tensors that are already decoded
pub struct InMemorySource {
    samples: Vec<(Tensor3D, usize)>,
    batch_size: usize,
    cursor: Cursor,
}

impl InMemorySource {
    pub fn new(samples: Vec<(Tensor3D, usize)>, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        assert!(batch_size > 0, "Batch size must be positive");
        let cursor = Cursor::new(samples.len(), shuffle, seed);
        Self {
            samples,
            batch_size,
            cursor,
        }
    }
}

impl BatchSource for InMemorySource {
    fn next_batch(&mut self) -> Result<(Batch, Vec<usize>)> {
        if self.samples.is_empty() {
            return Err(CnnError::Dataset("in-memory source is empty".to_string()));
        }
        let mut images = Vec::with_capacity(self.batch_size);
        let mut labels = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let (image, label) = &self.samples[self.cursor.next_index()];
            images.push(image.clone());
            labels.push(*label);
        }
        Ok((images, labels))
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Random image transformations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AugmentOp {
    HorizontalFlip,
    VerticalFlip,
    /// Keep a random window covering 70% to 95% of each side
    Crop,
    /// Rotate about the centre by 15 to 75 degrees either way, filling with black
    Rotate,
}

/// Applies each configured op with its own probability, in random order
pub struct Augmentor {
    ops: Vec<(AugmentOp, f64)>,
    rng: StdRng,
}

impl Augmentor {
    /// Horizontal flip 0.5, vertical flip 0.2, crop 0.7, rotate 0.5
    pub fn new(seed: u64) -> Self {
        Self::with_ops(
            vec![
                (AugmentOp::HorizontalFlip, 0.5),
                (AugmentOp::VerticalFlip, 0.2),
                (AugmentOp::Crop, 0.7),
                (AugmentOp::Rotate, 0.5),
            ],
            seed,
        )
    }

    pub fn with_ops(ops: Vec<(AugmentOp, f64)>, seed: u64) -> Self {
        Self {
            ops,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn apply(&mut self, mut image: DynamicImage) -> DynamicImage {
        self.ops.shuffle(&mut self.rng);
        for i in 0..self.ops.len() {
            let (op, probability) = self.ops[i];
            if self.rng.random::<f64>() < 1.0 - probability {
                continue;
            }
            image = match op {
                AugmentOp::HorizontalFlip => image.fliph(),
                AugmentOp::VerticalFlip => image.flipv(),
                AugmentOp::Crop => {
                    let ratio = 0.7 + self.rng.random_range(0.0..0.25);
                    let (w, h) = (image.width(), image.height());
                    let crop_w = ((w as f64 * ratio) as u32).max(1);
                    let crop_h = ((h as f64 * ratio) as u32).max(1);
                    let x = self.rng.random_range(0..=w - crop_w);
                    let y = self.rng.random_range(0..=h - crop_h);
                    image.crop_imm(x, y, crop_w, crop_h)
                }
                AugmentOp::Rotate => {
                    let mut degrees: f32 = self.rng.random_range(15.0..75.0);
                    if self.rng.random_bool(0.5) {
                        degrees = -degrees;
                    }
                    DynamicImage::ImageRgb8(rotate_about_center(
                        &image.to_rgb8(),
                        degrees.to_radians(),
                        Interpolation::Bilinear,
                        Rgb([0, 0, 0]),
                    ))
                }
            };
        }
        image
    }
}

/// Batches decoded from image files on demand
///
/// Every image is optionally augmented, resized to the configured shape,
/// scaled to `[0, 1]` and laid out channel-planar. Files that fail to decode
/// are skipped with a warning.
pub struct ImageFolderSource {
    images: ImageList,
    batch_size: usize,
    shape: Shape3,
    augmentor: Option<Augmentor>,
    imagenet_normalize: bool,
    cursor: Cursor,
}

impl ImageFolderSource {
    /// # Arguments
    ///
    /// * `images` - Labelled file list, e.g. one partition of a [`DatasetSplit`]
    /// * `batch_size` - Samples per batch
    /// * `shape` - `(channels, height, width)` with 1 or 3 channels
    /// * `shuffle` - Reshuffle after every pass over the list
    /// * `seed` - Seed for shuffling
    pub fn new(images: ImageList, batch_size: usize, shape: Shape3, shuffle: bool, seed: u64) -> Self {
        assert!(batch_size > 0, "Batch size must be positive");
        assert!(
            shape.0 == 1 || shape.0 == 3,
            "Images load as 1 or 3 channels, got {}",
            shape.0
        );
        let cursor = Cursor::new(images.len(), shuffle, seed);
        Self {
            images,
            batch_size,
            shape,
            augmentor: None,
            imagenet_normalize: false,
            cursor,
        }
    }

    pub fn with_augmentor(mut self, augmentor: Augmentor) -> Self {
        self.augmentor = Some(augmentor);
        self
    }

    /// Standardize RGB tensors with the ImageNet channel statistics
    pub fn with_imagenet_normalization(mut self) -> Self {
        self.imagenet_normalize = true;
        self
    }

    fn load(&mut self, path: &Path) -> Result<Tensor3D> {
        let mut image = image::open(path)?;
        if let Some(augmentor) = self.augmentor.as_mut() {
            image = augmentor.apply(image);
        }
        let (channels, height, width) = self.shape;
        let resized = image.resize_exact(width as u32, height as u32, FilterType::Triangle);
        let mut tensor = if channels == 3 {
            Tensor3D::from_interleaved_u8(height, width, 3, resized.to_rgb8().as_raw())
        } else {
            Tensor3D::from_interleaved_u8(height, width, 1, resized.to_luma8().as_raw())
        };
        if self.imagenet_normalize {
            tensor.normalize(IMAGENET_MEAN, IMAGENET_STD);
        }
        Ok(tensor)
    }
}

impl BatchSource for ImageFolderSource {
    fn next_batch(&mut self) -> Result<(Batch, Vec<usize>)> {
        let mut images = Vec::with_capacity(self.batch_size);
        let mut labels = Vec::with_capacity(self.batch_size);
        // Consecutive failures; a whole pass without a readable file is fatal
        let mut failures = 0;
        while images.len() < self.batch_size {
            if failures >= self.images.len() {
                return Err(CnnError::Dataset(
                    "no readable images in source".to_string(),
                ));
            }
            let (path, label) = self.images[self.cursor.next_index()].clone();
            match self.load(&path) {
                Ok(tensor) => {
                    images.push(tensor.with_label(path.display().to_string()));
                    labels.push(label);
                    failures = 0;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable image");
                    failures += 1;
                }
            }
        }
        Ok((images, labels))
    }

    fn len(&self) -> usize {
        self.images.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// root/a has `per_class` red images, root/b has `per_class` blue images
    fn write_dataset(root: &Path, per_class: usize) {
        for (category, color) in [("a", Rgb([255u8, 0, 0])), ("b", Rgb([0u8, 0, 255]))] {
            let dir = root.join(category);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                RgbImage::from_pixel(8, 6, color)
                    .save(dir.join(format!("{}.png", i)))
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_split_sizes_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 10);
        fs::write(dir.path().join("a").join("notes.txt"), "not an image").unwrap();

        let split =
            get_images_for_classification(dir.path(), &["a", "b"], (0.8, 0.1), DATASET_SEED)
                .unwrap();
        assert_eq!(split.train.len(), 16);
        assert_eq!(split.test.len(), 2);
        assert_eq!(split.valid.len(), 2);

        for (path, label) in split.train.iter().chain(&split.test).chain(&split.valid) {
            let folder = path.parent().unwrap().file_name().unwrap();
            assert_eq!(folder == "a", *label == 0);
        }
    }

    #[test]
    fn test_split_is_deterministic_per_seed() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 5);
        let a = get_images_for_classification(dir.path(), &["a", "b"], (0.6, 0.2), 1).unwrap();
        let b = get_images_for_classification(dir.path(), &["a", "b"], (0.6, 0.2), 1).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.valid, b.valid);
    }

    #[test]
    fn test_missing_category_is_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 1);
        let err = get_images_for_classification(dir.path(), &["a", "zebra"], (0.8, 0.1), 0)
            .unwrap_err();
        assert!(matches!(err, CnnError::Dataset(_)));
    }

    #[test]
    fn test_invalid_ratios_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(get_images_for_classification(dir.path(), &["a"], (0.8, 0.3), 0).is_err());
    }

    #[test]
    fn test_discover_categories_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 1);
        assert_eq!(discover_categories(dir.path()).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_in_memory_source_wraps_around() {
        let samples = (0..3)
            .map(|i| (Tensor3D::from_vec(1, 1, 1, vec![i as f64]), i))
            .collect();
        let mut source = InMemorySource::new(samples, 2, false, 0);
        assert_eq!(source.batches_per_epoch(), 1);

        let (_, first) = source.next_batch().unwrap();
        let (batch, second) = source.next_batch().unwrap();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(second, vec![2, 0]);
        assert_eq!(batch[1].data(), &[0.0]);
    }

    #[test]
    fn test_shuffled_source_visits_everything_each_pass() {
        let samples = (0..6).map(|i| (Tensor3D::vector(1), i)).collect();
        let mut source = InMemorySource::new(samples, 3, true, 9);
        let (_, mut a) = source.next_batch().unwrap();
        let (_, b) = source.next_batch().unwrap();
        a.extend(b);
        a.sort();
        assert_eq!(a, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_image_folder_source_decodes_planar_tensors() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 2);
        let split =
            get_images_for_classification(dir.path(), &["a", "b"], (0.5, 0.25), 3).unwrap();
        let mut all = split.train.clone();
        all.extend(split.test.clone());
        all.extend(split.valid.clone());

        let mut source = ImageFolderSource::new(all, 4, (3, 4, 5), false, 0);
        let (batch, labels) = source.next_batch().unwrap();
        assert_eq!(batch.len(), 4);
        for (tensor, label) in batch.iter().zip(&labels) {
            assert_eq!(tensor.shape(), (3, 4, 5));
            // Solid red images carry label 0, solid blue label 1
            let (red, blue) = (tensor.channel(0)[0], tensor.channel(2)[0]);
            if *label == 0 {
                assert!(red > 0.99 && blue < 0.01);
            } else {
                assert!(red < 0.01 && blue > 0.99);
            }
        }
    }

    #[test]
    fn test_unreadable_images_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 1);
        let broken = dir.path().join("a").join("broken.png");
        fs::write(&broken, b"definitely not a png").unwrap();

        let images = vec![(broken, 0), (dir.path().join("b").join("0.png"), 1)];
        let mut source = ImageFolderSource::new(images, 2, (1, 3, 3), false, 0);
        let (batch, labels) = source.next_batch().unwrap();
        assert_eq!(labels, vec![1, 1]);
        assert_eq!(batch[0].shape(), (1, 3, 3));
    }

    #[test]
    fn test_source_of_only_broken_files_errors() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.png");
        fs::write(&broken, b"nope").unwrap();
        let mut source = ImageFolderSource::new(vec![(broken, 0)], 1, (3, 2, 2), false, 0);
        assert!(matches!(source.next_batch(), Err(CnnError::Dataset(_))));
    }

    #[test]
    fn test_augmentor_keeps_images_valid() {
        let mut augmentor = Augmentor::with_ops(
            vec![
                (AugmentOp::HorizontalFlip, 1.0),
                (AugmentOp::VerticalFlip, 1.0),
                (AugmentOp::Crop, 1.0),
            ],
            4,
        );
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 10, Rgb([1, 2, 3])));
        let out = augmentor.apply(image);
        assert!(out.width() >= 14 && out.width() < 20);
        assert!(out.height() >= 7 && out.height() < 10);
    }

    #[test]
    fn test_rotation_keeps_size_and_fills_corners() {
        for seed in 0..8 {
            let mut augmentor = Augmentor::with_ops(vec![(AugmentOp::Rotate, 1.0)], seed);
            let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 10, Rgb([200, 100, 50])));
            let out = augmentor.apply(image).to_rgb8();
            assert_eq!(out.dimensions(), (20, 10));
            // Any angle of at least 15 degrees swings the corners out of the source
            assert_eq!(*out.get_pixel(0, 0), Rgb([0, 0, 0]));
            assert!(out.get_pixel(10, 5)[0] >= 199);
        }
    }

    #[test]
    fn test_grayscale_survives_rotation() {
        let mut augmentor = Augmentor::with_ops(vec![(AugmentOp::Rotate, 1.0)], 1);
        let image = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(6, 6, image::Luma([90])));
        let out = augmentor.apply(image);
        assert_eq!((out.width(), out.height()), (6, 6));
        assert_eq!(out.to_luma8().dimensions(), (6, 6));
    }
}
