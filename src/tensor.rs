//! Dense 3D Tensors
//!
//! This module provides the one data structure every layer reads and writes:
//! a channel-planar `C × H × W` block of `f64` values.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f64>` of exactly `C·H·W` elements, channel-major then row-major
//! - **Shape**: `(channels, height, width)`, fixed at construction
//! - **Batch**: A `Vec<Tensor3D>`, one tensor per sample, all sharing one shape
//!
//! Vectors (for example the output of a linear layer) are stored as
//! `length × 1 × 1` tensors.
//!
//! ## Memory Layout
//!
//! Element `(c, r, col)` lives at `c·H·W + r·W + col`. The buffer is never
//! resized after construction.
//!
//! ## Unchecked Zone
//!
//! Shape agreement between tensors is the caller's responsibility. Indexing
//! outside the buffer panics through ordinary slice bounds checks; nothing
//! here validates that two tensors passed to the same computation are
//! compatible beyond the explicit `assert!`s documented on each method.
//!
//! ## Example
//!
//! ```rust
//! use alexnet_scratch::Tensor3D;
//!
//! let t = Tensor3D::from_vec(1, 2, 2, vec![1.0, 2.0, 3.0, 4.0]);
//! let padded = t.pad(1);
//! assert_eq!(padded.shape(), (1, 4, 4));
//! assert_eq!(padded[(0, 1, 1)], 1.0);
//! assert_eq!(padded[(0, 0, 0)], 0.0);
//! ```

use rayon::prelude::*;
use std::fmt;
use std::ops::{Index, IndexMut};

/// `(channels, height, width)`
pub type Shape3 = (usize, usize, usize);

/// One tensor per sample
pub type Batch = Vec<Tensor3D>;

/// ImageNet channel means in RGB order
pub const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations in RGB order
pub const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

/// A dense `C × H × W` array of `f64`
///
/// Equality compares shape and data only; the debug label is ignored.
#[derive(Clone, Debug)]
pub struct Tensor3D {
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f64>,
    label: Option<String>,
}

impl Tensor3D {
    /// Create a zero-filled tensor
    ///
    /// # Panics
    ///
    /// Panics if any dimension is zero
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        assert!(
            channels > 0 && height > 0 && width > 0,
            "Tensor dimensions must be positive, got {}x{}x{}",
            channels,
            height,
            width
        );
        Self {
            channels,
            height,
            width,
            data: vec![0.0; channels * height * width],
            label: None,
        }
    }

    /// Create a zero-filled tensor of the given shape
    pub fn zeros(shape: Shape3) -> Self {
        Self::new(shape.0, shape.1, shape.2)
    }

    /// Create a `length × 1 × 1` vector tensor
    pub fn vector(length: usize) -> Self {
        Self::new(length, 1, 1)
    }

    /// Wrap existing data
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != channels * height * width` or any dimension is zero
    pub fn from_vec(channels: usize, height: usize, width: usize, data: Vec<f64>) -> Self {
        assert!(
            channels > 0 && height > 0 && width > 0,
            "Tensor dimensions must be positive, got {}x{}x{}",
            channels,
            height,
            width
        );
        assert_eq!(
            data.len(),
            channels * height * width,
            "Data length ({}) doesn't match shape {}x{}x{}",
            data.len(),
            channels,
            height,
            width
        );
        Self {
            channels,
            height,
            width,
            data,
            label: None,
        }
    }

    /// Build a tensor by evaluating `f(channel, row, col)` at every position
    pub fn from_fn(shape: Shape3, mut f: impl FnMut(usize, usize, usize) -> f64) -> Self {
        let (channels, height, width) = shape;
        let mut tensor = Self::new(channels, height, width);
        for c in 0..channels {
            for r in 0..height {
                for col in 0..width {
                    tensor[(c, r, col)] = f(c, r, col);
                }
            }
        }
        tensor
    }

    /// Attach a debug label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn shape(&self) -> Shape3 {
        (self.channels, self.height, self.width)
    }

    /// Total number of elements, `C·H·W`
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable view of the buffer (length is fixed)
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// One channel plane, `H·W` elements
    pub fn channel(&self, c: usize) -> &[f64] {
        let plane = self.height * self.width;
        &self.data[c * plane..(c + 1) * plane]
    }

    pub fn channel_mut(&mut self, c: usize) -> &mut [f64] {
        let plane = self.height * self.width;
        &mut self.data[c * plane..(c + 1) * plane]
    }

    /// Convert a flat index into `(channel, row, col)`
    pub fn position_of(&self, flat: usize) -> Shape3 {
        let plane = self.height * self.width;
        let c = flat / plane;
        let rem = flat % plane;
        (c, rem / self.width, rem % self.width)
    }

    /// Zero every element in place
    pub fn set_zero(&mut self) {
        self.data.fill(0.0);
    }

    /// Overwrite this tensor's data with `other`'s
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ
    pub fn copy_from(&mut self, other: &Tensor3D) {
        assert_eq!(self.shape(), other.shape(), "copy_from shape mismatch");
        self.data.copy_from_slice(&other.data);
    }

    /// Index of the largest element in flattened order (first one on ties)
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (i, &v) in self.data.iter().enumerate().skip(1) {
            if v > self.data[best] {
                best = i;
            }
        }
        best
    }

    /// Index of the smallest element in flattened order (first one on ties)
    pub fn argmin(&self) -> usize {
        let mut best = 0;
        for (i, &v) in self.data.iter().enumerate().skip(1) {
            if v < self.data[best] {
                best = i;
            }
        }
        best
    }

    pub fn max(&self) -> f64 {
        self.data[self.argmax()]
    }

    pub fn min(&self) -> f64 {
        self.data[self.argmin()]
    }

    /// `(channel, row, col)` of the largest element
    pub fn max_position(&self) -> Shape3 {
        self.position_of(self.argmax())
    }

    /// `(channel, row, col)` of the smallest element
    pub fn min_position(&self) -> Shape3 {
        self.position_of(self.argmin())
    }

    /// Divide every element by `divisor` in place
    pub fn div_scalar(&mut self, divisor: f64) {
        self.data.par_iter_mut().for_each(|x| *x /= divisor);
    }

    /// Per-channel `(x - mean) / std`, in place
    ///
    /// Only defined for 3-channel tensors; any other channel count leaves
    /// the tensor untouched.
    pub fn normalize(&mut self, mean: [f64; 3], std: [f64; 3]) {
        if self.channels != 3 {
            return;
        }
        for c in 0..3 {
            let (m, s) = (mean[c], std[c]);
            self.channel_mut(c).iter_mut().for_each(|x| *x = (*x - m) / s);
        }
    }

    /// Build a channel-planar tensor from an interleaved 8-bit image
    ///
    /// Pixels are scaled into `[0, 1]`. `pixels` is `height × width × channels`
    /// in row-major order, as produced by most image decoders.
    ///
    /// # Panics
    ///
    /// Panics unless `channels` is 1 or 3 and the buffer length matches
    pub fn from_interleaved_u8(height: usize, width: usize, channels: usize, pixels: &[u8]) -> Self {
        assert!(
            channels == 1 || channels == 3,
            "Only 1- or 3-channel images are supported, got {}",
            channels
        );
        assert_eq!(
            pixels.len(),
            height * width * channels,
            "Pixel buffer length doesn't match {}x{}x{}",
            height,
            width,
            channels
        );
        let mut tensor = Self::new(channels, height, width);
        let plane = height * width;
        for i in 0..plane {
            for c in 0..channels {
                tensor.data[c * plane + i] = pixels[i * channels + c] as f64 / 255.0;
            }
        }
        tensor
    }

    /// Convert back to an interleaved 8-bit image, saturating to `[0, 255]`
    ///
    /// # Panics
    ///
    /// Panics unless the tensor has 1 or 3 channels
    pub fn to_interleaved_u8(&self) -> Vec<u8> {
        assert!(
            self.channels == 1 || self.channels == 3,
            "Only 1- or 3-channel tensors convert to images, got {}",
            self.channels
        );
        let plane = self.height * self.width;
        let mut pixels = vec![0u8; plane * self.channels];
        for i in 0..plane {
            for c in 0..self.channels {
                let v = (255.0 * self.data[c * plane + i]).round();
                pixels[i * self.channels + c] = v.clamp(0.0, 255.0) as u8;
            }
        }
        pixels
    }

    /// Rotate every channel by 180°
    ///
    /// Each channel's elements are reversed in flattened order, which is
    /// the same as reversing rows and columns together.
    pub fn rot180(&self) -> Tensor3D {
        let mut out = Self::new(self.channels, self.height, self.width);
        for c in 0..self.channels {
            let src = self.channel(c);
            out.channel_mut(c)
                .iter_mut()
                .zip(src.iter().rev())
                .for_each(|(dst, &v)| *dst = v);
        }
        out.label = self.label.as_ref().map(|l| format!("{}_rot180", l));
        out
    }

    /// Surround every channel with a `padding`-wide border of zeros
    pub fn pad(&self, padding: usize) -> Tensor3D {
        let new_h = self.height + 2 * padding;
        let new_w = self.width + 2 * padding;
        let mut out = Self::new(self.channels, new_h, new_w);
        for c in 0..self.channels {
            let src = self.channel(c);
            let dst = out.channel_mut(c);
            for r in 0..self.height {
                let start = (r + padding) * new_w + padding;
                dst[start..start + self.width]
                    .copy_from_slice(&src[r * self.width..(r + 1) * self.width]);
            }
        }
        out.label = self.label.as_ref().map(|l| format!("{}_pad", l));
        out
    }

    /// Copy out the `height × width` window whose top-left corner is `(top, left)`
    pub fn crop(&self, top: usize, left: usize, height: usize, width: usize) -> Tensor3D {
        assert!(
            top + height <= self.height && left + width <= self.width,
            "Crop window exceeds tensor bounds"
        );
        let mut out = Self::new(self.channels, height, width);
        for c in 0..self.channels {
            let src = self.channel(c);
            let dst = out.channel_mut(c);
            for r in 0..height {
                let from = (top + r) * self.width + left;
                dst[r * width..(r + 1) * width].copy_from_slice(&src[from..from + width]);
            }
        }
        out
    }
}

impl PartialEq for Tensor3D {
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape() && self.data == other.data
    }
}

impl Index<Shape3> for Tensor3D {
    type Output = f64;

    fn index(&self, (c, r, col): Shape3) -> &f64 {
        &self.data[(c * self.height + r) * self.width + col]
    }
}

impl IndexMut<Shape3> for Tensor3D {
    fn index_mut(&mut self, (c, r, col): Shape3) -> &mut f64 {
        &mut self.data[(c * self.height + r) * self.width + col]
    }
}

impl fmt::Display for Tensor3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  ==>  {} x {} x {}",
            self.label.as_deref().unwrap_or("tensor"),
            self.channels,
            self.height,
            self.width
        )
    }
}
