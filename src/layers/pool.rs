//! 2D Max Pooling
//!
//! Each channel is pooled independently with a square window.
//!
//! ## Forward Pass
//!
//! ```text
//! out_size = (in_size - kernel) / step + 1
//! y[c][x][y] = max over i, j < kernel of  x[c][x*step + i][y*step + j]
//! ```
//!
//! On ties the first maximum in raster order within the window wins. In
//! training mode the in-plane offset of every selected element is kept in a
//! mask.
//!
//! ## Backward Pass
//!
//! Pooling routes gradient instead of smoothing it: each output gradient is
//! added to the single input position recorded in the mask, and every other
//! input position gets zero. Overlapping windows that pick the same input
//! sum their contributions.

use super::{resize_batch, shape_mismatch, Layer, LayerState};
use crate::error::Result;
use crate::mode::Mode;
use crate::tensor::{Shape3, Tensor3D};
use rayon::prelude::*;

pub struct MaxPool2D {
    name: String,
    pub kernel_size: usize,
    pub step: usize,
    state: LayerState,
    output: Vec<Tensor3D>,
    /// Per sample, per output cell: in-plane offset `row * W + col` of the max
    mask: Vec<Vec<usize>>,
    input_grad: Vec<Tensor3D>,
}

impl MaxPool2D {
    /// Create a max pooling layer
    ///
    /// # Arguments
    ///
    /// * `kernel_size` - Window side length
    /// * `step` - Stride between windows
    pub fn new(name: impl Into<String>, kernel_size: usize, step: usize) -> Self {
        assert!(kernel_size > 0, "Pooling kernel size must be positive");
        assert!(step > 0, "Pooling step must be positive");
        Self {
            name: name.into(),
            kernel_size,
            step,
            state: LayerState::default(),
            output: Vec::new(),
            mask: Vec::new(),
            input_grad: Vec::new(),
        }
    }
}

fn pooled_shape(
    layer: &str,
    (c, h, w): Shape3,
    kernel_size: usize,
    step: usize,
) -> Result<Shape3> {
    if h < kernel_size || w < kernel_size {
        return Err(shape_mismatch(
            layer,
            (c, h.max(kernel_size), w.max(kernel_size)),
            (c, h, w),
        ));
    }
    Ok((c, (h - kernel_size) / step + 1, (w - kernel_size) / step + 1))
}

impl Layer for MaxPool2D {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &[Tensor3D], mode: Mode) -> Result<&[Tensor3D]> {
        let (k, step) = (self.kernel_size, self.step);
        let name = &self.name;
        let built = self
            .state
            .begin_forward(name, input, mode, |s| pooled_shape(name, s, k, step))?;
        let (channels, out_h, out_w) = built.output;
        let in_w = built.input.2;

        // Writes the pooled sample and, when given, the selected offsets
        let pool_sample = |x: &Tensor3D, out: &mut Tensor3D, mut mask: Option<&mut Vec<usize>>| {
            for c in 0..channels {
                let plane = x.channel(c);
                for ox in 0..out_h {
                    for oy in 0..out_w {
                        let mut best = (ox * step) * in_w + oy * step;
                        for i in 0..k {
                            for j in 0..k {
                                let offset = (ox * step + i) * in_w + (oy * step + j);
                                if plane[offset] > plane[best] {
                                    best = offset;
                                }
                            }
                        }
                        out[(c, ox, oy)] = plane[best];
                        if let Some(mask) = mask.as_deref_mut() {
                            mask.push(best);
                        }
                    }
                }
            }
        };

        resize_batch(&mut self.output, input.len(), built.output);
        if mode.is_training() {
            self.mask.resize_with(input.len(), Vec::new);
            self.output
                .par_iter_mut()
                .zip(input.par_iter())
                .zip(self.mask.par_iter_mut())
                .for_each(|((out, x), mask)| {
                    mask.clear();
                    pool_sample(x, out, Some(mask));
                });
        } else {
            self.output
                .par_iter_mut()
                .zip(input.par_iter())
                .for_each(|(out, x)| pool_sample(x, out, None));
        }

        Ok(&self.output)
    }

    fn backward<'a>(&'a mut self, delta: &'a mut [Tensor3D]) -> Result<&'a mut [Tensor3D]> {
        let built = self.state.begin_backward(&self.name, delta)?;
        let (channels, out_h, out_w) = built.output;

        resize_batch(&mut self.input_grad, delta.len(), built.input);
        self.input_grad
            .par_iter_mut()
            .zip(delta.par_iter())
            .zip(self.mask.par_iter())
            .for_each(|((grad, d), mask)| {
                grad.set_zero();
                for c in 0..channels {
                    let cell_base = c * out_h * out_w;
                    let dplane = d.channel(c);
                    let gplane = grad.channel_mut(c);
                    for (cell, &g) in dplane.iter().enumerate() {
                        gplane[mask[cell_base + cell]] += g;
                    }
                }
            });

        Ok(&mut self.input_grad)
    }

    fn output(&self) -> &[Tensor3D] {
        &self.output
    }
}
