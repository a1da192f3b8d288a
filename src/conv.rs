//! 2D convolution layer over square inputs.
//!
//! Layouts, all row-major:
//! - input:   `[depth][y][x]`, `in_width x in_width` per slice
//! - weights: `[filter][depth][ky][kx]`
//! - output:  `[filter][y][x]`, `out_width x out_width` per filter
//!
//! Activation is ReLU. Work is split by filter (forward and parameter gradients)
//! or by input slice (input gradient) across the rayon pool.

use rand::Rng;
use rayon::prelude::*;

use crate::error::{Error, Result, check_len};
use crate::math;

/// `floor((in_width - kernel + 2 * padding) / stride) + 1`, or `None` when the
/// geometry is ill-defined: even or zero kernel, zero stride, kernel wider than the
/// padded input, or a stride that does not tile the input exactly.
pub fn output_width(in_width: usize, kernel: usize, padding: usize, stride: usize) -> Option<usize> {
    if kernel % 2 == 0 || stride == 0 {
        return None;
    }
    let span = in_width
        .checked_add(padding.checked_mul(2)?)?
        .checked_sub(kernel)?;
    if span % stride != 0 {
        return None;
    }
    Some(span / stride + 1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvLayer {
    filters: usize,
    depth: usize,
    in_width: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    out_width: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

/// Gradients of one [`ConvLayer`] for one example (overwrite semantics).
#[derive(Debug, Clone, PartialEq)]
pub struct ConvGradients {
    /// `[filter][y][x]`, same shape as the output.
    pub dcdz: Vec<f32>,
    /// Same shape as the weights.
    pub dcdw: Vec<f32>,
    /// One entry per filter.
    pub dcdb: Vec<f32>,
}

impl ConvLayer {
    /// Random initialisation: weights `~ N(0, 1) / sqrt(depth * kernel^2)`, zero biases.
    pub fn new<R: Rng + ?Sized>(
        filters: usize,
        depth: usize,
        in_width: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let fan_in = depth * kernel * kernel;
        let scale = 1.0 / (fan_in.max(1) as f32).sqrt();
        let weights = (0..filters * fan_in)
            .map(|_| math::gaussian(rng, 0.0, scale))
            .collect();
        Self::from_parts(
            filters,
            depth,
            in_width,
            kernel,
            stride,
            padding,
            weights,
            vec![0.0; filters],
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        filters: usize,
        depth: usize,
        in_width: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self> {
        if filters == 0 || depth == 0 || in_width == 0 {
            return Err(Error::InvalidConfig(format!(
                "conv dims must be > 0, got filters={filters} depth={depth} in_width={in_width}"
            )));
        }
        let out_width = output_width(in_width, kernel, padding, stride).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "ill-defined conv geometry: in_width={in_width} kernel={kernel} \
                 padding={padding} stride={stride}"
            ))
        })?;
        check_len("conv weights", filters * depth * kernel * kernel, weights.len())?;
        check_len("conv biases", filters, biases.len())?;
        Ok(Self {
            filters,
            depth,
            in_width,
            kernel,
            stride,
            padding,
            out_width,
            weights,
            biases,
        })
    }

    #[inline]
    pub fn filters(&self) -> usize {
        self.filters
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn in_width(&self) -> usize {
        self.in_width
    }

    #[inline]
    pub fn out_width(&self) -> usize {
        self.out_width
    }

    #[inline]
    pub fn kernel(&self) -> usize {
        self.kernel
    }

    #[inline]
    pub fn input_len(&self) -> usize {
        self.depth * self.in_width * self.in_width
    }

    #[inline]
    pub fn output_len(&self) -> usize {
        self.filters * self.out_width * self.out_width
    }

    #[inline]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    #[inline]
    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    /// Zeroed gradient buffers shaped for this layer.
    pub fn gradients(&self) -> ConvGradients {
        ConvGradients {
            dcdz: vec![0.0; self.output_len()],
            dcdw: vec![0.0; self.weights.len()],
            dcdb: vec![0.0; self.filters],
        }
    }

    /// Input coordinate under kernel tap `k` of output coordinate `o`, if inside.
    #[inline]
    fn source(&self, o: usize, k: usize) -> Option<usize> {
        (o * self.stride + k)
            .checked_sub(self.padding)
            .filter(|&i| i < self.in_width)
    }

    #[inline]
    fn weight_index(&self, f: usize, d: usize, ky: usize, kx: usize) -> usize {
        ((f * self.depth + d) * self.kernel + ky) * self.kernel + kx
    }

    #[inline]
    fn input_index(&self, d: usize, y: usize, x: usize) -> usize {
        (d * self.in_width + y) * self.in_width + x
    }

    pub fn forward(&self, input: &[f32], output: &mut [f32]) -> Result<()> {
        check_len("conv input", self.input_len(), input.len())?;
        check_len("conv output", self.output_len(), output.len())?;

        let ow = self.out_width;
        output
            .par_chunks_mut(ow * ow)
            .enumerate()
            .for_each(|(f, plane)| {
                for oy in 0..ow {
                    for ox in 0..ow {
                        let mut z = self.biases[f];
                        for d in 0..self.depth {
                            for ky in 0..self.kernel {
                                let Some(iy) = self.source(oy, ky) else {
                                    continue;
                                };
                                for kx in 0..self.kernel {
                                    let Some(ix) = self.source(ox, kx) else {
                                        continue;
                                    };
                                    z += input[self.input_index(d, iy, ix)]
                                        * self.weights[self.weight_index(f, d, ky, kx)];
                                }
                            }
                        }
                        plane[oy * ow + ox] = math::relu(z);
                    }
                }
            });
        Ok(())
    }

    /// Given `d_output = dC/d(output)`, fills `grads` and `d_input = dC/d(input)`.
    ///
    /// `output` must be the result of [`ConvLayer::forward`] on `input`.
    pub fn backward(
        &self,
        input: &[f32],
        output: &[f32],
        d_output: &[f32],
        grads: &mut ConvGradients,
        d_input: &mut [f32],
    ) -> Result<()> {
        check_len("conv input", self.input_len(), input.len())?;
        check_len("conv output", self.output_len(), output.len())?;
        check_len("conv output gradient", self.output_len(), d_output.len())?;
        check_len("conv dcdz", self.output_len(), grads.dcdz.len())?;
        check_len("conv dcdw", self.weights.len(), grads.dcdw.len())?;
        check_len("conv dcdb", self.filters, grads.dcdb.len())?;
        check_len("conv input gradient", self.input_len(), d_input.len())?;

        let ow = self.out_width;
        let plane = ow * ow;
        let taps = self.depth * self.kernel * self.kernel;

        grads
            .dcdz
            .par_chunks_mut(plane)
            .zip(grads.dcdw.par_chunks_mut(taps))
            .zip(grads.dcdb.par_iter_mut())
            .enumerate()
            .for_each(|(f, ((dz, dw), db))| {
                let out = &output[f * plane..(f + 1) * plane];
                let dout = &d_output[f * plane..(f + 1) * plane];
                for ((z, &o), &g) in dz.iter_mut().zip(out).zip(dout) {
                    *z = g * math::relu_prime(o);
                }
                *db = dz.iter().sum();

                dw.fill(0.0);
                for oy in 0..ow {
                    for ox in 0..ow {
                        let delta = dz[oy * ow + ox];
                        if delta == 0.0 {
                            continue;
                        }
                        for d in 0..self.depth {
                            for ky in 0..self.kernel {
                                let Some(iy) = self.source(oy, ky) else {
                                    continue;
                                };
                                for kx in 0..self.kernel {
                                    let Some(ix) = self.source(ox, kx) else {
                                        continue;
                                    };
                                    dw[(d * self.kernel + ky) * self.kernel + kx] +=
                                        delta * input[self.input_index(d, iy, ix)];
                                }
                            }
                        }
                    }
                }
            });

        let dcdz = &grads.dcdz;
        let iw = self.in_width;
        d_input
            .par_chunks_mut(iw * iw)
            .enumerate()
            .for_each(|(d, slice)| {
                slice.fill(0.0);
                for f in 0..self.filters {
                    for oy in 0..ow {
                        for ox in 0..ow {
                            let delta = dcdz[f * plane + oy * ow + ox];
                            if delta == 0.0 {
                                continue;
                            }
                            for ky in 0..self.kernel {
                                let Some(iy) = self.source(oy, ky) else {
                                    continue;
                                };
                                for kx in 0..self.kernel {
                                    let Some(ix) = self.source(ox, kx) else {
                                        continue;
                                    };
                                    slice[iy * iw + ix] +=
                                        delta * self.weights[self.weight_index(f, d, ky, kx)];
                                }
                            }
                        }
                    }
                }
            });
        Ok(())
    }

    /// `param -= grad * rate` for weights and biases.
    pub fn descend(&mut self, grads: &ConvGradients, rate: f32) -> Result<()> {
        check_len("conv dcdw", self.weights.len(), grads.dcdw.len())?;
        check_len("conv dcdb", self.filters, grads.dcdb.len())?;
        for (p, &g) in self.weights.iter_mut().zip(&grads.dcdw) {
            *p -= g * rate;
        }
        for (p, &g) in self.biases.iter_mut().zip(&grads.dcdb) {
            *p -= g * rate;
        }
        Ok(())
    }
}
