//! Compute kernels.
//!
//! A [`Kernel`] is one unit of work over arena buffers. Every kernel writes exactly
//! one buffer and reads up to three others; [`Kernel::reads`] and [`Kernel::write`]
//! are what the task graph uses to order jobs.
//!
//! Inside a kernel the per-neuron work is split into contiguous lanes across the
//! worker pool; the reduction over inputs inside one lane stays sequential.

use rayon::prelude::*;

use crate::activation::Activation;
use crate::arena::{Arena, BufferId};
use crate::error::{Error, Result, check_len};
use crate::matmul::matvec_f32;

#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    /// `dst[n] = src[n]`.
    Copy { src: BufferId, dst: BufferId },
    /// `dst[n] = mean[n] + stddev * noise[n]`.
    SampleBias {
        mean: BufferId,
        noise: BufferId,
        stddev: f32,
        dst: BufferId,
    },
    /// `output[n] += sum_m input[m] * weights[n * M + m]`.
    DotAccumulate {
        input: BufferId,
        weights: BufferId,
        output: BufferId,
    },
    /// `buffer[n] = activation(buffer[n])`.
    Activate {
        buffer: BufferId,
        activation: Activation,
    },
    /// `delta[n] = (outputs[n] - target[n]) * f'(outputs[n])`.
    OutputDelta {
        outputs: BufferId,
        target: BufferId,
        activation: Activation,
        delta: BufferId,
    },
    /// `delta[n] = (sum_k next_delta[k] * next_weights[k * L + n]) * f'(outputs[n])`.
    BackpropDelta {
        next_delta: BufferId,
        next_weights: BufferId,
        outputs: BufferId,
        activation: Activation,
        delta: BufferId,
    },
    /// `gradient[n * M + m] = delta[n] * input[m]`.
    WeightGradient {
        delta: BufferId,
        input: BufferId,
        gradient: BufferId,
    },
    /// `buffer[n] = 0`.
    Zero { buffer: BufferId },
    /// `dst[n] += src[n]`.
    Accumulate { src: BufferId, dst: BufferId },
    /// `params[n] -= grads[n] * rate`.
    Descend {
        params: BufferId,
        grads: BufferId,
        rate: f32,
    },
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Copy { .. } => "copy",
            Kernel::SampleBias { .. } => "sample_bias",
            Kernel::DotAccumulate { .. } => "dot_accumulate",
            Kernel::Activate { .. } => "activate",
            Kernel::OutputDelta { .. } => "output_delta",
            Kernel::BackpropDelta { .. } => "backprop_delta",
            Kernel::WeightGradient { .. } => "weight_gradient",
            Kernel::Zero { .. } => "zero",
            Kernel::Accumulate { .. } => "accumulate",
            Kernel::Descend { .. } => "descend",
        }
    }

    /// The single buffer this kernel mutates.
    pub fn write(&self) -> BufferId {
        match *self {
            Kernel::Copy { dst, .. } => dst,
            Kernel::SampleBias { dst, .. } => dst,
            Kernel::DotAccumulate { output, .. } => output,
            Kernel::Activate { buffer, .. } => buffer,
            Kernel::OutputDelta { delta, .. } => delta,
            Kernel::BackpropDelta { delta, .. } => delta,
            Kernel::WeightGradient { gradient, .. } => gradient,
            Kernel::Zero { buffer } => buffer,
            Kernel::Accumulate { dst, .. } => dst,
            Kernel::Descend { params, .. } => params,
        }
    }

    /// Buffers read but not written.
    pub fn reads(&self) -> impl Iterator<Item = BufferId> {
        let reads = match *self {
            Kernel::Copy { src, .. } => [Some(src), None, None],
            Kernel::SampleBias { mean, noise, .. } => [Some(mean), Some(noise), None],
            Kernel::DotAccumulate { input, weights, .. } => [Some(input), Some(weights), None],
            Kernel::Activate { .. } | Kernel::Zero { .. } => [None, None, None],
            Kernel::OutputDelta {
                outputs, target, ..
            } => [Some(outputs), Some(target), None],
            Kernel::BackpropDelta {
                next_delta,
                next_weights,
                outputs,
                ..
            } => [Some(next_delta), Some(next_weights), Some(outputs)],
            Kernel::WeightGradient { delta, input, .. } => [Some(delta), Some(input), None],
            Kernel::Accumulate { src, .. } => [Some(src), None, None],
            Kernel::Descend { grads, .. } => [Some(grads), None, None],
        };
        reads.into_iter().flatten()
    }

    /// Checks buffer shapes and aliasing against `arena`.
    ///
    /// A kernel that passes validation cannot fail when it runs.
    pub fn validate(&self, arena: &Arena) -> Result<()> {
        let write = self.write();
        for id in self.reads().chain(std::iter::once(write)) {
            if !arena.contains(id) {
                return Err(Error::InvalidConfig(format!(
                    "{} kernel references buffer {} outside this arena",
                    self.name(),
                    id.index()
                )));
            }
        }
        if self.reads().any(|r| r == write) {
            return Err(Error::AliasedBuffers { what: self.name() });
        }

        let len = |id| arena.len(id);
        match *self {
            Kernel::Copy { src, dst } => check_len("copy source", len(dst), len(src)),
            Kernel::SampleBias {
                mean,
                noise,
                stddev,
                dst,
            } => {
                if !(stddev.is_finite() && stddev >= 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "bias stddev must be finite and >= 0, got {stddev}"
                    )));
                }
                check_len("bias mean", len(dst), len(mean))?;
                check_len("bias noise", len(dst), len(noise))
            }
            Kernel::DotAccumulate {
                input,
                weights,
                output,
            } => check_len("layer weights", len(output) * len(input), len(weights)),
            Kernel::Activate { .. } | Kernel::Zero { .. } => Ok(()),
            Kernel::OutputDelta {
                outputs,
                target,
                delta,
                ..
            } => {
                check_len("target", len(outputs), len(target))?;
                check_len("output delta", len(outputs), len(delta))
            }
            Kernel::BackpropDelta {
                next_delta,
                next_weights,
                outputs,
                delta,
                ..
            } => {
                check_len("hidden delta", len(outputs), len(delta))?;
                check_len(
                    "next layer weights",
                    len(next_delta) * len(delta),
                    len(next_weights),
                )
            }
            Kernel::WeightGradient {
                delta,
                input,
                gradient,
            } => check_len("weight gradient", len(delta) * len(input), len(gradient)),
            Kernel::Accumulate { src, dst } => check_len("accumulate source", len(dst), len(src)),
            Kernel::Descend {
                params,
                grads,
                rate,
            } => {
                if !rate.is_finite() {
                    return Err(Error::InvalidConfig(format!(
                        "update rate must be finite, got {rate}"
                    )));
                }
                check_len("parameter gradient", len(params), len(grads))
            }
        }
    }

    /// Runs the kernel. The caller guarantees no concurrent job writes any buffer
    /// this kernel touches, and that [`Kernel::validate`] succeeded.
    pub fn run(&self, arena: &Arena) {
        match *self {
            Kernel::Copy { src, dst } => {
                let src = arena.read(src);
                let mut dst = arena.write(dst);
                let lane = lane_len(dst.len());
                dst.par_chunks_mut(lane)
                    .zip(src.par_chunks(lane))
                    .for_each(|(d, s)| d.copy_from_slice(s));
            }
            Kernel::SampleBias {
                mean,
                noise,
                stddev,
                dst,
            } => {
                let mean = arena.read(mean);
                let noise = arena.read(noise);
                let mut dst = arena.write(dst);
                let lane = lane_len(dst.len());
                dst.par_chunks_mut(lane)
                    .zip(mean.par_chunks(lane).zip(noise.par_chunks(lane)))
                    .for_each(|(d, (m, e))| {
                        for ((d, &m), &e) in d.iter_mut().zip(m).zip(e) {
                            *d = m + stddev * e;
                        }
                    });
            }
            Kernel::DotAccumulate {
                input,
                weights,
                output,
            } => {
                let x = arena.read(input);
                let w = arena.read(weights);
                let mut out = arena.write(output);
                let m = x.len();
                if m == 0 || out.is_empty() {
                    return;
                }
                let lane = lane_len(out.len());
                out.par_chunks_mut(lane).enumerate().for_each(|(i, chunk)| {
                    let row0 = i * lane;
                    let rows = chunk.len();
                    let w_rows = &w[row0 * m..(row0 + rows) * m];
                    matvec_f32(rows, m, w_rows, m, 1, &x, 1.0, chunk);
                });
            }
            Kernel::Activate { buffer, activation } => {
                let mut buf = arena.write(buffer);
                let lane = lane_len(buf.len());
                buf.par_chunks_mut(lane).for_each(|chunk| {
                    for v in chunk {
                        *v = activation.forward(*v);
                    }
                });
            }
            Kernel::OutputDelta {
                outputs,
                target,
                activation,
                delta,
            } => {
                let o = arena.read(outputs);
                let t = arena.read(target);
                let mut d = arena.write(delta);
                let lane = lane_len(d.len());
                d.par_chunks_mut(lane)
                    .zip(o.par_chunks(lane).zip(t.par_chunks(lane)))
                    .for_each(|(d, (o, t))| {
                        for ((d, &o), &t) in d.iter_mut().zip(o).zip(t) {
                            *d = (o - t) * activation.grad_from_output(o);
                        }
                    });
            }
            Kernel::BackpropDelta {
                next_delta,
                next_weights,
                outputs,
                activation,
                delta,
            } => {
                let nd = arena.read(next_delta);
                let w = arena.read(next_weights);
                let o = arena.read(outputs);
                let mut d = arena.write(delta);
                let width = d.len();
                let k = nd.len();
                if width == 0 {
                    return;
                }
                let lane = lane_len(width);
                d.par_chunks_mut(lane).enumerate().for_each(|(i, chunk)| {
                    let n0 = i * lane;
                    chunk.fill(0.0);
                    if k > 0 {
                        // Column n of W is row n of W^T: unit row stride, column stride = width.
                        matvec_f32(chunk.len(), k, &w[n0..], 1, width, &nd, 0.0, chunk);
                    }
                    for (j, v) in chunk.iter_mut().enumerate() {
                        *v *= activation.grad_from_output(o[n0 + j]);
                    }
                });
            }
            Kernel::WeightGradient {
                delta,
                input,
                gradient,
            } => {
                let d = arena.read(delta);
                let x = arena.read(input);
                let mut g = arena.write(gradient);
                let m = x.len();
                if m == 0 || d.is_empty() {
                    return;
                }
                let lane = lane_len(d.len());
                g.par_chunks_mut(lane * m)
                    .zip(d.par_chunks(lane))
                    .for_each(|(rows, deltas)| {
                        for (row, &dn) in rows.chunks_exact_mut(m).zip(deltas) {
                            for (g, &xm) in row.iter_mut().zip(x.iter()) {
                                *g = dn * xm;
                            }
                        }
                    });
            }
            Kernel::Zero { buffer } => {
                let mut buf = arena.write(buffer);
                let lane = lane_len(buf.len());
                buf.par_chunks_mut(lane).for_each(|c| c.fill(0.0));
            }
            Kernel::Accumulate { src, dst } => {
                let src = arena.read(src);
                let mut dst = arena.write(dst);
                let lane = lane_len(dst.len());
                dst.par_chunks_mut(lane)
                    .zip(src.par_chunks(lane))
                    .for_each(|(d, s)| {
                        for (d, &s) in d.iter_mut().zip(s) {
                            *d += s;
                        }
                    });
            }
            Kernel::Descend {
                params,
                grads,
                rate,
            } => {
                let g = arena.read(grads);
                let mut p = arena.write(params);
                let lane = lane_len(p.len());
                p.par_chunks_mut(lane)
                    .zip(g.par_chunks(lane))
                    .for_each(|(p, g)| {
                        for (p, &g) in p.iter_mut().zip(g) {
                            *p -= g * rate;
                        }
                    });
            }
        }
    }
}

/// Elements per parallel lane: one contiguous lane per worker thread.
#[inline]
fn lane_len(n: usize) -> usize {
    n.div_ceil(rayon::current_num_threads()).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(arena: &Arena, kernel: Kernel) {
        kernel.validate(arena).unwrap();
        kernel.run(arena);
    }

    #[test]
    fn dot_accumulate_adds_onto_existing_outputs() {
        let mut arena = Arena::new();
        let input = arena.alloc_from(vec![1.0, 2.0]);
        let weights = arena.alloc_from(vec![1.0, 1.0, 0.5, -1.0, 0.0, 3.0]);
        let output = arena.alloc_from(vec![10.0, 20.0, 30.0]);

        run(
            &arena,
            Kernel::DotAccumulate {
                input,
                weights,
                output,
            },
        );
        assert_eq!(&*arena.read(output), &[13.0, 18.5, 36.0]);
    }

    #[test]
    fn backprop_delta_uses_transposed_weights() {
        let mut arena = Arena::new();
        // Next layer: 2 neurons over 3 inputs.
        let next_weights = arena.alloc_from(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let next_delta = arena.alloc_from(vec![1.0, -1.0]);
        let outputs = arena.alloc_from(vec![0.5, 0.5, 0.5]);
        let delta = arena.alloc(3);

        run(
            &arena,
            Kernel::BackpropDelta {
                next_delta,
                next_weights,
                outputs,
                activation: Activation::Sigmoid,
                delta,
            },
        );
        // W^T d = [-3, -3, -3], times s(1-s) = 0.25.
        assert_eq!(&*arena.read(delta), &[-0.75, -0.75, -0.75]);
    }

    #[test]
    fn weight_gradient_is_outer_product() {
        let mut arena = Arena::new();
        let delta = arena.alloc_from(vec![2.0, -1.0]);
        let input = arena.alloc_from(vec![1.0, 0.5, 4.0]);
        let gradient = arena.alloc(6);

        run(
            &arena,
            Kernel::WeightGradient {
                delta,
                input,
                gradient,
            },
        );
        assert_eq!(
            &*arena.read(gradient),
            &[2.0, 1.0, 8.0, -1.0, -0.5, -4.0]
        );
    }

    #[test]
    fn descend_applies_exact_update() {
        let mut arena = Arena::new();
        let params = arena.alloc_from(vec![1.0, 2.0, 3.0]);
        let grads = arena.alloc_from(vec![0.3, -0.7, 0.1]);
        let rate = 0.05_f32;

        run(
            &arena,
            Kernel::Descend {
                params,
                grads,
                rate,
            },
        );
        let expected: Vec<f32> = [1.0_f32, 2.0, 3.0]
            .iter()
            .zip([0.3_f32, -0.7, 0.1])
            .map(|(&p, g)| p - g * rate)
            .collect();
        assert_eq!(&*arena.read(params), expected.as_slice());
    }

    #[test]
    fn validate_rejects_bad_shapes_and_aliases() {
        let mut arena = Arena::new();
        let a = arena.alloc(3);
        let b = arena.alloc(4);

        let err = Kernel::Copy { src: a, dst: b }.validate(&arena).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));

        let err = Kernel::Accumulate { src: a, dst: a }
            .validate(&arena)
            .unwrap_err();
        assert!(matches!(err, Error::AliasedBuffers { .. }));

        let err = Kernel::DotAccumulate {
            input: a,
            weights: b,
            output: a,
        }
        .validate(&arena)
        .unwrap_err();
        assert!(matches!(err, Error::AliasedBuffers { .. }));
    }

    #[test]
    fn validate_rejects_buffers_of_another_arena() {
        let mut arena = Arena::new();
        let mut other = Arena::new();
        let a = arena.alloc(2);
        let foreign = other.alloc(2);

        let err = Kernel::Copy { src: foreign, dst: a }
            .validate(&arena)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
        assert!(Kernel::Zero { buffer: foreign }.validate(&arena).is_err());
        assert!(Kernel::Zero { buffer: foreign }.validate(&other).is_ok());
    }

    #[test]
    fn read_and_write_sets() {
        let mut arena = Arena::new();
        let a = arena.alloc(1);
        let b = arena.alloc(1);
        let k = Kernel::Accumulate { src: a, dst: b };
        assert_eq!(k.write(), b);
        assert_eq!(k.reads().collect::<Vec<_>>(), vec![a]);
        assert_eq!(Kernel::Zero { buffer: a }.reads().count(), 0);
    }
}
