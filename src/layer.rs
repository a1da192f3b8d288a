//! Fully-connected layers and their gradient mirrors.
//!
//! A layer with `N` neurons over `M` inputs owns three arena buffers:
//! - `biases`: `N` values
//! - `weights`: `N * M` values, row-major by neuron: weight `(n, m)` lives at `n * M + m`
//! - `outputs`: `N` post-activation values, rewritten by every forward pass
//!
//! A [`GradientLayer`] has the same shape and holds `dC/dz` (`N` values) and
//! `dC/dW` (`N * M` values, same addressing as `weights`).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::arena::{Arena, BufferId};
use crate::error::{Error, Result};

/// How a layer produces the bias term of `z = b + W x`.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LayerKind {
    /// The bias buffer is used as is.
    #[default]
    Deterministic,
    /// Each forward pass draws `b ~ N(mean, stddev^2)` per neuron, where the bias
    /// buffer holds the (trained) means.
    Stochastic { stddev: f32 },
}

impl LayerKind {
    pub fn validate(self) -> Result<()> {
        match self {
            LayerKind::Deterministic => Ok(()),
            LayerKind::Stochastic { stddev } => {
                if !(stddev.is_finite() && stddev >= 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "stochastic bias stddev must be finite and >= 0, got {stddev}"
                    )));
                }
                Ok(())
            }
        }
    }

    #[inline]
    pub fn is_stochastic(self) -> bool {
        matches!(self, LayerKind::Stochastic { .. })
    }
}

/// Per-layer settings other than the size.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LayerSpec {
    pub activation: Activation,
    pub kind: LayerKind,
}

#[derive(Debug, Clone)]
pub struct Layer {
    neurons: usize,
    inputs: usize,
    activation: Activation,
    kind: LayerKind,
    biases: BufferId,
    weights: BufferId,
    outputs: BufferId,
}

impl Layer {
    /// Moves `biases` and `weights` into `arena` and allocates the output buffer.
    pub(crate) fn alloc(
        arena: &mut Arena,
        inputs: usize,
        spec: LayerSpec,
        biases: Vec<f32>,
        weights: Vec<f32>,
    ) -> Self {
        let neurons = biases.len();
        debug_assert_eq!(weights.len(), neurons * inputs);
        Self {
            neurons,
            inputs,
            activation: spec.activation,
            kind: spec.kind,
            biases: arena.alloc_from(biases),
            weights: arena.alloc_from(weights),
            outputs: arena.alloc(neurons),
        }
    }

    #[inline]
    pub fn neurons(&self) -> usize {
        self.neurons
    }

    #[inline]
    pub fn inputs(&self) -> usize {
        self.inputs
    }

    #[inline]
    pub fn activation(&self) -> Activation {
        self.activation
    }

    #[inline]
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    #[inline]
    pub fn spec(&self) -> LayerSpec {
        LayerSpec {
            activation: self.activation,
            kind: self.kind,
        }
    }

    #[inline]
    pub fn biases(&self) -> BufferId {
        self.biases
    }

    #[inline]
    pub fn weights(&self) -> BufferId {
        self.weights
    }

    #[inline]
    pub fn outputs(&self) -> BufferId {
        self.outputs
    }

    /// Weights plus biases.
    #[inline]
    pub fn parameter_count(&self) -> usize {
        self.neurons * self.inputs + self.neurons
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GradientLayer {
    neurons: usize,
    inputs: usize,
    dcdz: BufferId,
    dcdw: BufferId,
}

impl GradientLayer {
    pub(crate) fn alloc(arena: &mut Arena, layer: &Layer) -> Self {
        Self {
            neurons: layer.neurons(),
            inputs: layer.inputs(),
            dcdz: arena.alloc(layer.neurons()),
            dcdw: arena.alloc(layer.neurons() * layer.inputs()),
        }
    }

    #[inline]
    pub fn neurons(&self) -> usize {
        self.neurons
    }

    #[inline]
    pub fn inputs(&self) -> usize {
        self.inputs
    }

    /// Local gradient `dC/dz`, one entry per neuron. Doubles as the bias gradient.
    #[inline]
    pub fn dcdz(&self) -> BufferId {
        self.dcdz
    }

    #[inline]
    pub fn dcdw(&self) -> BufferId {
        self.dcdw
    }
}

/// One [`GradientLayer`] per network layer.
///
/// The same type serves as a per-example scratch buffer and as a minibatch
/// accumulator; the two are always distinct allocations.
#[derive(Debug, Clone)]
pub struct Gradients {
    layers: Vec<GradientLayer>,
}

impl Gradients {
    pub(crate) fn alloc(arena: &mut Arena, layers: &[Layer]) -> Self {
        Self {
            layers: layers
                .iter()
                .map(|l| GradientLayer::alloc(arena, l))
                .collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Panics if `idx` is out of range.
    #[inline]
    pub fn layer(&self, idx: usize) -> &GradientLayer {
        &self.layers[idx]
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &GradientLayer> {
        self.layers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_layer_mirrors_layer_shape() {
        let mut arena = Arena::new();
        let layer = Layer::alloc(
            &mut arena,
            3,
            LayerSpec::default(),
            vec![0.0; 2],
            vec![0.0; 6],
        );
        let grads = Gradients::alloc(&mut arena, std::slice::from_ref(&layer));

        let g = grads.layer(0);
        assert_eq!(arena.len(g.dcdz()), layer.neurons());
        assert_eq!(arena.len(g.dcdw()), arena.len(layer.weights()));
        assert_eq!(arena.len(layer.outputs()), 2);
        assert_eq!(layer.parameter_count(), 8);
    }

    #[test]
    fn stochastic_stddev_is_validated() {
        assert!(LayerKind::Stochastic { stddev: -1.0 }.validate().is_err());
        assert!(LayerKind::Stochastic { stddev: f32::NAN }.validate().is_err());
        assert!(LayerKind::Stochastic { stddev: 0.1 }.validate().is_ok());
        assert!(LayerKind::Deterministic.validate().is_ok());
    }
}
