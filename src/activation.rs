//! Activation functions.
//!
//! A layer computes a pre-activation value `z = W x + b` and then applies an
//! activation function element-wise in place: `y = activation(z)`.
//!
//! Only the *post-activation* outputs `y` are kept in the layer's output buffer.
//! Backprop computes `dC/dz` from `dC/dy` using `y` alone, so no separate `z`
//! buffer is ever allocated.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::math;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Element-wise activation function.
pub enum Activation {
    /// `1 / (1 + e^-x)`.
    #[default]
    Sigmoid,
    /// `max(x, 0)`.
    Relu,
}

impl Activation {
    #[inline]
    pub fn forward(self, x: f32) -> f32 {
        match self {
            Activation::Sigmoid => math::sigmoid(x),
            Activation::Relu => math::relu(x),
        }
    }

    /// Derivative of the activation with respect to its input, expressed in terms
    /// of the cached post-activation output `y`.
    #[inline]
    pub fn grad_from_output(self, y: f32) -> f32 {
        match self {
            Activation::Sigmoid => math::sigmoid_prime(y),
            // relu(z) > 0 exactly when z > 0.
            Activation::Relu => math::relu_prime(y),
        }
    }
}
