//! Scalar and buffer math shared by the kernels, the trainer and callers.
//!
//! Everything here is pure and single precision. Buffer helpers validate their
//! lengths and fail with [`Error::ShapeMismatch`] instead of truncating.

use rand::Rng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, check_len};

/// Logistic sigmoid, `1 / (1 + e^-x)`.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    // Split on sign so `exp` never overflows.
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Sigmoid derivative expressed through the sigmoid *output* `s`: `s * (1 - s)`.
#[inline]
pub fn sigmoid_prime(s: f32) -> f32 {
    s * (1.0 - s)
}

#[inline]
pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

#[inline]
pub fn relu_prime(x: f32) -> f32 {
    if x > 0.0 { 1.0 } else { 0.0 }
}

/// One normal sample via the Box-Muller transform.
///
/// Consumes two uniform draws from `rng`.
pub fn gaussian<R: Rng + ?Sized>(rng: &mut R, mean: f32, stddev: f32) -> f32 {
    // u1 in (0, 1] keeps ln(u1) finite.
    let u1 = 1.0 - rng.r#gen::<f32>();
    let u2 = rng.r#gen::<f32>();
    let radius = (-2.0 * u1.ln()).sqrt();
    let theta = 2.0 * std::f32::consts::PI * u2;
    mean + stddev * radius * theta.cos()
}

/// Index of the largest element; the first one wins on ties.
///
/// Returns `None` for an empty slice.
pub fn arg_max(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Writes the one-hot encoding of `class` into `out`.
pub fn one_hot(class: usize, out: &mut [f32]) -> Result<()> {
    if class >= out.len() {
        return Err(crate::Error::InvalidData(format!(
            "class {class} out of range for {} outputs",
            out.len()
        )));
    }
    out.fill(0.0);
    out[class] = 1.0;
    Ok(())
}

/// Reported loss over the error vector `pred - target`.
///
/// Both forms exist in the wild; the backward pass always differentiates
/// `0.5 * sum((pred - target)^2)`, whichever form is reported.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cost {
    /// `sqrt(sum(e_i^2))`.
    #[default]
    L2Norm,
    /// `sum(e_i^2)`.
    SumSquares,
}

impl Cost {
    pub fn eval(self, pred: &[f32], target: &[f32]) -> Result<f32> {
        check_len("cost target", pred.len(), target.len())?;
        let sum_sq = pred
            .iter()
            .zip(target)
            .fold(0.0_f32, |acc, (&p, &t)| (p - t).mul_add(p - t, acc));
        Ok(match self {
            Cost::L2Norm => sum_sq.sqrt(),
            Cost::SumSquares => sum_sq,
        })
    }
}
