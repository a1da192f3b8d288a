//! Network shape and training configuration.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "serde")]
use std::path::Path;

use crate::error::{Error, Result};
use crate::layer::LayerSpec;
use crate::math::Cost;

/// Layer sizes, input first, plus one [`LayerSpec`] per non-input layer.
///
/// Immutable once built; every buffer in a network is sized from it.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    sizes: Vec<usize>,
    specs: Vec<LayerSpec>,
}

impl NetworkConfig {
    /// Every layer uses the default spec (deterministic sigmoid).
    pub fn new(sizes: &[usize]) -> Result<Self> {
        let layers = sizes.len().saturating_sub(1);
        Self::with_specs(sizes, vec![LayerSpec::default(); layers])
    }

    pub fn with_specs(sizes: &[usize], specs: Vec<LayerSpec>) -> Result<Self> {
        if sizes.len() < 2 {
            return Err(Error::InvalidConfig(
                "sizes must include input and output dims".to_owned(),
            ));
        }
        if sizes.contains(&0) {
            return Err(Error::InvalidConfig(
                "all layer sizes must be > 0".to_owned(),
            ));
        }
        if specs.len() != sizes.len() - 1 {
            return Err(Error::InvalidConfig(format!(
                "specs length {} does not match sizes.len() - 1 ({})",
                specs.len(),
                sizes.len() - 1
            )));
        }
        for spec in &specs {
            spec.kind.validate()?;
        }
        Ok(Self {
            sizes: sizes.to_vec(),
            specs,
        })
    }

    /// Layer sizes, including the input size as the first entry.
    #[inline]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    #[inline]
    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    #[inline]
    pub fn input_dim(&self) -> usize {
        self.sizes[0]
    }

    #[inline]
    pub fn output_dim(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    /// Number of non-input layers.
    #[inline]
    pub fn num_layers(&self) -> usize {
        self.specs.len()
    }

    /// `(neurons, inputs)` for each non-input layer.
    pub fn layer_shapes(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.sizes.windows(2).map(|w| (w[1], w[0]))
    }

    pub fn parameter_count(&self) -> usize {
        self.layer_shapes().map(|(n, m)| n * m + n).sum()
    }
}

/// Settings for [`crate::Network::fit`].
///
/// Every field has a default, so a JSON file only needs the fields it changes:
///
/// ```json
/// { "epochs": 30, "batch_size": 10, "learning_rate": 3.0, "seed": 7 }
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Base rate; each update uses `learning_rate / batch_size`.
    pub learning_rate: f32,
    /// Seeds minibatch shuffling.
    pub seed: u64,
    /// Minibatch examples in flight at once.
    pub lanes: usize,
    /// Worker threads; `None` keeps the network's current pool.
    pub threads: Option<usize>,
    /// Reported loss.
    pub cost: Cost,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 10,
            learning_rate: 0.5,
            seed: 0,
            lanes: 4,
            threads: None,
            cost: Cost::L2Norm,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be > 0".to_owned()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_owned()));
        }
        if self.lanes == 0 {
            return Err(Error::InvalidConfig("lanes must be > 0".to_owned()));
        }
        if self.threads == Some(0) {
            return Err(Error::InvalidConfig("threads must be > 0".to_owned()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(
                "learning_rate must be finite and > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Reads and validates a [`TrainConfig`] from a JSON file.
#[cfg(feature = "serde")]
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrainConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TrainConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
