//! Network builder.
//!
//! `NetworkBuilder` states a model layer by layer instead of through a sizes list:
//!
//! ```rust
//! use jobnet::{Activation, NetworkBuilder};
//!
//! # fn main() -> jobnet::Result<()> {
//! let net = NetworkBuilder::new(2)?
//!     .add_layer(8, Activation::Relu)?
//!     .add_stochastic_layer(8, Activation::Relu, 0.1)?
//!     .add_layer(1, Activation::Sigmoid)?
//!     .build_with_seed(0)?;
//! assert_eq!(net.output_dim(), 1);
//! # Ok(())
//! # }
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::activation::Activation;
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::layer::{LayerKind, LayerSpec};
use crate::network::Network;

#[derive(Debug, Clone)]
pub struct NetworkBuilder {
    sizes: Vec<usize>,
    specs: Vec<LayerSpec>,
    threads: Option<usize>,
}

impl NetworkBuilder {
    /// Start building a network that accepts inputs of length `input_dim`.
    pub fn new(input_dim: usize) -> Result<Self> {
        if input_dim == 0 {
            return Err(Error::InvalidConfig("input_dim must be > 0".to_owned()));
        }
        Ok(Self {
            sizes: vec![input_dim],
            specs: Vec::new(),
            threads: None,
        })
    }

    /// Add a deterministic fully-connected layer of `neurons` outputs.
    pub fn add_layer(self, neurons: usize, activation: Activation) -> Result<Self> {
        self.push(neurons, LayerSpec {
            activation,
            kind: LayerKind::Deterministic,
        })
    }

    /// Add a layer whose biases are resampled around their means on every pass.
    pub fn add_stochastic_layer(
        self,
        neurons: usize,
        activation: Activation,
        stddev: f32,
    ) -> Result<Self> {
        self.push(neurons, LayerSpec {
            activation,
            kind: LayerKind::Stochastic { stddev },
        })
    }

    /// Worker threads for the network's scheduler; defaults to rayon's choice.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn build_with_seed(self, seed: u64) -> Result<Network> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.build_with_rng(&mut rng)
    }

    pub fn build_with_rng<R: Rng + ?Sized>(self, rng: &mut R) -> Result<Network> {
        let config = NetworkConfig::with_specs(&self.sizes, self.specs)?;
        let mut net = Network::new(config, rng)?;
        if let Some(threads) = self.threads {
            net.set_threads(threads)?;
        }
        Ok(net)
    }

    fn push(mut self, neurons: usize, spec: LayerSpec) -> Result<Self> {
        if neurons == 0 {
            return Err(Error::InvalidConfig("layer neurons must be > 0".to_owned()));
        }
        spec.kind.validate()?;
        self.sizes.push(neurons);
        self.specs.push(spec);
        Ok(self)
    }
}
