//! JSON model snapshots (feature: `serde`).
//!
//! Unlike the legacy binary format, a snapshot records each layer's activation and
//! kind. Layer inputs are implied by the chain: the first layer reads `input_dim`
//! values and every later layer reads the previous layer's `neurons`.
//!
//! Loading goes through the same validation as building a network by hand, so a
//! snapshot that loads is always a consistent network.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activation::Activation;
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::layer::{LayerKind, LayerSpec};
use crate::network::Network;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: u32,
    pub input_dim: usize,
    pub layers: Vec<LayerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSnapshot {
    pub neurons: usize,
    pub activation: Activation,
    pub kind: LayerKind,
    pub biases: Vec<f32>,
    /// Row-major by neuron.
    pub weights: Vec<f32>,
}

impl From<&Network> for ModelSnapshot {
    fn from(net: &Network) -> Self {
        let layers = net
            .layers()
            .iter()
            .enumerate()
            .map(|(l, layer)| LayerSnapshot {
                neurons: layer.neurons(),
                activation: layer.activation(),
                kind: layer.kind(),
                biases: net.biases(l).to_vec(),
                weights: net.weights(l).to_vec(),
            })
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            input_dim: net.input_dim(),
            layers,
        }
    }
}

impl TryFrom<ModelSnapshot> for Network {
    type Error = Error;

    fn try_from(snapshot: ModelSnapshot) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported snapshot version {}; expected {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }

        let mut sizes = vec![snapshot.input_dim];
        let mut specs = Vec::with_capacity(snapshot.layers.len());
        let mut params = Vec::with_capacity(snapshot.layers.len());
        for layer in snapshot.layers {
            sizes.push(layer.neurons);
            specs.push(LayerSpec {
                activation: layer.activation,
                kind: layer.kind,
            });
            params.push((layer.biases, layer.weights));
        }

        NetworkConfig::with_specs(&sizes, specs)
            .and_then(|config| Network::from_parameters(config, params))
            .map_err(|e| Error::InvalidData(format!("inconsistent snapshot: {e}")))
    }
}

impl Network {
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&ModelSnapshot::from(self))?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&ModelSnapshot::from(self))?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str::<ModelSnapshot>(json)?.try_into()
    }

    /// Writes a pretty-printed snapshot to `path`.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json_string_pretty()?)?;
        debug!(path = %path.display(), "saved json model");
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let net = Self::from_json_str(&std::fs::read_to_string(path)?)?;
        debug!(path = %path.display(), sizes = ?net.config().sizes(), "loaded json model");
        Ok(net)
    }
}
