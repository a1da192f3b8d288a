//! A job-parallel fully-connected neural network engine.
//!
//! `jobnet` trains small dense networks by stochastic gradient descent. Every step
//! of the forward pass, the backward pass and the update is a small kernel over flat
//! `f32` buffers; kernels are appended to a [`JobGraph`], which orders them by the
//! buffers they read and write, and a [`Scheduler`] runs them on a rayon pool.
//!
//! # Data layout and shapes
//!
//! - Scalars are `f32`; every buffer lives in the network's [`Arena`].
//! - Layer weights are row-major with shape `(neurons, inputs)`.
//! - Only post-activation outputs are kept; derivatives are taken from them.
//! - Batched inputs and targets are flat row-major buffers:
//!   `(batch, input_dim)` and `(batch, output_dim)`.
//!
//! # Errors
//!
//! Shapes are checked when kernels are scheduled, so a bad call fails with
//! [`Error::ShapeMismatch`] before anything runs. Kernels themselves never fail.
//!
//! # MSRV
//!
//! The minimum supported Rust version is specified in `Cargo.toml`.

//! # Quick start
//!
//! ```rust
//! use jobnet::{Dataset, ImageShape, Network, NetworkConfig, TrainConfig};
//!
//! # fn main() -> jobnet::Result<()> {
//! let images = vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
//! let train = Dataset::from_floats(images, vec![0, 1, 1, 0], ImageShape::flat(2), 2)?;
//!
//! let mut net = Network::with_seed(NetworkConfig::new(&[2, 4, 2])?, 0)?;
//! let report = net.fit(
//!     &train,
//!     Some(&train),
//!     &TrainConfig {
//!         epochs: 5,
//!         batch_size: 2,
//!         learning_rate: 1.0,
//!         ..TrainConfig::default()
//!     },
//! )?;
//! assert_eq!(report.epochs.len(), 5);
//! # Ok(())
//! # }
//! ```

//! # Driving the graph yourself
//!
//! The blocking methods on [`Network`] each build and run one graph. The
//! `schedule_*` methods only append kernels, so several passes can share a graph:
//!
//! ```rust
//! use jobnet::{JobGraph, Network, NetworkConfig};
//!
//! # fn main() -> jobnet::Result<()> {
//! let mut net = Network::with_seed(NetworkConfig::new(&[3, 4, 2])?, 0)?;
//! let lane = net.lane();
//! let grads = net.gradients();
//! let acc = net.gradients();
//!
//! let mut graph = JobGraph::new();
//! net.stage(&lane, &[0.1, -0.2, 0.3], Some(&[0.0, 1.0]))?;
//! net.schedule_zero(&mut graph, &acc)?;
//! net.schedule_forward(&mut graph, &lane)?;
//! net.schedule_backward(&mut graph, &lane, &grads)?;
//! net.schedule_accumulate(&mut graph, &acc, &grads)?;
//! net.schedule_update(&mut graph, &acc, 0.1)?;
//! net.complete(&mut graph);
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod arena;
pub mod builder;
pub mod config;
pub mod conv;
pub mod data;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod layer;
pub mod math;
pub(crate) mod matmul;
pub mod network;
pub mod optim;
pub mod persist;
pub mod train;

#[cfg(feature = "serde")]
pub mod serde_model;

pub use activation::Activation;
pub use arena::{Arena, BufferId, BufferMut, BufferRef};
pub use builder::NetworkBuilder;
#[cfg(feature = "serde")]
pub use config::load_config;
pub use config::{NetworkConfig, TrainConfig};
pub use conv::{ConvGradients, ConvLayer};
pub use data::{Dataset, ImageShape, Shuffler};
pub use error::{Error, Result};
pub use graph::{JobGraph, JobHandle, Scheduler};
pub use kernel::Kernel;
pub use layer::{GradientLayer, Gradients, Layer, LayerKind, LayerSpec};
pub use math::Cost;
pub use network::{Lane, Network};
pub use optim::Sgd;
pub use train::{EpochReport, EvalReport, FitReport, Trainer};
