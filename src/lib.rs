//! # Pocket Train
//!
//! Declarative layer graphs for training small convolutional networks.
//! Layers are added by id with their origins; output shapes, parameters,
//! update rules and regularisation terms are worked out as the graph is
//! built. Finalising the graph yields a [`CompiledNetwork`] with an atomic
//! train step and a deterministic inference step.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pocket_train::{FiniteDifference, Network, Sgd};
//!
//! let mut net = Network::with_seed(0);
//! net.add_layer_json(r#"{"type": "input", "id": "input", "config": {"shape": [4, 1, 28, 28]}}"#)?;
//! net.add_layer_json(r#"{"type": "conv_pool", "id": "conv1", "origin": "input", "config": {"nkerns": 8}}"#)?;
//! net.add_layer_json(r#"{"type": "classifier", "id": "softmax", "origin": "conv1", "config": {"num_classes": 10}}"#)?;
//! net.add_layer_json(r#"{"type": "objective", "id": "nll", "origin": "softmax"}"#)?;
//!
//! let mut net = net.finalize("nll", "input")?;
//! let metrics = net.train_step(&batch, &FiniteDifference::default(), &mut Sgd::new(0.1))?;
//! ```

pub mod activations;
pub mod backend;
pub mod config;
pub mod data;
pub mod error;
pub mod layers;
pub mod network;
pub mod ops;
pub mod optimizer;
pub mod param;
pub mod persist;
pub mod tensor;

pub use activations::Activation;
pub use backend::{Backend, FiniteDifference};
pub use config::{LayerConfig, LayerSpec, LayerType};
pub use data::DataStream;
pub use error::{Error, Result};
pub use network::{Batch, CompiledNetwork, Network, StepMetrics};
pub use optimizer::{Optimizer, Sgd};
pub use param::{Param, ParamRole, UpdateRule};
pub use tensor::Tensor;
