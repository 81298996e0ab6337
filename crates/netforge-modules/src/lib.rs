//! Typed composition of graph-building modules.
//!
//! Modules declare their input and output [`ShapeSpec`]s, batch size and
//! element type up front. [`Sequential`] checks every adjacent pair when it
//! is built, so an incompatible chain is rejected before any backend network
//! exists. [`Network`] then drives one module through a [`Backend`] and asks
//! it for a serialized engine.
//!
//! ```
//! use netforge_core::DType;
//! use netforge_modules::{mlp, MlpConfig, Module};
//!
//! let model = mlp(&MlpConfig::new(1, DType::F32, [10, 5, 2])).unwrap();
//! assert_eq!(model.flatten().len(), 4);
//! assert_eq!(model.out_shape().volume(), 2);
//! ```
//!
//! [`ShapeSpec`]: netforge_core::ShapeSpec
//! [`Backend`]: netforge_core::Backend

pub mod activation;
pub mod linear;
pub mod mlp;
pub mod module;
pub mod network;
pub mod sequential;
pub mod softmax;

pub use activation::ActivationLayer;
pub use linear::LinearLayer;
pub use mlp::{mlp, mlp_with_parameters, LinearParameters, MlpConfig};
pub use module::{Module, ModuleDescriptor, ModuleKind};
pub use network::{BuildError, Network, INPUT_NAME};
pub use sequential::{Sequential, SequentialBuilder};
pub use softmax::SoftmaxLayer;
