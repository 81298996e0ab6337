use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::{DType, SerializedEngine, Shape};

/// Opaque handle to a tensor inside one network definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorHandle(pub u32);

impl TensorHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    #[default]
    Relu,
    Sigmoid,
    Tanh,
}

impl ActivationKind {
    pub fn tag(self) -> u8 {
        match self {
            ActivationKind::Relu => 0,
            ActivationKind::Sigmoid => 1,
            ActivationKind::Tanh => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ActivationKind::Relu,
            1 => ActivationKind::Sigmoid,
            2 => ActivationKind::Tanh,
            _ => return None,
        })
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActivationKind::Relu => "relu",
            ActivationKind::Sigmoid => "sigmoid",
            ActivationKind::Tanh => "tanh",
        })
    }
}

impl FromStr for ActivationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(ActivationKind::Relu),
            "sigmoid" => Ok(ActivationKind::Sigmoid),
            "tanh" => Ok(ActivationKind::Tanh),
            other => Err(format!("unknown activation: {other}")),
        }
    }
}

/// A network under construction.
///
/// Node-adding calls never fail on the spot. A backend that cannot accept a
/// node remembers why and refuses to build the network later.
pub trait NetworkDefinition: Send {
    fn add_input(&mut self, name: &str, dtype: DType, shape: &Shape) -> TensorHandle;

    /// Row-major host values; the definition keeps its own copy.
    fn add_constant(&mut self, shape: &Shape, values: &[f32]) -> TensorHandle;

    fn add_matmul(&mut self, lhs: TensorHandle, rhs: TensorHandle) -> TensorHandle;

    fn add_elementwise_add(&mut self, lhs: TensorHandle, rhs: TensorHandle) -> TensorHandle;

    fn add_activation(&mut self, input: TensorHandle, kind: ActivationKind) -> TensorHandle;

    /// `axis` indexes the full tensor, batch axis included.
    fn add_softmax(&mut self, input: TensorHandle, axis: usize) -> TensorHandle;

    fn mark_output(&mut self, tensor: TensorHandle);

    /// Dimensions the backend inferred for `tensor`, if it could.
    fn shape_of(&self, tensor: TensorHandle) -> Option<Shape>;

    fn num_layers(&self) -> usize;
}

/// A tensor-graph engine builder.
pub trait Backend: Send + Sync {
    type Network: NetworkDefinition;
    type Config;

    fn name(&self) -> &'static str;

    fn create_network(&self) -> Result<Self::Network>;

    fn create_config(&self) -> Result<Self::Config>;

    /// Compiles a finished definition. A failure here is never an empty engine.
    fn build_serialized(
        &self,
        network: &Self::Network,
        config: &Self::Config,
    ) -> Result<SerializedEngine>;
}
