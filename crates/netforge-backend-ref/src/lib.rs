//! CPU reference backend: records a network definition, lowers it to a
//! small step list and serializes that as a self-describing engine.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, ensure, Result};
use netforge_core::{Backend, SerializedEngine};
use tracing::debug;

mod compile;
pub mod engine;
pub mod graph;
mod shapes;

pub use engine::{Engine, Step, StepOp, FORMAT_VERSION, MAGIC};
pub use graph::{Node, Op, RefNetwork};

#[derive(Clone, Debug)]
pub struct RefConfig {
    /// Fold `matmul + constant bias` pairs into one dense step.
    pub fuse_bias: bool,
    /// Upper bound on constant data baked into the engine.
    pub max_constant_bytes: Option<usize>,
}

impl Default for RefConfig {
    fn default() -> Self {
        Self {
            fuse_bias: true,
            max_constant_bytes: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RefBackend {
    defaults: RefConfig,
    network_limit: Option<usize>,
    networks_created: AtomicUsize,
}

impl RefBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration handed out by `create_config`.
    pub fn with_config(config: RefConfig) -> Self {
        Self {
            defaults: config,
            ..Self::default()
        }
    }

    /// Caps the number of network definitions this backend creates over its
    /// lifetime. Dropping a definition does not free a slot.
    pub fn with_network_limit(mut self, limit: usize) -> Self {
        self.network_limit = Some(limit);
        self
    }

    /// Definitions handed out so far, including ones already dropped.
    pub fn networks_created(&self) -> usize {
        self.networks_created.load(Ordering::SeqCst)
    }
}

impl Backend for RefBackend {
    type Network = RefNetwork;
    type Config = RefConfig;

    fn name(&self) -> &'static str {
        "reference"
    }

    fn create_network(&self) -> Result<RefNetwork> {
        let created = self.networks_created.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.network_limit {
            if created >= limit {
                self.networks_created.fetch_sub(1, Ordering::SeqCst);
                bail!("network limit of {limit} reached");
            }
        }
        Ok(RefNetwork::new())
    }

    fn create_config(&self) -> Result<RefConfig> {
        Ok(self.defaults.clone())
    }

    fn build_serialized(&self, network: &RefNetwork, config: &RefConfig) -> Result<SerializedEngine> {
        let engine = compile::compile(network, config)?;
        let serialized = engine.serialize()?;
        ensure!(!serialized.is_empty(), "engine serialized to zero bytes");
        debug!(
            steps = engine.steps().len(),
            bytes = serialized.len(),
            "reference engine built"
        );
        Ok(serialized)
    }
}
