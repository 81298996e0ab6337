use std::error::Error as StdError;

use netforge_core::{Backend, CompositionError, NetworkDefinition, SerializedEngine, Shape, TensorHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::Module;

pub const INPUT_NAME: &str = "input";

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error("{backend} backend could not allocate build resources")]
    ResourceAcquisition {
        backend: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("module produced {actual}, declared output is {expected}")]
    OutputShape { expected: Shape, actual: Shape },

    #[error("{backend} backend failed to build the engine")]
    Backend {
        backend: &'static str,
        #[source]
        source: BoxError,
    },
}

/// One build context: owns the backend network and configuration for a
/// single module, from definition to serialization.
///
/// Backend resources are released when the `Network` is dropped, whether or
/// not serialization succeeded.
pub struct Network<'b, B: Backend> {
    backend: &'b B,
    network: B::Network,
    config: B::Config,
    output: TensorHandle,
}

impl<'b, B: Backend> Network<'b, B> {
    /// Defines `module` on a fresh backend network with a
    /// `[batch_size] ++ in_shape` input.
    pub fn new(backend: &'b B, module: &dyn Module, batch_size: usize) -> Result<Self, BuildError> {
        if batch_size != module.batch_size() {
            return Err(CompositionError::BatchSizeMismatch {
                module: module.batch_size(),
                requested: batch_size,
            }
            .into());
        }

        let mut network = backend
            .create_network()
            .map_err(|e| BuildError::ResourceAcquisition {
                backend: backend.name(),
                source: e.into(),
            })?;
        let config = backend
            .create_config()
            .map_err(|e| BuildError::ResourceAcquisition {
                backend: backend.name(),
                source: e.into(),
            })?;

        let input_shape = module.in_shape().dims().prepend(batch_size);
        let input = network.add_input(INPUT_NAME, module.element_type(), &input_shape);
        let output = module.apply(&mut network, input);

        let expected = module.out_shape().dims().prepend(batch_size);
        if let Some(actual) = network.shape_of(output) {
            if actual != expected {
                return Err(BuildError::OutputShape { expected, actual });
            }
        }
        network.mark_output(output);

        debug!(
            backend = backend.name(),
            module = %module.kind(),
            input = %input_shape,
            output = %expected,
            layers = network.num_layers(),
            parameters = module.parameter_count(),
            "network defined"
        );

        Ok(Self {
            backend,
            network,
            config,
            output,
        })
    }

    pub fn definition(&self) -> &B::Network {
        &self.network
    }

    pub fn config(&self) -> &B::Config {
        &self.config
    }

    pub fn output(&self) -> TensorHandle {
        self.output
    }

    /// Compiles and serializes the defined network.
    pub fn serialize(&self) -> Result<SerializedEngine, BuildError> {
        match self.backend.build_serialized(&self.network, &self.config) {
            Ok(engine) => {
                info!(backend = self.backend.name(), bytes = engine.len(), "engine serialized");
                Ok(engine)
            }
            Err(e) => {
                warn!(backend = self.backend.name(), error = %format!("{e:#}"), "engine build failed");
                Err(BuildError::Backend {
                    backend: self.backend.name(),
                    source: e.into(),
                })
            }
        }
    }
}
