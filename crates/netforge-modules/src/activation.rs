use netforge_core::{ActivationKind, CompositionError, NetworkDefinition, ShapeSpec, TensorHandle};

use crate::module::{shape_preserving, Module, ModuleDescriptor, ModuleKind};

#[derive(Clone, Debug)]
pub struct ActivationLayer {
    descriptor: ModuleDescriptor,
    activation: ActivationKind,
}

impl ActivationLayer {
    pub fn new(
        batch_size: usize,
        shape: ShapeSpec,
        activation: ActivationKind,
    ) -> Result<Self, CompositionError> {
        Ok(Self {
            descriptor: shape_preserving(batch_size, shape)?,
            activation,
        })
    }

    pub fn relu(batch_size: usize, shape: ShapeSpec) -> Result<Self, CompositionError> {
        Self::new(batch_size, shape, ActivationKind::Relu)
    }

    pub fn activation(&self) -> ActivationKind {
        self.activation
    }
}

impl Module for ActivationLayer {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Activation(self.activation)
    }

    fn apply(&self, network: &mut dyn NetworkDefinition, input: TensorHandle) -> TensorHandle {
        network.add_activation(input, self.activation)
    }
}
