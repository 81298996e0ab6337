use netforge_core::{CompositionError, NetworkDefinition, ShapeSpec, TensorHandle};

use crate::module::{shape_preserving, Module, ModuleDescriptor, ModuleKind};

/// Softmax over one axis of the module shape (the batch axis is not
/// counted). Defaults to the last axis.
#[derive(Clone, Debug)]
pub struct SoftmaxLayer {
    descriptor: ModuleDescriptor,
    axis: usize,
}

impl SoftmaxLayer {
    pub fn new(batch_size: usize, shape: ShapeSpec) -> Result<Self, CompositionError> {
        let axis = shape.rank() - 1;
        Self::with_axis(batch_size, shape, axis)
    }

    pub fn with_axis(
        batch_size: usize,
        shape: ShapeSpec,
        axis: usize,
    ) -> Result<Self, CompositionError> {
        if axis >= shape.rank() {
            return Err(CompositionError::InvalidAxis {
                axis,
                rank: shape.rank(),
            });
        }
        Ok(Self {
            descriptor: shape_preserving(batch_size, shape)?,
            axis,
        })
    }

    pub fn axis(&self) -> usize {
        self.axis
    }
}

impl Module for SoftmaxLayer {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Softmax { axis: self.axis }
    }

    fn apply(&self, network: &mut dyn NetworkDefinition, input: TensorHandle) -> TensorHandle {
        // network tensors lead with the batch axis
        network.add_softmax(input, self.axis + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_axis_is_last() {
        let layer = SoftmaxLayer::new(1, ShapeSpec::f32(&[1, 2]).unwrap()).unwrap();
        assert_eq!(layer.axis(), 1);
        assert_eq!(layer.in_shape(), layer.out_shape());
    }

    #[test]
    fn axis_must_be_in_range() {
        let err = SoftmaxLayer::with_axis(1, ShapeSpec::f32(&[1, 2]).unwrap(), 2).unwrap_err();
        assert_eq!(err, CompositionError::InvalidAxis { axis: 2, rank: 2 });
    }
}
