use std::fmt;

use netforge_core::{ActivationKind, CompositionError, DType, Mismatch, NetworkDefinition, ShapeSpec, TensorHandle};

/// Composition-time metadata every module carries. Never changes after the
/// module is built.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleDescriptor {
    pub in_shape: ShapeSpec,
    pub out_shape: ShapeSpec,
    pub batch_size: usize,
}

impl ModuleDescriptor {
    pub fn new(
        in_shape: ShapeSpec,
        out_shape: ShapeSpec,
        batch_size: usize,
    ) -> Result<Self, CompositionError> {
        if batch_size == 0 {
            return Err(CompositionError::InvalidBatchSize);
        }
        Ok(Self {
            in_shape,
            out_shape,
            batch_size,
        })
    }

    pub fn element_type(&self) -> DType {
        self.in_shape.dtype()
    }

    /// Chain compatibility check for the pair (`previous`, `self`), where
    /// `self` sits at position `index` of the chain.
    pub fn check_follows(
        &self,
        previous: &ModuleDescriptor,
        index: usize,
    ) -> Result<(), CompositionError> {
        let produced = &previous.out_shape;
        let expected = &self.in_shape;

        if produced.dims() != expected.dims() {
            return Err(CompositionError::ChainMismatch {
                index,
                field: Mismatch::Shape,
                produced: produced.dims().to_string(),
                expected: expected.dims().to_string(),
            });
        }
        if previous.batch_size != self.batch_size {
            return Err(CompositionError::ChainMismatch {
                index,
                field: Mismatch::BatchSize,
                produced: previous.batch_size.to_string(),
                expected: self.batch_size.to_string(),
            });
        }
        if produced.dtype() != expected.dtype() {
            return Err(CompositionError::ChainMismatch {
                index,
                field: Mismatch::ElementType,
                produced: produced.dtype().to_string(),
                expected: expected.dtype().to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    Linear { in_features: usize, out_features: usize },
    Activation(ActivationKind),
    Softmax { axis: usize },
    Sequential { len: usize },
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Linear {
                in_features,
                out_features,
            } => write!(f, "Linear({in_features}->{out_features})"),
            ModuleKind::Activation(kind) => write!(f, "Activation({kind})"),
            ModuleKind::Softmax { axis } => write!(f, "Softmax(axis={axis})"),
            ModuleKind::Sequential { len } => write!(f, "Sequential({len})"),
        }
    }
}

/// A building block that knows its shapes and appends its computation to a
/// network under construction.
pub trait Module: fmt::Debug + Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    fn kind(&self) -> ModuleKind;

    /// Appends the nodes turning `input` (`[batch] ++ in_shape`) into
    /// `[batch] ++ out_shape` and returns the resulting tensor.
    ///
    /// Call at most once per network: every call adds fresh nodes.
    fn apply(&self, network: &mut dyn NetworkDefinition, input: TensorHandle) -> TensorHandle;

    fn parameter_count(&self) -> usize {
        0
    }

    fn in_shape(&self) -> &ShapeSpec {
        &self.descriptor().in_shape
    }

    fn out_shape(&self) -> &ShapeSpec {
        &self.descriptor().out_shape
    }

    fn batch_size(&self) -> usize {
        self.descriptor().batch_size
    }

    fn element_type(&self) -> DType {
        self.descriptor().element_type()
    }

    /// Nested members, for combinators.
    fn members(&self) -> &[Box<dyn Module>] {
        &[]
    }
}

impl<M: Module + ?Sized> Module for Box<M> {
    fn descriptor(&self) -> &ModuleDescriptor {
        (**self).descriptor()
    }

    fn kind(&self) -> ModuleKind {
        (**self).kind()
    }

    fn apply(&self, network: &mut dyn NetworkDefinition, input: TensorHandle) -> TensorHandle {
        (**self).apply(network, input)
    }

    fn parameter_count(&self) -> usize {
        (**self).parameter_count()
    }

    fn members(&self) -> &[Box<dyn Module>] {
        (**self).members()
    }
}

/// Shared constructor check for layers whose output equals their input.
pub(crate) fn shape_preserving(
    batch_size: usize,
    shape: ShapeSpec,
) -> Result<ModuleDescriptor, CompositionError> {
    ModuleDescriptor::new(shape.clone(), shape, batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(dims_in: &[usize], dims_out: &[usize], batch: usize, dtype: DType) -> ModuleDescriptor {
        ModuleDescriptor::new(
            ShapeSpec::new(dims_in, dtype).unwrap(),
            ShapeSpec::new(dims_out, dtype).unwrap(),
            batch,
        )
        .unwrap()
    }

    #[test]
    fn matching_pair_passes() {
        let a = desc(&[1, 10], &[1, 5], 1, DType::F32);
        let b = desc(&[1, 5], &[1, 2], 1, DType::F32);
        assert_eq!(b.check_follows(&a, 1), Ok(()));
    }

    #[test]
    fn shape_is_checked_first() {
        let a = desc(&[1, 10], &[1, 5], 1, DType::F32);
        let b = desc(&[1, 6], &[1, 2], 2, DType::F16);
        let err = b.check_follows(&a, 3).unwrap_err();
        assert_eq!(
            err,
            CompositionError::ChainMismatch {
                index: 3,
                field: Mismatch::Shape,
                produced: "[1, 5]".into(),
                expected: "[1, 6]".into(),
            }
        );
    }

    #[test]
    fn batch_and_dtype_are_checked() {
        let a = desc(&[1, 10], &[1, 5], 1, DType::F32);
        let other_batch = desc(&[1, 5], &[1, 2], 2, DType::F32);
        let other_dtype = desc(&[1, 5], &[1, 2], 1, DType::F16);

        assert!(matches!(
            other_batch.check_follows(&a, 1),
            Err(CompositionError::ChainMismatch { field: Mismatch::BatchSize, .. })
        ));
        assert!(matches!(
            other_dtype.check_follows(&a, 1),
            Err(CompositionError::ChainMismatch { field: Mismatch::ElementType, .. })
        ));
    }

    #[test]
    fn zero_batch_is_rejected() {
        let shape = ShapeSpec::f32(&[1, 4]).unwrap();
        assert_eq!(
            ModuleDescriptor::new(shape.clone(), shape, 0),
            Err(CompositionError::InvalidBatchSize)
        );
    }
}
