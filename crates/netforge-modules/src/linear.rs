use netforge_core::{CompositionError, NetworkDefinition, Shape, ShapeSpec, TensorHandle};

use crate::module::{Module, ModuleDescriptor, ModuleKind};

pub const DEFAULT_WEIGHT: f32 = 0.1;
pub const DEFAULT_BIAS: f32 = 0.0;

/// Affine transform `y = xW + b` from `[rows, in_features]` to
/// `[rows, out_features]`.
///
/// `weights` is row-major `[in_features, out_features]`, `biases` has
/// `out_features` values.
#[derive(Clone, Debug)]
pub struct LinearLayer {
    descriptor: ModuleDescriptor,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl LinearLayer {
    pub fn new(
        batch_size: usize,
        in_shape: ShapeSpec,
        out_shape: ShapeSpec,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self, CompositionError> {
        let (out_features, weight_count) = features(&in_shape, &out_shape)?;
        let descriptor = ModuleDescriptor::new(in_shape, out_shape, batch_size)?;

        if weights.len() != weight_count {
            return Err(CompositionError::ParameterLength {
                buffer: "weights",
                expected: weight_count,
                actual: weights.len(),
            });
        }
        if biases.len() != out_features {
            return Err(CompositionError::ParameterLength {
                buffer: "biases",
                expected: out_features,
                actual: biases.len(),
            });
        }

        Ok(Self {
            descriptor,
            weights,
            biases,
        })
    }

    /// Constant-filled parameters. Only good for structural checks and
    /// compile smoke tests.
    pub fn with_constant(
        batch_size: usize,
        in_shape: ShapeSpec,
        out_shape: ShapeSpec,
    ) -> Result<Self, CompositionError> {
        let (out_features, weight_count) = features(&in_shape, &out_shape)?;
        Self::new(
            batch_size,
            in_shape,
            out_shape,
            vec![DEFAULT_WEIGHT; weight_count],
            vec![DEFAULT_BIAS; out_features],
        )
    }

    pub fn in_features(&self) -> usize {
        feature_dim(&self.descriptor.in_shape)
    }

    pub fn out_features(&self) -> usize {
        feature_dim(&self.descriptor.out_shape)
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Shapes of the weight and bias constants, broadcastable over
    /// `[batch, rows, _]`.
    pub fn parameter_shapes(&self) -> (Shape, Shape) {
        let (i, o) = (self.in_features(), self.out_features());
        (Shape::from_slice(&[1, i, o]), Shape::from_slice(&[1, 1, o]))
    }
}

impl Module for LinearLayer {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Linear {
            in_features: self.in_features(),
            out_features: self.out_features(),
        }
    }

    fn apply(&self, network: &mut dyn NetworkDefinition, input: TensorHandle) -> TensorHandle {
        let (w_shape, b_shape) = self.parameter_shapes();
        let w = network.add_constant(&w_shape, &self.weights);
        let b = network.add_constant(&b_shape, &self.biases);
        let product = network.add_matmul(input, w);
        network.add_elementwise_add(product, b)
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}

fn feature_dim(shape: &ShapeSpec) -> usize {
    shape.dims().last().unwrap_or(0)
}

/// `(out_features, weight count)` of a valid pair of shapes.
fn features(
    in_shape: &ShapeSpec,
    out_shape: &ShapeSpec,
) -> Result<(usize, usize), CompositionError> {
    let invalid = |reason: String| Err(CompositionError::InvalidLinearShape { reason });

    if in_shape.rank() != 2 || out_shape.rank() != 2 {
        return invalid(format!(
            "expected rank-2 shapes, got {} -> {}",
            in_shape.dims(),
            out_shape.dims()
        ));
    }
    let (rows_in, rows_out) = (in_shape.dims().dims()[0], out_shape.dims().dims()[0]);
    if rows_in != rows_out {
        return invalid(format!("row count changes from {rows_in} to {rows_out}"));
    }
    if in_shape.dtype() != out_shape.dtype() {
        return invalid(format!(
            "element type changes from {} to {}",
            in_shape.dtype(),
            out_shape.dtype()
        ));
    }

    let (in_features, out_features) = (feature_dim(in_shape), feature_dim(out_shape));
    if in_features == 0 || out_features == 0 {
        return invalid("feature dimensions must be non-zero".to_string());
    }
    match in_features.checked_mul(out_features) {
        Some(weight_count) => Ok((out_features, weight_count)),
        None => invalid(format!(
            "{in_features} x {out_features} weights overflow the address space"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netforge_core::DType;

    fn spec(dims: &[usize]) -> ShapeSpec {
        ShapeSpec::f32(dims).unwrap()
    }

    #[test]
    fn constant_init_fills_buffers() {
        let layer = LinearLayer::with_constant(1, spec(&[1, 10]), spec(&[1, 5])).unwrap();
        assert_eq!(layer.weights().len(), 50);
        assert_eq!(layer.biases().len(), 5);
        assert!(layer.weights().iter().all(|w| *w == DEFAULT_WEIGHT));
        assert_eq!(layer.parameter_count(), 55);
        assert_eq!(
            layer.kind(),
            ModuleKind::Linear {
                in_features: 10,
                out_features: 5
            }
        );
    }

    #[test]
    fn parameter_shapes_follow_features() {
        let layer = LinearLayer::with_constant(1, spec(&[1, 10]), spec(&[1, 5])).unwrap();
        let (w, b) = layer.parameter_shapes();
        assert_eq!(w.dims(), &[1, 10, 5]);
        assert_eq!(b.dims(), &[1, 1, 5]);
    }

    #[test]
    fn wrong_weight_length_is_rejected() {
        let err = LinearLayer::new(1, spec(&[1, 10]), spec(&[1, 5]), vec![0.1; 49], vec![0.0; 5])
            .unwrap_err();
        assert_eq!(
            err,
            CompositionError::ParameterLength {
                buffer: "weights",
                expected: 50,
                actual: 49
            }
        );
    }

    #[test]
    fn wrong_bias_length_is_rejected() {
        let err = LinearLayer::new(1, spec(&[1, 10]), spec(&[1, 5]), vec![0.1; 50], vec![0.0; 6])
            .unwrap_err();
        assert!(matches!(
            err,
            CompositionError::ParameterLength { buffer: "biases", .. }
        ));
    }

    #[test]
    fn oversized_weight_matrix_is_rejected() {
        let wide = usize::MAX / 2;
        for result in [
            LinearLayer::new(1, spec(&[1, wide]), spec(&[1, 3]), Vec::new(), Vec::new()),
            LinearLayer::with_constant(1, spec(&[1, 3]), spec(&[1, wide])),
        ] {
            assert!(matches!(
                result,
                Err(CompositionError::InvalidLinearShape { .. })
            ));
        }
    }

    #[test]
    fn shape_constraints() {
        assert!(matches!(
            LinearLayer::with_constant(1, spec(&[10]), spec(&[5])),
            Err(CompositionError::InvalidLinearShape { .. })
        ));
        assert!(matches!(
            LinearLayer::with_constant(1, spec(&[2, 10]), spec(&[1, 5])),
            Err(CompositionError::InvalidLinearShape { .. })
        ));
        let half = ShapeSpec::new(&[1, 5], DType::F16).unwrap();
        assert!(matches!(
            LinearLayer::with_constant(1, spec(&[1, 10]), half),
            Err(CompositionError::InvalidLinearShape { .. })
        ));
        assert_eq!(
            LinearLayer::with_constant(0, spec(&[1, 10]), spec(&[1, 5])).unwrap_err(),
            CompositionError::InvalidBatchSize
        );
    }
}
