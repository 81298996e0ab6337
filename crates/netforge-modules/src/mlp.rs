use netforge_core::{ActivationKind, CompositionError, DType, ShapeSpec};

use crate::{ActivationLayer, LinearLayer, Module, Sequential, SoftmaxLayer};

/// Layer widths plus the metadata every generated layer shares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MlpConfig {
    pub batch_size: usize,
    pub element_type: DType,
    /// First is the input width, last the output width.
    pub widths: Vec<usize>,
    /// Applied after every linear layer except the last.
    pub activation: ActivationKind,
}

impl MlpConfig {
    pub fn new(batch_size: usize, element_type: DType, widths: impl Into<Vec<usize>>) -> Self {
        Self {
            batch_size,
            element_type,
            widths: widths.into(),
            activation: ActivationKind::Relu,
        }
    }

    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn linear_layers(&self) -> usize {
        self.widths.len().saturating_sub(1)
    }

    fn validate(&self) -> Result<(), CompositionError> {
        if self.batch_size == 0 {
            return Err(CompositionError::InvalidBatchSize);
        }
        if self.widths.len() < 2 {
            return Err(CompositionError::InvalidWidths {
                reason: format!("need at least 2 widths, got {}", self.widths.len()),
            });
        }
        if let Some(pos) = self.widths.iter().position(|w| *w == 0) {
            return Err(CompositionError::InvalidWidths {
                reason: format!("width {pos} is zero"),
            });
        }
        Ok(())
    }

    fn spec(&self, width: usize) -> Result<ShapeSpec, CompositionError> {
        ShapeSpec::new(&[1, width], self.element_type)
    }
}

/// Caller-supplied parameters for one linear transition.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearParameters {
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

/// Expands `widths` into `Linear + Activation` pairs closed by
/// `Linear + Softmax`, with constant-filled parameters.
pub fn mlp(config: &MlpConfig) -> Result<Sequential, CompositionError> {
    config.validate()?;
    let mut members = Vec::with_capacity(2 * config.linear_layers());
    expand(config, &config.widths, &mut std::iter::empty::<LinearParameters>(), &mut members)?;
    Ok(Sequential::new_unchecked(members))
}

/// Like [`mlp`], taking one [`LinearParameters`] per transition, in order.
pub fn mlp_with_parameters(
    config: &MlpConfig,
    parameters: Vec<LinearParameters>,
) -> Result<Sequential, CompositionError> {
    config.validate()?;
    if parameters.len() != config.linear_layers() {
        return Err(CompositionError::ParameterCount {
            expected: config.linear_layers(),
            actual: parameters.len(),
        });
    }
    let mut members = Vec::with_capacity(2 * config.linear_layers());
    expand(config, &config.widths, &mut parameters.into_iter(), &mut members)?;
    Ok(Sequential::new_unchecked(members))
}

fn expand(
    config: &MlpConfig,
    widths: &[usize],
    parameters: &mut dyn Iterator<Item = LinearParameters>,
    members: &mut Vec<Box<dyn Module>>,
) -> Result<(), CompositionError> {
    let (input, output) = (config.spec(widths[0])?, config.spec(widths[1])?);
    let linear = match parameters.next() {
        Some(p) => LinearLayer::new(config.batch_size, input, output.clone(), p.weights, p.biases)?,
        None => LinearLayer::with_constant(config.batch_size, input, output.clone())?,
    };
    members.push(Box::new(linear));

    if widths.len() == 2 {
        members.push(Box::new(SoftmaxLayer::new(config.batch_size, output)?));
        return Ok(());
    }

    members.push(Box::new(ActivationLayer::new(
        config.batch_size,
        output,
        config.activation,
    )?));
    expand(config, &widths[1..], parameters, members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModuleKind;

    fn kinds(seq: &Sequential) -> Vec<ModuleKind> {
        seq.flatten().iter().map(|m| m.kind()).collect()
    }

    #[test]
    fn three_widths() {
        let seq = mlp(&MlpConfig::new(1, DType::F32, [10, 5, 2])).unwrap();
        assert_eq!(
            kinds(&seq),
            [
                ModuleKind::Linear { in_features: 10, out_features: 5 },
                ModuleKind::Activation(ActivationKind::Relu),
                ModuleKind::Linear { in_features: 5, out_features: 2 },
                ModuleKind::Softmax { axis: 1 },
            ]
        );
        assert_eq!(seq.in_shape(), &ShapeSpec::f32(&[1, 10]).unwrap());
        assert_eq!(seq.out_shape(), &ShapeSpec::f32(&[1, 2]).unwrap());
    }

    #[test]
    fn extra_width_inserts_one_pair() {
        let seq = mlp(&MlpConfig::new(1, DType::F32, [10, 5, 2, 2])).unwrap();
        assert_eq!(
            kinds(&seq),
            [
                ModuleKind::Linear { in_features: 10, out_features: 5 },
                ModuleKind::Activation(ActivationKind::Relu),
                ModuleKind::Linear { in_features: 5, out_features: 2 },
                ModuleKind::Activation(ActivationKind::Relu),
                ModuleKind::Linear { in_features: 2, out_features: 2 },
                ModuleKind::Softmax { axis: 1 },
            ]
        );
    }

    #[test]
    fn two_widths_is_the_base_case() {
        let seq = mlp(&MlpConfig::new(3, DType::F16, [4, 4]).with_activation(ActivationKind::Tanh))
            .unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.batch_size(), 3);
        assert_eq!(seq.element_type(), DType::F16);
    }

    #[test]
    fn generated_chain_passes_the_checked_constructor() {
        let seq = mlp(&MlpConfig::new(2, DType::F32, [8, 6, 4, 3])).unwrap();
        let members: Vec<Box<dyn Module>> = seq
            .flatten()
            .into_iter()
            .map(|m| match m.kind() {
                ModuleKind::Linear { in_features, out_features } => Box::new(
                    LinearLayer::with_constant(
                        2,
                        ShapeSpec::f32(&[1, in_features]).unwrap(),
                        ShapeSpec::f32(&[1, out_features]).unwrap(),
                    )
                    .unwrap(),
                ) as Box<dyn Module>,
                ModuleKind::Activation(kind) => {
                    Box::new(ActivationLayer::new(2, m.in_shape().clone(), kind).unwrap())
                        as Box<dyn Module>
                }
                _ => Box::new(SoftmaxLayer::new(2, m.in_shape().clone()).unwrap())
                    as Box<dyn Module>,
            })
            .collect();
        assert!(Sequential::new(members).is_ok());
    }

    #[test]
    fn invalid_configs() {
        assert!(matches!(
            mlp(&MlpConfig::new(1, DType::F32, [10])),
            Err(CompositionError::InvalidWidths { .. })
        ));
        assert!(matches!(
            mlp(&MlpConfig::new(1, DType::F32, [10, 0, 2])),
            Err(CompositionError::InvalidWidths { .. })
        ));
        assert_eq!(
            mlp(&MlpConfig::new(0, DType::F32, [10, 2])).unwrap_err(),
            CompositionError::InvalidBatchSize
        );
    }

    #[test]
    fn supplied_parameters_must_cover_every_transition() {
        let config = MlpConfig::new(1, DType::F32, [3, 2, 2]);
        let one = vec![LinearParameters {
            weights: vec![0.0; 6],
            biases: vec![0.0; 2],
        }];
        assert_eq!(
            mlp_with_parameters(&config, one).unwrap_err(),
            CompositionError::ParameterCount { expected: 2, actual: 1 }
        );

        let bad_len = vec![
            LinearParameters { weights: vec![0.0; 6], biases: vec![0.0; 2] },
            LinearParameters { weights: vec![0.0; 3], biases: vec![0.0; 2] },
        ];
        assert!(matches!(
            mlp_with_parameters(&config, bad_len),
            Err(CompositionError::ParameterLength { buffer: "weights", expected: 4, actual: 3 })
        ));
    }
}
