use netforge_core::{ActivationKind, DType, NetworkDefinition, Shape, TensorHandle};
use smallvec::{smallvec, SmallVec};
use tracing::trace;

use crate::shapes;

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Input { name: String },
    Constant { values: Vec<f32> },
    MatMul,
    Add,
    Activation(ActivationKind),
    Softmax { axis: usize },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Constant { .. } => "constant",
            Op::MatMul => "matmul",
            Op::Add => "add",
            Op::Activation(_) => "activation",
            Op::Softmax { .. } => "softmax",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub op: Op,
    pub inputs: SmallVec<[TensorHandle; 2]>,
    /// `None` when inference failed; see the network diagnostics.
    pub shape: Option<Shape>,
    pub dtype: DType,
}

/// Network definition recorded by the reference backend.
///
/// Every node produces exactly one tensor, so a [`TensorHandle`] is the
/// index of its producing node. Nodes only reference earlier nodes, which
/// keeps the node list in evaluation order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefNetwork {
    nodes: Vec<Node>,
    outputs: Vec<TensorHandle>,
    diagnostics: Vec<String>,
}

impl RefNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, tensor: TensorHandle) -> Option<&Node> {
        self.nodes.get(tensor.index())
    }

    pub fn outputs(&self) -> &[TensorHandle] {
        &self.outputs
    }

    /// Problems found while the network was being defined. A network with
    /// diagnostics does not build.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    fn push(
        &mut self,
        op: Op,
        inputs: SmallVec<[TensorHandle; 2]>,
        shape: Result<Shape, String>,
        dtype: DType,
    ) -> TensorHandle {
        let handle = TensorHandle(self.nodes.len() as u32);
        let shape = match shape {
            Ok(shape) => Some(shape),
            Err(reason) => {
                self.diagnostics
                    .push(format!("{} node {}: {reason}", op.name(), handle.0));
                None
            }
        };
        trace!(node = handle.0, op = op.name(), shape = ?shape, "node added");
        self.nodes.push(Node {
            op,
            inputs,
            shape,
            dtype,
        });
        handle
    }

    fn operand(&self, tensor: TensorHandle) -> Result<(&Shape, DType), String> {
        let node = self
            .nodes
            .get(tensor.index())
            .ok_or_else(|| format!("unknown tensor {}", tensor.0))?;
        let shape = node
            .shape
            .as_ref()
            .ok_or_else(|| format!("tensor {} has no shape", tensor.0))?;
        Ok((shape, node.dtype))
    }

    fn binary(
        &mut self,
        op: Op,
        lhs: TensorHandle,
        rhs: TensorHandle,
        rule: fn(&[usize], &[usize]) -> Result<Shape, String>,
    ) -> TensorHandle {
        let inferred = self.operand(lhs).and_then(|(a, dtype)| {
            let (b, _) = self.operand(rhs)?;
            Ok((rule(a.dims(), b.dims())?, dtype))
        });
        let (shape, dtype) = match inferred {
            Ok((shape, dtype)) => (Ok(shape), dtype),
            Err(reason) => (Err(reason), DType::F32),
        };
        self.push(op, smallvec![lhs, rhs], shape, dtype)
    }

    fn unary(&mut self, op: Op, input: TensorHandle) -> TensorHandle {
        let (shape, dtype) = match self.operand(input) {
            Ok((shape, dtype)) => (Ok(shape.clone()), dtype),
            Err(reason) => (Err(reason), DType::F32),
        };
        self.push(op, smallvec![input], shape, dtype)
    }
}

fn add_rule(a: &[usize], b: &[usize]) -> Result<Shape, String> {
    shapes::broadcast(a, b).ok_or_else(|| {
        format!(
            "operands do not broadcast: {} + {}",
            Shape::from_slice(a),
            Shape::from_slice(b)
        )
    })
}

impl NetworkDefinition for RefNetwork {
    fn add_input(&mut self, name: &str, dtype: DType, shape: &Shape) -> TensorHandle {
        let inferred = if shape.rank() == 0 {
            Err("input must have at least one dimension".to_string())
        } else {
            Ok(shape.clone())
        };
        self.push(
            Op::Input {
                name: name.to_string(),
            },
            SmallVec::new(),
            inferred,
            dtype,
        )
    }

    fn add_constant(&mut self, shape: &Shape, values: &[f32]) -> TensorHandle {
        let inferred = if shape.numel() == values.len() {
            Ok(shape.clone())
        } else {
            Err(format!(
                "{} values do not fill shape {shape}",
                values.len()
            ))
        };
        self.push(
            Op::Constant {
                values: values.to_vec(),
            },
            SmallVec::new(),
            inferred,
            DType::F32,
        )
    }

    fn add_matmul(&mut self, lhs: TensorHandle, rhs: TensorHandle) -> TensorHandle {
        self.binary(Op::MatMul, lhs, rhs, shapes::matmul)
    }

    fn add_elementwise_add(&mut self, lhs: TensorHandle, rhs: TensorHandle) -> TensorHandle {
        self.binary(Op::Add, lhs, rhs, add_rule)
    }

    fn add_activation(&mut self, input: TensorHandle, kind: ActivationKind) -> TensorHandle {
        self.unary(Op::Activation(kind), input)
    }

    fn add_softmax(&mut self, input: TensorHandle, axis: usize) -> TensorHandle {
        let handle = self.unary(Op::Softmax { axis }, input);
        let rank = self.nodes[handle.index()].shape.as_ref().map(Shape::rank);
        if let Some(rank) = rank {
            if axis >= rank {
                self.nodes[handle.index()].shape = None;
                self.diagnostics.push(format!(
                    "softmax node {}: axis {axis} out of range for rank {rank}",
                    handle.0
                ));
            }
        }
        handle
    }

    fn mark_output(&mut self, tensor: TensorHandle) {
        if tensor.index() >= self.nodes.len() {
            self.diagnostics
                .push(format!("cannot mark unknown tensor {} as output", tensor.0));
            return;
        }
        if !self.outputs.contains(&tensor) {
            self.outputs.push(tensor);
        }
    }

    fn shape_of(&self, tensor: TensorHandle) -> Option<Shape> {
        self.nodes.get(tensor.index())?.shape.clone()
    }

    fn num_layers(&self) -> usize {
        self.nodes.len()
    }
}

impl Drop for RefNetwork {
    fn drop(&mut self) {
        trace!(nodes = self.nodes.len(), "network definition released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_linear_shapes() {
        let mut net = RefNetwork::new();
        let x = net.add_input("input", DType::F32, &Shape::from_slice(&[2, 1, 10]));
        let w = net.add_constant(&Shape::from_slice(&[1, 10, 5]), &[0.1; 50]);
        let b = net.add_constant(&Shape::from_slice(&[1, 1, 5]), &[0.0; 5]);
        let y = net.add_matmul(x, w);
        let z = net.add_elementwise_add(y, b);

        assert_eq!(net.shape_of(z).unwrap().dims(), &[2, 1, 5]);
        assert!(net.diagnostics().is_empty());
        assert_eq!(net.num_layers(), 5);
    }

    #[test]
    fn bad_operands_become_diagnostics() {
        let mut net = RefNetwork::new();
        let x = net.add_input("input", DType::F32, &Shape::from_slice(&[1, 1, 10]));
        let w = net.add_constant(&Shape::from_slice(&[1, 9, 5]), &[0.1; 45]);
        let y = net.add_matmul(x, w);
        let z = net.add_activation(y, ActivationKind::Relu);
        let short = net.add_constant(&Shape::from_slice(&[1, 3]), &[0.0; 2]);

        assert!(net.shape_of(y).is_none());
        assert!(net.shape_of(z).is_none());
        assert!(net.shape_of(short).is_none());
        assert_eq!(net.diagnostics().len(), 3);
    }

    #[test]
    fn softmax_axis_checked() {
        let mut net = RefNetwork::new();
        let x = net.add_input("input", DType::F32, &Shape::from_slice(&[1, 2]));
        let s = net.add_softmax(x, 2);
        assert!(net.shape_of(s).is_none());
        assert_eq!(net.diagnostics().len(), 1);
    }

    #[test]
    fn outputs_are_deduplicated() {
        let mut net = RefNetwork::new();
        let x = net.add_input("input", DType::F32, &Shape::from_slice(&[1, 2]));
        net.mark_output(x);
        net.mark_output(x);
        net.mark_output(TensorHandle(7));
        assert_eq!(net.outputs(), &[x]);
        assert_eq!(net.diagnostics().len(), 1);
    }
}
