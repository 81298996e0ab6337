use std::collections::HashMap;

use anyhow::{bail, ensure, Context, Result};
use netforge_core::{DType, TensorHandle};
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use crate::engine::{Engine, Step, StepOp};
use crate::graph::{Op, RefNetwork};
use crate::RefConfig;

/// Lowers a network definition to an [`Engine`].
pub(crate) fn compile(network: &RefNetwork, config: &RefConfig) -> Result<Engine> {
    if let Some(first) = network.diagnostics().first() {
        bail!(
            "network definition has {} problem(s), first: {first}",
            network.diagnostics().len()
        );
    }
    ensure!(!network.outputs().is_empty(), "network has no marked outputs");

    let mut constant_bytes = 0usize;
    for node in network.nodes() {
        match &node.op {
            Op::Input { name } => ensure!(
                node.dtype == DType::F32,
                "input `{name}` is {}, the reference backend only runs f32",
                node.dtype
            ),
            Op::Constant { values } => constant_bytes += values.len() * DType::F32.size_in_bytes(),
            _ => {}
        }
    }
    if let Some(limit) = config.max_constant_bytes {
        ensure!(
            constant_bytes <= limit,
            "constants need {constant_bytes} bytes, limit is {limit}"
        );
    }

    let live = live_nodes(network);
    let consumers = consumer_counts(network, &live);
    let mut fused = vec![false; network.nodes().len()];
    let mut dense = HashMap::new();
    if config.fuse_bias {
        for (idx, node) in network.nodes().iter().enumerate() {
            if !live[idx] || node.op != Op::Add {
                continue;
            }
            if let Some((mm, x, w, b)) = fusable(network, &consumers, node.inputs[0], node.inputs[1]) {
                // the bias must not widen the product
                if network.nodes()[mm.index()].shape != node.shape {
                    continue;
                }
                fused[mm.index()] = true;
                dense.insert(idx, (x, w, b));
            }
        }
    }

    let mut slots: HashMap<usize, u32> = HashMap::new();
    let mut steps = Vec::new();
    for (idx, node) in network.nodes().iter().enumerate() {
        if !live[idx] || fused[idx] {
            continue;
        }
        let shape = node
            .shape
            .clone()
            .with_context(|| format!("node {idx} has no shape"))?;
        let slot = |t: TensorHandle| {
            slots
                .get(&t.index())
                .copied()
                .with_context(|| format!("node {idx} reads unscheduled node {}", t.0))
        };

        let (op, inputs): (StepOp, SmallVec<[u32; 3]>) = match (&node.op, dense.get(&idx)) {
            (Op::Add, Some((x, w, b))) => (StepOp::Dense, smallvec![slot(*x)?, slot(*w)?, slot(*b)?]),
            (Op::Input { name }, _) => (StepOp::Input { name: name.clone() }, SmallVec::new()),
            (Op::Constant { values }, _) => (StepOp::Constant(values.clone()), SmallVec::new()),
            (Op::MatMul, _) => (StepOp::MatMul, operands(node.inputs.as_slice(), slot)?),
            (Op::Add, None) => (StepOp::Add, operands(node.inputs.as_slice(), slot)?),
            (Op::Activation(kind), _) => (StepOp::Activation(*kind), operands(node.inputs.as_slice(), slot)?),
            (Op::Softmax { axis }, _) => (StepOp::Softmax { axis: *axis }, operands(node.inputs.as_slice(), slot)?),
        };
        slots.insert(idx, steps.len() as u32);
        steps.push(Step { op, inputs, shape });
    }

    let outputs = network
        .outputs()
        .iter()
        .map(|o| {
            slots
                .get(&o.index())
                .copied()
                .with_context(|| format!("output {} was not scheduled", o.0))
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        nodes = network.nodes().len(),
        steps = steps.len(),
        fused = dense.len(),
        constant_bytes,
        "network compiled"
    );
    Engine::new(steps, outputs)
}

fn operands(
    inputs: &[TensorHandle],
    slot: impl Fn(TensorHandle) -> Result<u32>,
) -> Result<SmallVec<[u32; 3]>> {
    inputs.iter().map(|t| slot(*t)).collect()
}

/// Nodes reachable backwards from the outputs.
fn live_nodes(network: &RefNetwork) -> Vec<bool> {
    let mut live = vec![false; network.nodes().len()];
    let mut stack: Vec<TensorHandle> = network.outputs().to_vec();
    while let Some(t) = stack.pop() {
        if live[t.index()] {
            continue;
        }
        live[t.index()] = true;
        stack.extend(network.nodes()[t.index()].inputs.iter().copied());
    }
    live
}

fn consumer_counts(network: &RefNetwork, live: &[bool]) -> Vec<usize> {
    let mut counts = vec![0; network.nodes().len()];
    for (idx, node) in network.nodes().iter().enumerate() {
        if live[idx] {
            for input in &node.inputs {
                counts[input.index()] += 1;
            }
        }
    }
    for output in network.outputs() {
        counts[output.index()] += 1;
    }
    counts
}

/// `add(matmul(x, W), b)` with constant `W` and `b`, where the matmul feeds
/// nothing else. Returns `(matmul, x, W, b)`.
fn fusable(
    network: &RefNetwork,
    consumers: &[usize],
    lhs: TensorHandle,
    rhs: TensorHandle,
) -> Option<(TensorHandle, TensorHandle, TensorHandle, TensorHandle)> {
    let is_constant = |t: TensorHandle| matches!(network.node(t).map(|n| &n.op), Some(Op::Constant { .. }));
    let matmul = network.node(lhs)?;
    if matmul.op != Op::MatMul || consumers[lhs.index()] != 1 || !is_constant(rhs) {
        return None;
    }
    let (x, w) = (matmul.inputs[0], matmul.inputs[1]);
    is_constant(w).then_some((lhs, x, w, rhs))
}
