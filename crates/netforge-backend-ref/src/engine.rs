//! Compiled engine: serialized layout and CPU execution.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "NFGE" | version u16 | reserved u16
//! step count u32, then per step:
//!   tag u8 | rank u8 | dims u32 * rank | input count u8 | inputs u32 * n | payload
//! output count u32 | outputs u32 * n
//! ```
//!
//! Payloads: input name (u16 length + utf-8), constant values (u32 count +
//! f32 * count), activation kind (u8), softmax axis (u8). Other steps carry
//! none.

use std::fmt;

use anyhow::{bail, ensure, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use netforge_core::{ActivationKind, SerializedEngine, Shape};
use smallvec::SmallVec;

use crate::shapes;

pub const MAGIC: &[u8; 4] = b"NFGE";
pub const FORMAT_VERSION: u16 = 1;

const TAG_INPUT: u8 = 0;
const TAG_CONSTANT: u8 = 1;
const TAG_MATMUL: u8 = 2;
const TAG_ADD: u8 = 3;
const TAG_DENSE: u8 = 4;
const TAG_ACTIVATION: u8 = 5;
const TAG_SOFTMAX: u8 = 6;

#[derive(Clone, Debug, PartialEq)]
pub enum StepOp {
    Input { name: String },
    Constant(Vec<f32>),
    MatMul,
    Add,
    /// `inputs[0] x inputs[1] + inputs[2]`.
    Dense,
    Activation(ActivationKind),
    Softmax { axis: usize },
}

impl StepOp {
    fn tag(&self) -> u8 {
        match self {
            StepOp::Input { .. } => TAG_INPUT,
            StepOp::Constant(_) => TAG_CONSTANT,
            StepOp::MatMul => TAG_MATMUL,
            StepOp::Add => TAG_ADD,
            StepOp::Dense => TAG_DENSE,
            StepOp::Activation(_) => TAG_ACTIVATION,
            StepOp::Softmax { .. } => TAG_SOFTMAX,
        }
    }

    fn arity(&self) -> usize {
        match self {
            StepOp::Input { .. } | StepOp::Constant(_) => 0,
            StepOp::Activation(_) | StepOp::Softmax { .. } => 1,
            StepOp::MatMul | StepOp::Add => 2,
            StepOp::Dense => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    pub op: StepOp,
    pub inputs: SmallVec<[u32; 3]>,
    pub shape: Shape,
}

/// A compiled network: steps in evaluation order plus the output steps.
#[derive(Clone, Debug, PartialEq)]
pub struct Engine {
    steps: Vec<Step>,
    outputs: Vec<u32>,
}

impl Engine {
    pub(crate) fn new(steps: Vec<Step>, outputs: Vec<u32>) -> Result<Self> {
        let engine = Self { steps, outputs };
        engine.validate()?;
        Ok(engine)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn outputs(&self) -> &[u32] {
        &self.outputs
    }

    /// `(name, shape)` of each input, in the order `infer` expects them.
    pub fn inputs(&self) -> Vec<(&str, &Shape)> {
        self.steps
            .iter()
            .filter_map(|s| match &s.op {
                StepOp::Input { name } => Some((name.as_str(), &s.shape)),
                _ => None,
            })
            .collect()
    }

    pub fn output_shapes(&self) -> Vec<&Shape> {
        self.outputs
            .iter()
            .map(|o| &self.steps[*o as usize].shape)
            .collect()
    }

    pub fn constant_count(&self) -> usize {
        self.steps
            .iter()
            .map(|s| match &s.op {
                StepOp::Constant(values) => values.len(),
                _ => 0,
            })
            .sum()
    }

    fn validate(&self) -> Result<()> {
        for (idx, step) in self.steps.iter().enumerate() {
            ensure!(
                step.inputs.len() == step.op.arity(),
                "step {idx} has {} inputs, expected {}",
                step.inputs.len(),
                step.op.arity()
            );
            for input in &step.inputs {
                ensure!(
                    (*input as usize) < idx,
                    "step {idx} reads step {input}, which does not precede it"
                );
            }
            match &step.op {
                StepOp::Constant(values) => ensure!(
                    values.len() == step.shape.numel(),
                    "constant step {idx} holds {} values for shape {}",
                    values.len(),
                    step.shape
                ),
                StepOp::Softmax { axis } => ensure!(
                    *axis < step.shape.rank(),
                    "softmax step {idx} axis {axis} out of range"
                ),
                _ => {}
            }
            if let Some(inferred) = self.inferred_shape(step)? {
                ensure!(
                    inferred == step.shape,
                    "step {idx} declares {}, its inputs give {inferred}",
                    step.shape
                );
            }
        }
        ensure!(!self.outputs.is_empty(), "engine has no outputs");
        for output in &self.outputs {
            ensure!(
                (*output as usize) < self.steps.len(),
                "output refers to missing step {output}"
            );
        }
        Ok(())
    }

    /// Shape implied by a step's inputs. `None` for source steps.
    fn inferred_shape(&self, step: &Step) -> Result<Option<Shape>> {
        let input = |i: usize| self.steps[step.inputs[i] as usize].shape.dims();
        let shape = match &step.op {
            StepOp::Input { .. } | StepOp::Constant(_) => return Ok(None),
            StepOp::MatMul => shapes::matmul(input(0), input(1)).map_err(anyhow::Error::msg)?,
            StepOp::Add => shapes::broadcast(input(0), input(1)).context("add operands do not broadcast")?,
            StepOp::Dense => {
                let product = shapes::matmul(input(0), input(1)).map_err(anyhow::Error::msg)?;
                ensure!(
                    shapes::broadcast(product.dims(), input(2)).as_ref() == Some(&product),
                    "dense bias widens the product"
                );
                product
            }
            StepOp::Activation(_) | StepOp::Softmax { .. } => Shape::from_slice(input(0)),
        };
        Ok(Some(shape))
    }

    pub fn serialize(&self) -> Result<SerializedEngine> {
        let mut buf = BytesMut::with_capacity(64 + 4 * self.constant_count());
        buf.put_slice(MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u16_le(0);
        buf.put_u32_le(u32::try_from(self.steps.len()).context("too many steps")?);

        for step in &self.steps {
            buf.put_u8(step.op.tag());
            buf.put_u8(u8::try_from(step.shape.rank()).context("rank does not fit in u8")?);
            for d in step.shape.dims() {
                buf.put_u32_le(u32::try_from(*d).context("dimension does not fit in u32")?);
            }
            buf.put_u8(step.inputs.len() as u8);
            for input in &step.inputs {
                buf.put_u32_le(*input);
            }
            match &step.op {
                StepOp::Input { name } => {
                    buf.put_u16_le(u16::try_from(name.len()).context("input name too long")?);
                    buf.put_slice(name.as_bytes());
                }
                StepOp::Constant(values) => {
                    buf.put_u32_le(u32::try_from(values.len()).context("constant too large")?);
                    for v in values {
                        buf.put_f32_le(*v);
                    }
                }
                StepOp::Activation(kind) => buf.put_u8(kind.tag()),
                StepOp::Softmax { axis } => buf.put_u8(*axis as u8),
                StepOp::MatMul | StepOp::Add | StepOp::Dense => {}
            }
        }

        buf.put_u32_le(self.outputs.len() as u32);
        for output in &self.outputs {
            buf.put_u32_le(*output);
        }
        SerializedEngine::new(buf.freeze())
    }

    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(raw);

        need(&buf, 8, "header")?;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        ensure!(&magic == MAGIC, "not a netforge engine (bad magic)");
        let version = buf.get_u16_le();
        ensure!(
            version == FORMAT_VERSION,
            "unsupported engine format version {version}, expected {FORMAT_VERSION}"
        );
        let _reserved = buf.get_u16_le();

        need(&buf, 4, "step count")?;
        let count = buf.get_u32_le() as usize;
        let mut steps = Vec::with_capacity(count.min(1024));
        for idx in 0..count {
            steps.push(read_step(&mut buf).with_context(|| format!("truncated or corrupt step {idx}"))?);
        }

        need(&buf, 4, "output count")?;
        let n_outputs = buf.get_u32_le() as usize;
        need(&buf, 4 * n_outputs, "outputs")?;
        let outputs = (0..n_outputs).map(|_| buf.get_u32_le()).collect();
        ensure!(!buf.has_remaining(), "{} trailing bytes after engine", buf.remaining());

        Self::new(steps, outputs)
    }

    /// Runs the engine on f32 host inputs, one slice per input in
    /// [`Engine::inputs`] order. Returns one buffer per output.
    pub fn infer(&self, inputs: &[&[f32]]) -> Result<Vec<Vec<f32>>> {
        let expected = self.inputs().len();
        ensure!(
            inputs.len() == expected,
            "expected {expected} inputs, got {}",
            inputs.len()
        );

        let mut values: Vec<Vec<f32>> = Vec::with_capacity(self.steps.len());
        let mut next_input = 0;
        for (idx, step) in self.steps.iter().enumerate() {
            let arg = |i: usize| operand(&values, &self.steps, step, i);
            let out = match &step.op {
                StepOp::Input { name } => {
                    let data = inputs[next_input];
                    next_input += 1;
                    ensure!(
                        data.len() == step.shape.numel(),
                        "input `{name}` has {} values, shape {} needs {}",
                        data.len(),
                        step.shape,
                        step.shape.numel()
                    );
                    data.to_vec()
                }
                StepOp::Constant(data) => data.clone(),
                StepOp::MatMul => {
                    let (a, sa) = arg(0);
                    let (b, sb) = arg(1);
                    matmul(a, sa, b, sb, &step.shape)
                }
                StepOp::Add => {
                    let (a, sa) = arg(0);
                    let (b, sb) = arg(1);
                    add(a, sa, b, sb, &step.shape)
                }
                StepOp::Dense => {
                    let (x, sx) = arg(0);
                    let (w, sw) = arg(1);
                    let (b, sb) = arg(2);
                    let product = matmul(x, sx, w, sw, &step.shape);
                    add(&product, &step.shape, b, sb, &step.shape)
                }
                StepOp::Activation(kind) => arg(0).0.iter().map(|v| activate(*kind, *v)).collect(),
                StepOp::Softmax { axis } => softmax(arg(0).0, &step.shape, *axis),
            };
            debug_assert_eq!(out.len(), step.shape.numel(), "step {idx}");
            values.push(out);
        }

        Ok(self
            .outputs
            .iter()
            .map(|o| values[*o as usize].clone())
            .collect())
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "netforge engine v{FORMAT_VERSION}: {} steps, {} parameters",
            self.steps.len(),
            self.constant_count()
        )?;
        for (idx, step) in self.steps.iter().enumerate() {
            let op = match &step.op {
                StepOp::Input { name } => format!("input `{name}`"),
                StepOp::Constant(_) => "constant".to_string(),
                StepOp::MatMul => "matmul".to_string(),
                StepOp::Add => "add".to_string(),
                StepOp::Dense => "dense".to_string(),
                StepOp::Activation(kind) => format!("activation {kind}"),
                StepOp::Softmax { axis } => format!("softmax axis={axis}"),
            };
            let inputs: Vec<String> = step.inputs.iter().map(|i| format!("%{i}")).collect();
            writeln!(f, "  %{idx} = {op}({}) -> {}", inputs.join(", "), step.shape)?;
        }
        let outputs: Vec<String> = self.outputs.iter().map(|o| format!("%{o}")).collect();
        write!(f, "  outputs: {}", outputs.join(", "))
    }
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    ensure!(
        buf.remaining() >= n,
        "engine truncated while reading {what}: need {n} bytes, have {}",
        buf.remaining()
    );
    Ok(())
}

fn read_step(buf: &mut Bytes) -> Result<Step> {
    need(buf, 2, "step header")?;
    let tag = buf.get_u8();
    let rank = buf.get_u8() as usize;
    need(buf, 4 * rank + 1, "step shape")?;
    let dims: SmallVec<[usize; 6]> = (0..rank).map(|_| buf.get_u32_le() as usize).collect();
    ensure!(
        dims.iter().try_fold(1usize, |n, d| n.checked_mul(*d)).is_some(),
        "step shape {:?} has more elements than fit in memory",
        dims.as_slice()
    );
    let n_inputs = buf.get_u8() as usize;
    need(buf, 4 * n_inputs, "step inputs")?;
    let inputs = (0..n_inputs).map(|_| buf.get_u32_le()).collect();

    let op = match tag {
        TAG_INPUT => {
            need(buf, 2, "input name length")?;
            let len = buf.get_u16_le() as usize;
            need(buf, len, "input name")?;
            let name = String::from_utf8(buf.split_to(len).to_vec()).context("input name is not utf-8")?;
            StepOp::Input { name }
        }
        TAG_CONSTANT => {
            need(buf, 4, "constant length")?;
            let len = buf.get_u32_le() as usize;
            need(buf, 4 * len, "constant values")?;
            StepOp::Constant((0..len).map(|_| buf.get_f32_le()).collect())
        }
        TAG_MATMUL => StepOp::MatMul,
        TAG_ADD => StepOp::Add,
        TAG_DENSE => StepOp::Dense,
        TAG_ACTIVATION => {
            need(buf, 1, "activation kind")?;
            let raw = buf.get_u8();
            let kind = ActivationKind::from_tag(raw).with_context(|| format!("unknown activation {raw}"))?;
            StepOp::Activation(kind)
        }
        TAG_SOFTMAX => {
            need(buf, 1, "softmax axis")?;
            StepOp::Softmax {
                axis: buf.get_u8() as usize,
            }
        }
        other => bail!("unknown step tag {other}"),
    };

    Ok(Step {
        op,
        inputs,
        shape: Shape(dims),
    })
}

fn operand<'a>(values: &'a [Vec<f32>], steps: &'a [Step], step: &Step, i: usize) -> (&'a [f32], &'a Shape) {
    let src = step.inputs[i] as usize;
    (&values[src], &steps[src].shape)
}

fn matmul(a: &[f32], sa: &Shape, b: &[f32], sb: &Shape, out: &Shape) -> Vec<f32> {
    let (ad, bd, od) = (sa.dims(), sb.dims(), out.dims());
    let (m, k, n) = (ad[ad.len() - 2], ad[ad.len() - 1], bd[bd.len() - 1]);
    let lead_out = &od[..od.len() - 2];
    let a_mats = shapes::broadcast_offsets(&ad[..ad.len() - 2], lead_out);
    let b_mats = shapes::broadcast_offsets(&bd[..bd.len() - 2], lead_out);

    let mut result = vec![0.0f32; out.numel()];
    for (batch, (am, bm)) in a_mats.iter().zip(&b_mats).enumerate() {
        let a = &a[am * m * k..(am + 1) * m * k];
        let b = &b[bm * k * n..(bm + 1) * k * n];
        let dst = &mut result[batch * m * n..(batch + 1) * m * n];
        for i in 0..m {
            for p in 0..k {
                let av = a[i * k + p];
                for j in 0..n {
                    dst[i * n + j] += av * b[p * n + j];
                }
            }
        }
    }
    result
}

fn add(a: &[f32], sa: &Shape, b: &[f32], sb: &Shape, out: &Shape) -> Vec<f32> {
    let ia = shapes::broadcast_offsets(sa.dims(), out.dims());
    let ib = shapes::broadcast_offsets(sb.dims(), out.dims());
    ia.iter().zip(&ib).map(|(i, j)| a[*i] + b[*j]).collect()
}

fn activate(kind: ActivationKind, v: f32) -> f32 {
    match kind {
        ActivationKind::Relu => v.max(0.0),
        ActivationKind::Sigmoid => 1.0 / (1.0 + (-v).exp()),
        ActivationKind::Tanh => v.tanh(),
    }
}

fn softmax(x: &[f32], shape: &Shape, axis: usize) -> Vec<f32> {
    let dims = shape.dims();
    let outer: usize = dims[..axis].iter().product();
    let len = dims[axis];
    let inner: usize = dims[axis + 1..].iter().product();

    let mut out = vec![0.0f32; x.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| o * len * inner + j * inner + i;
            let max = (0..len).map(|j| x[at(j)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for j in 0..len {
                let e = (x[at(j)] - max).exp();
                out[at(j)] = e;
                sum += e;
            }
            for j in 0..len {
                out[at(j)] /= sum;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(op: StepOp, inputs: &[u32], dims: &[usize]) -> Step {
        Step {
            op,
            inputs: inputs.iter().copied().collect(),
            shape: Shape::from_slice(dims),
        }
    }

    fn tiny() -> Engine {
        Engine::new(
            vec![
                step(StepOp::Input { name: "input".into() }, &[], &[1, 1, 2]),
                step(StepOp::Constant(vec![1.0, 0.0, 0.0, 1.0]), &[], &[1, 2, 2]),
                step(StepOp::Constant(vec![0.5, -0.5]), &[], &[1, 1, 2]),
                step(StepOp::Dense, &[0, 1, 2], &[1, 1, 2]),
                step(StepOp::Activation(ActivationKind::Relu), &[3], &[1, 1, 2]),
                step(StepOp::Softmax { axis: 2 }, &[4], &[1, 1, 2]),
            ],
            vec![5],
        )
        .unwrap()
    }

    #[test]
    fn serialize_then_deserialize_keeps_every_step() {
        let engine = tiny();
        let bytes = engine.serialize().unwrap();
        assert_eq!(&bytes.as_bytes()[..4], MAGIC);
        assert_eq!(Engine::deserialize(bytes.as_bytes()).unwrap(), engine);
    }

    #[test]
    fn rejects_foreign_and_truncated_buffers() {
        let bytes = tiny().serialize().unwrap();
        let raw = bytes.as_bytes();

        let err = Engine::deserialize(b"ONNX\x01\x00\x00\x00").unwrap_err();
        assert!(err.to_string().contains("bad magic"));

        let mut newer = raw.to_vec();
        newer[4] = 9;
        assert!(Engine::deserialize(&newer).is_err());

        for cut in [3, 10, raw.len() / 2, raw.len() - 1] {
            assert!(Engine::deserialize(&raw[..cut]).is_err(), "cut at {cut}");
        }

        let mut huge = BytesMut::new();
        huge.put_slice(MAGIC);
        huge.put_u16_le(FORMAT_VERSION);
        huge.put_u16_le(0);
        huge.put_u32_le(1);
        huge.put_u8(TAG_CONSTANT);
        huge.put_u8(4);
        for _ in 0..4 {
            huge.put_u32_le(u32::MAX);
        }
        huge.put_u8(0);
        huge.put_u32_le(0);
        huge.put_u32_le(1);
        huge.put_u32_le(0);
        let err = Engine::deserialize(&huge).unwrap_err();
        assert!(format!("{err:#}").contains("more elements than fit"));
    }

    #[test]
    fn validation_rejects_forward_references() {
        let err = Engine::new(
            vec![
                step(StepOp::Activation(ActivationKind::Relu), &[1], &[1, 2]),
                step(StepOp::Input { name: "input".into() }, &[], &[1, 2]),
            ],
            vec![0],
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not precede"));
    }

    #[test]
    fn infer_dense_relu_softmax() {
        let out = tiny().infer(&[&[1.0, 2.0]]).unwrap();
        // dense: [1.5, 1.5] -> relu -> softmax of equal logits
        assert_eq!(out.len(), 1);
        assert!((out[0][0] - 0.5).abs() < 1e-6);
        assert!((out[0][1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn infer_checks_input_length() {
        assert!(tiny().infer(&[&[1.0]]).is_err());
        assert!(tiny().infer(&[]).is_err());
    }

    #[test]
    fn matmul_broadcasts_batch() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0, 1.0];
        let out = matmul(
            &a,
            &Shape::from_slice(&[2, 1, 2]),
            &w,
            &Shape::from_slice(&[1, 2, 1]),
            &Shape::from_slice(&[2, 1, 1]),
        );
        assert_eq!(out, vec![3.0, 7.0]);
    }

    #[test]
    fn softmax_is_stable_and_normalized() {
        let out = softmax(&[1000.0, 1000.0, 0.0, 0.0], &Shape::from_slice(&[2, 2]), 1);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[2] - 0.5).abs() < 1e-6);

        let cols = softmax(&[0.0, 5.0, 0.0, 5.0], &Shape::from_slice(&[2, 2]), 0);
        assert_eq!(cols, vec![0.5, 0.5, 0.5, 0.5]);
    }
}
