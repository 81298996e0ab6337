use anyhow::{Context, Result};
use netforge_backend_ref::{Engine, RefBackend, RefConfig, StepOp};
use netforge_core::{ActivationKind, Backend, DType, NetworkDefinition, Shape};

fn define(backend: &RefBackend) -> Result<netforge_backend_ref::RefNetwork> {
    let mut net = backend.create_network()?;
    let x = net.add_input("input", DType::F32, &Shape::from_slice(&[2, 1, 3]));
    let w = net.add_constant(&Shape::from_slice(&[1, 3, 2]), &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    let b = net.add_constant(&Shape::from_slice(&[1, 1, 2]), &[0.0, -10.0]);
    let y = net.add_matmul(x, w);
    let z = net.add_elementwise_add(y, b);
    let a = net.add_activation(z, ActivationKind::Relu);
    net.mark_output(a);
    Ok(net)
}

#[test]
fn build_load_and_run() -> Result<()> {
    let backend = RefBackend::new();
    let net = define(&backend)?;
    let config = backend.create_config()?;
    let serialized = backend.build_serialized(&net, &config)?;

    let engine = Engine::deserialize(serialized.as_bytes())?;
    let inputs = engine.inputs();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].0, "input");
    assert_eq!(engine.output_shapes()[0].dims(), &[2, 1, 2]);
    assert!(engine.steps().iter().any(|s| s.op == StepOp::Dense));

    let out = engine.infer(&[&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]])?;
    let out = out.first().context("missing output")?;
    // rows: [1+3, 2+3-10] and [4+6, 5+6-10]
    assert_eq!(out, &vec![4.0, 0.0, 10.0, 1.0]);
    Ok(())
}

#[test]
fn identical_definitions_give_identical_bytes() -> Result<()> {
    let backend = RefBackend::new();
    let config = backend.create_config()?;
    let first = backend.build_serialized(&define(&backend)?, &config)?;
    let second = backend.build_serialized(&define(&backend)?, &config)?;
    assert_eq!(first.as_bytes(), second.as_bytes());
    assert_eq!(backend.networks_created(), 2);
    Ok(())
}

#[test]
fn network_limit_refuses_new_definitions() -> Result<()> {
    let backend = RefBackend::new().with_network_limit(1);
    let held = backend.create_network()?;
    let err = backend.create_network().unwrap_err();
    assert!(err.to_string().contains("network limit"));
    assert_eq!(backend.networks_created(), 1);

    drop(held);
    assert!(backend.create_network().is_err());
    assert_eq!(backend.networks_created(), 1);
    Ok(())
}

#[test]
fn configured_limits_reach_build() -> Result<()> {
    let backend = RefBackend::with_config(RefConfig {
        fuse_bias: true,
        max_constant_bytes: Some(4),
    });
    let net = define(&backend)?;
    let config = backend.create_config()?;
    let err = backend.build_serialized(&net, &config).unwrap_err();
    assert!(err.to_string().contains("limit is 4"));
    Ok(())
}

#[test]
fn display_lists_steps() -> Result<()> {
    let backend = RefBackend::new();
    let serialized = backend.build_serialized(&define(&backend)?, &backend.create_config()?)?;
    let text = Engine::deserialize(serialized.as_bytes())?.to_string();
    assert!(text.starts_with("netforge engine v1"));
    assert!(text.contains("dense(%0, %1, %2)"));
    assert!(text.contains("activation relu"));
    Ok(())
}
