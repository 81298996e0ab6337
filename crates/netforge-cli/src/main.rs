mod cli;
mod logging;

use std::path::Path;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use netforge_backend_ref::{Engine, RefBackend, RefConfig};
use netforge_core::SerializedEngine;
use netforge_modules::{mlp, MlpConfig, Module, Network};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = cli
        .log
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    logging::init(&filter, cli.log_file.as_deref(), &cli.log_routes)?;

    let result = match cli.command {
        Command::Build {
            widths,
            batch_size,
            dtype,
            activation,
            out,
            no_fuse,
            max_constant_bytes,
        } => {
            let config = MlpConfig::new(batch_size, dtype, widths).with_activation(activation);
            let backend = RefBackend::with_config(RefConfig {
                fuse_bias: !no_fuse,
                max_constant_bytes,
            });
            build(&backend, &config, &out)
        }
        Command::Inspect { engine } => load(&engine).map(|engine| println!("{engine}")),
        Command::Run { engine, input } => run(&engine, &input),
    };

    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "command failed");
    }
    result
}

fn build(backend: &RefBackend, config: &MlpConfig, out: &Path) -> Result<()> {
    let model = mlp(config).context("invalid network layout")?;
    tracing::info!(
        layers = model.flatten().len(),
        parameters = model.parameter_count(),
        input = %model.in_shape(),
        output = %model.out_shape(),
        "model composed"
    );
    for (index, layer) in model.flatten().iter().enumerate() {
        tracing::debug!(index, layer = %layer.kind(), "layer");
    }

    let network = Network::new(backend, &model, config.batch_size)?;
    let engine = network.serialize()?;
    engine.write_to(out)?;
    tracing::info!(path = %out.display(), bytes = engine.len(), "engine written");
    Ok(())
}

fn load(path: &Path) -> Result<Engine> {
    let serialized = SerializedEngine::read_from(path)?;
    Engine::deserialize(serialized.as_bytes())
        .with_context(|| format!("failed to load engine {}", path.display()))
}

fn run(path: &Path, input: &[f32]) -> Result<()> {
    let engine = load(path)?;
    ensure!(
        engine.inputs().len() == 1,
        "engine has {} inputs, `run` feeds exactly one",
        engine.inputs().len()
    );
    let outputs = engine.infer(&[input])?;
    for (shape, values) in engine.output_shapes().into_iter().zip(&outputs) {
        let rendered: Vec<String> = values.iter().map(|v| format!("{v:.6}")).collect();
        println!("{shape}: [{}]", rendered.join(", "));
    }
    Ok(())
}
