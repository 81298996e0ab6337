use std::path::PathBuf;

use clap::{Parser, Subcommand};
use netforge_core::{ActivationKind, DType};

use crate::logging::{Route, DEFAULT_LOG_FILE};

#[derive(Parser, Debug)]
#[command(name = "netforge", version, about = "Shape-checked network builder")]
pub struct Cli {
    /// Log filter (RUST_LOG syntax). Falls back to RUST_LOG, then `info`
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Also write logs to a file
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = DEFAULT_LOG_FILE)]
    pub log_file: Option<PathBuf>,

    /// Route one level to a sink, e.g. `debug=stdout` (stdout, stderr, file, off)
    #[arg(long = "log-route", global = true)]
    pub log_routes: Vec<Route>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build an MLP and write its serialized engine
    Build {
        /// Layer widths, input first
        #[arg(long, value_delimiter = ',', required = true)]
        widths: Vec<usize>,

        #[arg(long, default_value_t = 1)]
        batch_size: usize,

        #[arg(long, default_value = "f32")]
        dtype: DType,

        /// Hidden activation (relu, sigmoid or tanh)
        #[arg(long, default_value = "relu")]
        activation: ActivationKind,

        /// Output path for the engine
        #[arg(long, short, default_value = "model.nfe")]
        out: PathBuf,

        /// Keep matmul and bias as separate steps
        #[arg(long)]
        no_fuse: bool,

        #[arg(long)]
        max_constant_bytes: Option<usize>,
    },

    /// Print the steps of a serialized engine
    Inspect { engine: PathBuf },

    /// Run a serialized engine on one input
    Run {
        engine: PathBuf,

        /// Input values, comma separated
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        input: Vec<f32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tracing::Level;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_build() {
        let cli = Cli::parse_from([
            "netforge",
            "build",
            "--widths",
            "10,5,2",
            "--activation",
            "tanh",
            "--log-route",
            "debug=stdout",
        ]);
        assert_eq!(cli.log_routes[0].level, Level::DEBUG);
        match cli.command {
            Command::Build {
                widths,
                batch_size,
                dtype,
                activation,
                no_fuse,
                ..
            } => {
                assert_eq!(widths, vec![10, 5, 2]);
                assert_eq!(batch_size, 1);
                assert_eq!(dtype, DType::F32);
                assert_eq!(activation, ActivationKind::Tanh);
                assert!(!no_fuse);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn bare_log_file_uses_default_name() {
        let cli = Cli::parse_from(["netforge", "inspect", "model.nfe", "--log-file"]);
        assert_eq!(cli.log_file, Some(PathBuf::from(DEFAULT_LOG_FILE)));
    }

    #[test]
    fn run_takes_negative_inputs() {
        let cli = Cli::parse_from(["netforge", "run", "model.nfe", "--input", "-1.5,2"]);
        match cli.command {
            Command::Run { input, .. } => assert_eq!(input, vec![-1.5, 2.0]),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
