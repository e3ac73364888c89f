//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! cuantizar hessian run.yaml
//! cuantizar hessian run.yaml --mode activation --granularity per-output-channel
//! cuantizar hessian run.yaml --node conv --node dense --num-scores 4 --format json
//! cuantizar validate run.yaml
//! cuantizar info run.yaml
//! ```

use crate::hessian::{HessianInfoGranularity, HessianMode};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cuantizar: Hessian-trace sensitivity for post-training quantization
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "cuantizar")]
#[command(version)]
#[command(about = "Hessian-trace sensitivity scores for post-training quantization")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Compute sensitivity scores for the model in a run file
    Hessian(HessianArgs),

    /// Validate a run file and build its graph
    Validate(ValidateArgs),

    /// List the nodes of a run file's model
    Info(InfoArgs),
}

/// Arguments for the hessian command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct HessianArgs {
    /// Path to YAML run file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Differentiate w.r.t. weights or activations
    #[arg(short, long, default_value = "weights")]
    pub mode: ModeArg,

    /// Score granularity
    #[arg(short, long, default_value = "per-tensor")]
    pub granularity: GranularityArg,

    /// Scores per node (one representative batch each)
    #[arg(short, long, default_value = "1")]
    pub num_scores: usize,

    /// Restrict to these nodes (default: every eligible node)
    #[arg(long = "node", value_name = "NAME")]
    pub nodes: Vec<String>,

    /// Override the iteration cap
    #[arg(long)]
    pub iterations: Option<usize>,

    /// Override the estimator seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to YAML run file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

/// Arguments for the info command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InfoArgs {
    /// Path to YAML run file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format of reports
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {s}. Valid formats: text, json")),
        }
    }
}

/// `--mode` values
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ModeArg {
    #[default]
    Weights,
    Activation,
}

impl std::str::FromStr for ModeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "weights" | "weight" => Ok(ModeArg::Weights),
            "activation" | "activations" => Ok(ModeArg::Activation),
            _ => Err(format!("Unknown mode: {s}. Valid modes: weights, activation")),
        }
    }
}

impl From<ModeArg> for HessianMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Weights => HessianMode::Weights,
            ModeArg::Activation => HessianMode::Activation,
        }
    }
}

/// `--granularity` values
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum GranularityArg {
    #[default]
    PerTensor,
    PerOutputChannel,
    PerElement,
}

impl std::str::FromStr for GranularityArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "per-tensor" | "tensor" => Ok(GranularityArg::PerTensor),
            "per-output-channel" | "per-channel" | "channel" => Ok(GranularityArg::PerOutputChannel),
            "per-element" | "element" => Ok(GranularityArg::PerElement),
            _ => Err(format!(
                "Unknown granularity: {s}. Valid values: per-tensor, per-output-channel, per-element"
            )),
        }
    }
}

impl From<GranularityArg> for HessianInfoGranularity {
    fn from(arg: GranularityArg) -> Self {
        match arg {
            GranularityArg::PerTensor => HessianInfoGranularity::PerTensor,
            GranularityArg::PerOutputChannel => HessianInfoGranularity::PerOutputChannel,
            GranularityArg::PerElement => HessianInfoGranularity::PerElement,
        }
    }
}

/// Parse command-line arguments
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Apply command-line overrides to a run specification
pub fn apply_overrides(spec: &mut super::RunSpec, args: &HessianArgs) {
    if let Some(iterations) = args.iterations {
        spec.hessian.num_iterations = iterations;
    }
    if let Some(seed) = args.seed {
        spec.hessian.seed = Some(seed);
    }
}
