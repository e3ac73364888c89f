//! Cuantizar CLI
//!
//! # Usage
//!
//! ```bash
//! # Per-tensor weight sensitivity of every kernel layer
//! cuantizar hessian run.yaml
//!
//! # Per-channel activation sensitivity of two layers, as JSON
//! cuantizar hessian run.yaml --mode activation --granularity per-output-channel \
//!     --node conv --node dense --format json
//!
//! # Validate a run file
//! cuantizar validate run.yaml
//!
//! # List the model's nodes
//! cuantizar info run.yaml
//! ```

use clap::Parser;
use cuantizar::config::{
    apply_overrides, build_dataset, build_graph, load_config, Cli, Command, HessianArgs, InfoArgs,
    OutputFormat, ValidateArgs,
};
use cuantizar::framework::default_framework_info;
use cuantizar::hessian::{HessianInfoService, HessianMode};
use cuantizar::report::{build_report, GraphSummary};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let result = match cli.command {
        Command::Hessian(args) => run_hessian(args),
        Command::Validate(args) => run_validate(args),
        Command::Info(args) => run_info(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over the verbosity flags
fn init_tracing(verbose: bool, quiet: bool) {
    let default = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
}

fn run_hessian(args: HessianArgs) -> Result<(), String> {
    info!("Cuantizar: Hessian scores for {}", args.config.display());

    let mut spec = load_config(&args.config).map_err(|e| format!("Config error: {e}"))?;
    apply_overrides(&mut spec, &args);

    let graph = Arc::new(build_graph(&spec.model).map_err(|e| format!("Model error: {e}"))?);
    let dataset = build_dataset(&spec, &graph).map_err(|e| format!("Dataset error: {e}"))?;
    let service = HessianInfoService::new(Arc::clone(&graph), dataset)
        .with_config(spec.hessian.clone())
        .map_err(|e| format!("Config error: {e}"))?;

    let mode = HessianMode::from(args.mode);
    let nodes = if args.nodes.is_empty() {
        service.eligible_nodes(mode)
    } else {
        args.nodes
            .iter()
            .map(|name| graph.find(name))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?
    };
    if nodes.is_empty() {
        return Err(format!("model has no nodes eligible for {mode} scores"));
    }
    info!(nodes = nodes.len(), scores = args.num_scores, "scoring");

    let report = build_report(&service, &nodes, mode, args.granularity.into(), args.num_scores)
        .map_err(|e| e.to_string())?;

    match args.format {
        OutputFormat::Text => print!("{report}"),
        OutputFormat::Json => println!("{}", report.to_json().map_err(|e| e.to_string())?),
    }
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<(), String> {
    let spec = load_config(&args.config).map_err(|e| format!("Config error: {e}"))?;
    let graph = build_graph(&spec.model).map_err(|e| format!("Model error: {e}"))?;
    println!(
        "✓ {} is valid: {} node(s), {} input(s), {} output(s)",
        args.config.display(),
        graph.len(),
        graph.inputs().len(),
        graph.outputs().len()
    );
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<(), String> {
    let spec = load_config(&args.config).map_err(|e| format!("Config error: {e}"))?;
    let graph = build_graph(&spec.model).map_err(|e| format!("Model error: {e}"))?;
    let summary = GraphSummary::from_graph(&graph, default_framework_info());

    match args.format {
        OutputFormat::Text => print!("{summary}"),
        OutputFormat::Json => println!("{}", summary.to_json().map_err(|e| e.to_string())?),
    }
    Ok(())
}
