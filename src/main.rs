use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use marketmate_tools::config::AppConfig;
use marketmate_tools::convert::convert;

/// Convert a trained ResNet18 produce classifier checkpoint to ONNX.
#[derive(Parser)]
#[command(
    name = "marketmate-tools",
    version,
    about = "Convert a ResNet18 checkpoint to an ONNX model"
)]
struct Cli {
    /// Trained checkpoint (.pth, .pt or Burn .mpk)
    checkpoint: PathBuf,

    /// Where to write the ONNX model
    output: PathBuf,

    /// Number of output classes the checkpoint was trained with
    class_count: Option<usize>,

    /// Path to TOML configuration file
    #[arg(long, default_value = "marketmate.toml")]
    config: PathBuf,

    /// Override the ONNX opset version
    #[arg(long)]
    opset: Option<i64>,

    /// Keep batch normalization as separate nodes
    #[arg(long)]
    no_fold: bool,

    /// Run a forward pass and compare it with the traced output shape
    #[arg(long)]
    verify_forward: bool,

    /// Key the state dict is nested under inside the checkpoint
    #[arg(long)]
    top_level_key: Option<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            eprintln!("Conversion failed. See error messages above.");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut app_config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Apply CLI overrides
    let config = &mut app_config.convert;
    if let Some(class_count) = cli.class_count {
        config.class_count = class_count;
    }
    if let Some(opset) = cli.opset {
        config.export.opset = opset;
    }
    if cli.no_fold {
        config.export.fold_batch_norm = false;
    }
    if cli.verify_forward {
        config.export.verify_forward = true;
    }
    if cli.top_level_key.is_some() {
        config.checkpoint.top_level_key = cli.top_level_key;
    }

    println!("Starting model conversion process...");
    let report = convert(&cli.checkpoint, &cli.output, config)?;

    println!(
        "ONNX model created successfully: {} ({:.2} MB)",
        report.output.display(),
        report.size_mb()
    );
    println!(
        "{} classes, {} parameters, {} nodes, opset {}",
        report.class_count, report.parameter_count, report.node_count, report.opset
    );
    println!("Conversion completed successfully!");
    Ok(())
}
