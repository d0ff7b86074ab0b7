use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use marketmate_tools::announce::{default_catalog, generate, CommandSynthesizer};
use marketmate_tools::config::AppConfig;

/// Generate the spoken announcement clips for every classification result.
#[derive(Parser)]
#[command(name = "announce", about = "Generate announcement audio clips")]
struct Cli {
    /// Directory the clips are written to
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Path to TOML configuration file
    #[arg(long, default_value = "marketmate.toml")]
    config: PathBuf,

    /// Speaking rate in words per minute
    #[arg(long)]
    rate: Option<u32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut app_config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(out_dir) = cli.out_dir {
        app_config.announce.out_dir = out_dir;
    }
    if let Some(rate) = cli.rate {
        app_config.announce.rate = rate;
    }
    app_config.validate()?;

    let config = &app_config.announce;
    let synth = CommandSynthesizer::from_config(config);
    let clips = default_catalog();
    tracing::info!(
        "Generating {} clips into {} with {}",
        clips.len(),
        config.out_dir.display(),
        config.program
    );

    let report = generate(&clips, &synth, config)?;
    println!(
        "Generated {} of {} clips in {}",
        report.written.len(),
        clips.len(),
        config.out_dir.display()
    );
    if !report.is_complete() {
        bail!("{} clips failed", report.failed.len());
    }
    Ok(())
}
