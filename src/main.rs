//! UsbSleuth: USB mass-storage history from offline Windows evidence.
//!
//! Thin binary entry point. All logic lives in the `usbsleuth-core` crate.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use usbsleuth_core::{run, write_report, ReportFormat, RunConfig};

#[derive(Debug, Parser)]
#[command(name = "usbsleuth", version, about)]
struct Cli {
    /// Directory holding the hives (SYSTEM, SOFTWARE, NTUSER.DAT) and
    /// setupapi logs. Searched recursively.
    #[arg(short = 'r', long = "registry", value_name = "DIR")]
    registry: Option<PathBuf>,

    /// Write the report to this file instead of the console.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Report format. Requires --output.
    #[arg(short, long, value_enum)]
    format: Option<Format>,

    /// Treat the evidence as coming from this Windows version (e.g. 5.1,
    /// 6.1) when choosing the install-log grammar.
    #[arg(long = "os-version", value_name = "VERSION")]
    os_version: Option<String>,

    /// JSON configuration file. Command-line flags take precedence.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the run summary as JSON on stderr when done.
    #[arg(long)]
    summary: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Csv,
    Json,
}

impl From<Format> for ReportFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Text => ReportFormat::Text,
            Format::Csv => ReportFormat::Csv,
            Format::Json => ReportFormat::Json,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;
    tracing::info!("UsbSleuth starting on {}", config.input.display());

    let outcome = run(&config)
        .with_context(|| format!("correlation over {} failed", config.input.display()))?;

    match (&cli.output, cli.format) {
        (Some(path), format) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            let format = format.map(ReportFormat::from).unwrap_or_default();
            write_report(format, &outcome.devices, BufWriter::new(file))
                .with_context(|| format!("cannot write report to {}", path.display()))?;
            tracing::info!("report written to {}", path.display());
        }
        (None, Some(_)) => bail!("--format needs --output"),
        (None, None) => {
            write_report(ReportFormat::Text, &outcome.devices, io::stdout().lock())
                .context("cannot write report to stdout")?;
        }
    }

    for skipped in &outcome.summary.skipped {
        tracing::warn!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    if cli.summary {
        eprintln!("{}", serde_json::to_string_pretty(&outcome.summary)?);
    }
    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<RunConfig> {
    let mut config = match &cli.config {
        Some(path) => RunConfig::from_json_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(dir) = &cli.registry {
        config.input = dir.clone();
    }
    if cli.os_version.is_some() {
        config.os_version_override = cli.os_version.clone();
    }
    if config.input.as_os_str().is_empty() {
        bail!("no evidence directory: pass --registry or set \"input\" in the config file");
    }
    Ok(config)
}
