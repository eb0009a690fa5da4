// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! hvsctl: replay atomic modeset scenarios against a recording HVS backend.
//!
//! Reads a JSON scenario, commits each transaction in order and prints one
//! JSON report per transaction with the hardware events it produced.

mod scenario;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hvs_atomic::KmsConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::scenario::{replay, Scenario};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Bcm2835,
    Bcm2711,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Replay atomic modeset transactions and report the hardware sequence"
)]
struct Args {
    /// Scenario file (JSON)
    scenario: PathBuf,
    /// Device preset used when neither the scenario nor --config supplies one
    #[arg(long, value_enum, default_value = "bcm2835")]
    preset: Preset,
    /// Device configuration file (JSON); overrides the preset
    #[arg(long)]
    config: Option<PathBuf>,
    /// Start with load-tracker enforcement off
    #[arg(long, default_value_t = false)]
    no_load_tracker: bool,
    /// Firmware owns the display pipeline; skip register programming
    #[arg(long, default_value_t = false)]
    firmware_kms: bool,
}

fn resolve_config(args: &Args, scenario: &Scenario) -> Result<KmsConfig> {
    let mut config = if let Some(path) = &args.config {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        KmsConfig::from_json(&bytes)?
    } else if let Some(config) = &scenario.config {
        config.clone()
    } else {
        match args.preset {
            Preset::Bcm2835 => KmsConfig::bcm2835(),
            Preset::Bcm2711 => KmsConfig::bcm2711(),
        }
    };
    if args.no_load_tracker {
        config.load_tracker_enabled = Some(false);
    }
    if args.firmware_kms {
        config.firmware_kms = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let raw = std::fs::read(&args.scenario)
        .with_context(|| format!("reading {}", args.scenario.display()))?;
    let scenario: Scenario = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing {}", args.scenario.display()))?;
    let config = resolve_config(&args, &scenario)?;
    info!(
        generation = ?config.generation,
        outputs = config.outputs.len(),
        transactions = scenario.transactions.len(),
        "replaying scenario"
    );

    let steps = replay(config, &scenario).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, &steps)?;
    writeln!(out)?;
    Ok(())
}
