//! Runs the recovery batch.
//!
//! Usage: `ude_runner [config.json]`. `UDE_RUNS` and `UDE_STORE` override the run
//! count and store path; `RUST_LOG` controls log verbosity (default `info`).

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;
use ude_core::pipeline::{run_batch, PipelineConfig};

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::default(),
    };
    if let Ok(runs) = std::env::var("UDE_RUNS") {
        config.runs = runs
            .parse()
            .with_context(|| format!("UDE_RUNS must be a positive integer, got '{runs}'"))?;
    }
    if let Ok(path) = std::env::var("UDE_STORE") {
        config.store_path = path.into();
    }
    config.validate()?;

    info!(
        runs = config.runs,
        store = %config.store_path.display(),
        stream = ?config.stream,
        "starting batch"
    );
    let summary = run_batch(config)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
