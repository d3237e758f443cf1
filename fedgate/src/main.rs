mod config;

use clap::Parser;
use config::{Config, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Federating gateway for distributed FDSN waveform archives
#[derive(Parser)]
#[command(name = "fedgate", version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = config.federator.validate() {
        tracing::error!("invalid configuration: {err}");
        return ExitCode::FAILURE;
    }

    if let Some(metrics) = &config.metrics
        && let Err(err) = init_metrics(metrics)
    {
        tracing::error!("could not install statsd metrics exporter: {err}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("could not start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(federator::run(config.federator)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn init_metrics(config: &MetricsConfig) -> Result<(), Box<dyn std::error::Error>> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(config.prefix.as_str()))?;
    metrics::set_global_recorder(recorder)?;
    Ok(())
}
