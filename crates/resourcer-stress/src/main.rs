use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use resourcer_service::config::Config as ResourcerConfig;

use crate::stresstest::perform_stresstest;
use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Whether to initialize logging, with all output discarded.
    #[arg(long, default_value_t = false)]
    tracing: bool,

    /// Whether to report metrics to a local statsd sink.
    #[arg(long, default_value_t = false)]
    metrics: bool,

    /// Whether to report to a local sentry sink.
    #[arg(long, default_value_t = false)]
    sentry: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config_path = cli.config;
    let service_config = ResourcerConfig::get(config_path.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    let mut logging_guard = logging::init(logging::Config {
        backtraces: true,
        tracing: cli.tracing,
        metrics: cli.metrics,
        sentry: cli.sentry,
    })?;

    runtime.block_on(async move {
        if let Some(http_sink) = logging_guard.http_sink.take() {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = logging_guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }

        perform_stresstest(service_config, workloads, cli.duration).await
    })?;

    Ok(())
}
