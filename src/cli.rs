use clap::Parser;
use std::time::Duration;

use crate::config::{CliOverrides, MetricsMode};

/// Host liveness monitor: pings a configured set of targets and shows their
/// health in a TUI and on a Prometheus metrics endpoint.
#[derive(Parser, Debug, Clone)]
#[command(name = "deadman")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the config file
    #[arg(value_name = "CONFIG")]
    pub config: String,

    /// Ping interval per target in seconds (override config)
    #[arg(short = 'i', long = "interval")]
    pub interval: Option<f64>,

    /// Ping timeout in seconds (override config)
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<f64>,

    /// Max concurrent pings (override config)
    #[arg(long = "max-concurrency")]
    pub max_concurrency: Option<usize>,

    /// Metrics mode: per-target, aggregated or both (override config)
    #[arg(long = "metrics-mode", value_parser = parse_metrics_mode)]
    pub metrics_mode: Option<MetricsMode>,

    /// Metrics listen address, e.g. :9100 (override config)
    #[arg(long = "metrics-listen")]
    pub metrics_listen: Option<String>,

    /// Disable the TUI (log-style output only)
    #[arg(long = "no-ui")]
    pub no_ui: bool,
}

fn parse_metrics_mode(value: &str) -> Result<MetricsMode, String> {
    MetricsMode::from_str(value)
        .ok_or_else(|| format!("expected per-target, aggregated or both, got {value:?}"))
}

impl Args {
    /// Collect the flags that override config file values.
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            interval: self.interval.map(Duration::from_secs_f64),
            timeout: self.timeout.map(Duration::from_secs_f64),
            max_concurrency: self.max_concurrency,
            metrics_mode: self.metrics_mode,
            metrics_listen: self.metrics_listen.clone(),
            ui_disable: self.no_ui.then_some(true),
        }
    }
}
