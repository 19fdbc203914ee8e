pub mod parser;

pub use parser::{ConfigError, load_config, parse_duration};

use std::collections::HashMap;
use std::time::Duration;

/// Granularity of the metrics exposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricsMode {
    #[default]
    PerTarget,
    Aggregated,
    Both,
    /// Serve an empty body. Not accepted by the config parser; used when
    /// metrics are wired up but exposition is turned off programmatically.
    Disabled,
}

impl MetricsMode {
    /// Parse a directive/flag value. Only the three public modes are valid.
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "per-target" => Some(Self::PerTarget),
            "aggregated" => Some(Self::Aggregated),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerTarget => "per-target",
            Self::Aggregated => "aggregated",
            Self::Both => "both",
            Self::Disabled => "disabled",
        }
    }
}

/// Global settings parsed from the config file with CLI overrides applied.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalOptions {
    /// Delay between successive probes of one target.
    pub interval: Duration,
    /// Per-probe deadline; also the classification baseline.
    pub timeout: Duration,
    /// Upper bound on in-flight probes across all targets.
    pub max_concurrency: usize,
    pub metrics_mode: MetricsMode,
    /// Bind address for the metrics server; empty disables it.
    pub metrics_listen: String,
    /// Milliseconds represented by one RTT bar cell. Values <= 0 render as 10.
    pub ui_scale: i64,
    pub ui_disable: bool,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            max_concurrency: 100,
            metrics_mode: MetricsMode::PerTarget,
            metrics_listen: String::new(),
            ui_scale: 10,
            ui_disable: false,
        }
    }
}

/// A single target definition from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    /// Unique key across the store and scheduler tables.
    pub name: String,
    /// ICMP destination (IP literal or hostname).
    pub address: String,
    /// Display bucket; empty means the default group.
    pub group: String,
    /// Open-ended options for forward compatibility.
    pub options: HashMap<String, String>,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            group: String::new(),
            options: HashMap::new(),
        }
    }
}

/// The parsed configuration file.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub global: GlobalOptions,
    pub targets: Vec<TargetConfig>,
}

/// Optional CLI values that override config file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub max_concurrency: Option<usize>,
    pub metrics_mode: Option<MetricsMode>,
    pub metrics_listen: Option<String>,
    pub ui_disable: Option<bool>,
}

impl CliOverrides {
    pub(crate) fn apply(&self, global: &mut GlobalOptions) {
        if let Some(interval) = self.interval {
            global.interval = interval;
        }
        if let Some(timeout) = self.timeout {
            global.timeout = timeout;
        }
        if let Some(max_concurrency) = self.max_concurrency {
            global.max_concurrency = max_concurrency;
        }
        if let Some(mode) = self.metrics_mode {
            global.metrics_mode = mode;
        }
        if let Some(ref listen) = self.metrics_listen {
            global.metrics_listen = parser::normalize_listen(listen);
        }
        if let Some(ui_disable) = self.ui_disable {
            global.ui_disable = ui_disable;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_global_options() {
        let global = GlobalOptions::default();
        assert_eq!(global.interval, Duration::from_secs(1));
        assert_eq!(global.timeout, Duration::from_secs(1));
        assert_eq!(global.max_concurrency, 100);
        assert_eq!(global.metrics_mode, MetricsMode::PerTarget);
        assert!(global.metrics_listen.is_empty());
        assert_eq!(global.ui_scale, 10);
        assert!(!global.ui_disable);
    }

    #[test]
    fn metrics_mode_parsing() {
        assert_eq!(MetricsMode::from_str("per-target"), Some(MetricsMode::PerTarget));
        assert_eq!(MetricsMode::from_str("aggregated"), Some(MetricsMode::Aggregated));
        assert_eq!(MetricsMode::from_str("both"), Some(MetricsMode::Both));
        assert_eq!(MetricsMode::from_str("disabled"), None);
        assert_eq!(MetricsMode::from_str(""), None);
    }

    #[test]
    fn overrides_apply_selectively() {
        let mut global = GlobalOptions::default();
        let overrides = CliOverrides {
            timeout: Some(Duration::from_millis(250)),
            metrics_listen: Some("9100".to_string()),
            ..Default::default()
        };
        overrides.apply(&mut global);

        assert_eq!(global.timeout, Duration::from_millis(250));
        assert_eq!(global.metrics_listen, ":9100");
        // Untouched fields keep their defaults.
        assert_eq!(global.interval, Duration::from_secs(1));
        assert_eq!(global.max_concurrency, 100);
    }
}
