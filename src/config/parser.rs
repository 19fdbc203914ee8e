//! Line-oriented config file parser.
//!
//! Grammar:
//! - blank lines are ignored
//! - `# deadman: key=value ...` (or a bare `deadman:` prefix) sets global
//!   options; any other `#` line is a comment
//! - `---` (optionally followed by a name) starts a new target group
//! - anything else is `NAME ADDRESS [KEY=VALUE ...]`

use std::fs;
use std::path::Path;
use std::time::Duration;

use super::{CliOverrides, Config, GlobalOptions, MetricsMode, TargetConfig};

const DIRECTIVE_PREFIX: &str = "deadman:";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Parse(String),
}

fn parse_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Parse(msg.into())
}

/// Parse a config file and apply CLI overrides on top.
///
/// Any error leaves the caller's previous configuration untouched; no partial
/// config is ever returned.
pub fn load_config(path: impl AsRef<Path>, overrides: &CliOverrides) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(path)?;
    let mut config = parse_config(&text)?;
    overrides.apply(&mut config.global);
    Ok(config)
}

/// Parse config file contents (without overrides).
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    let mut group_index = 0usize;
    let mut current_group = String::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('#') {
            let rest = rest.trim_start();
            if rest.starts_with(DIRECTIVE_PREFIX) {
                apply_directive(&mut config.global, parse_directive(rest)?)?;
            }
            continue;
        }

        if line.starts_with(DIRECTIVE_PREFIX) {
            apply_directive(&mut config.global, parse_directive(line)?)?;
            continue;
        }

        if let Some(rest) = line.strip_prefix("---") {
            group_index += 1;
            let name = rest.trim();
            current_group = if name.is_empty() {
                format!("group-{group_index}")
            } else {
                name.to_string()
            };
            continue;
        }

        config.targets.push(parse_target_line(line, &current_group)?);
    }

    Ok(config)
}

/// Extract `key=value` pairs from a directive line (with or without the
/// leading `#`).
fn parse_directive(line: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let payload = line
        .strip_prefix(DIRECTIVE_PREFIX)
        .ok_or_else(|| parse_err(format!("not a directive line: {line:?}")))?
        .trim();

    let mut pairs = Vec::new();
    for token in payload.split_whitespace() {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| parse_err(format!("invalid directive token: {token:?}")))?;
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

fn apply_directive(global: &mut GlobalOptions, pairs: Vec<(String, String)>) -> Result<(), ConfigError> {
    for (key, value) in pairs {
        match key.as_str() {
            "interval" => {
                global.interval = parse_duration(&value)
                    .map_err(|e| parse_err(format!("invalid interval: {e}")))?;
            }
            "timeout" => {
                global.timeout = parse_duration(&value)
                    .map_err(|e| parse_err(format!("invalid timeout: {e}")))?;
            }
            "max_concurrency" => {
                global.max_concurrency = value
                    .parse::<usize>()
                    .map_err(|e| parse_err(format!("invalid max_concurrency: {e}")))?;
            }
            "metrics.mode" => {
                global.metrics_mode = MetricsMode::from_str(&value)
                    .ok_or_else(|| parse_err(format!("invalid metrics.mode: {value:?}")))?;
            }
            "metrics.listen" => {
                global.metrics_listen = normalize_listen(&value);
            }
            "ui.scale" => {
                global.ui_scale = value
                    .parse::<i64>()
                    .map_err(|e| parse_err(format!("invalid ui.scale: {e}")))?;
            }
            "ui.disable" => {
                global.ui_disable = parse_bool(&value)
                    .ok_or_else(|| parse_err(format!("invalid ui.disable: {value:?}")))?;
            }
            // Unknown keys are ignored for forward compatibility.
            _ => {}
        }
    }
    Ok(())
}

/// Parse one `NAME ADDRESS [KEY=VALUE ...]` line.
fn parse_target_line(line: &str, group: &str) -> Result<TargetConfig, ConfigError> {
    let mut fields = line.split_whitespace();
    let name = fields.next();
    let address = fields.next();
    let (Some(name), Some(address)) = (name, address) else {
        return Err(parse_err(format!("invalid target line: {line:?}")));
    };

    let mut target = TargetConfig::new(name, address);
    target.group = group.to_string();

    for field in fields {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| parse_err(format!("invalid target option: {field:?}")))?;
        target.options.insert(key.to_string(), value.to_string());
    }

    Ok(target)
}

/// A listen value made of digits only is shorthand for `:<port>`.
pub(crate) fn normalize_listen(value: &str) -> String {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        format!(":{value}")
    } else {
        value.to_string()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parse a duration string such as `300ms`, `1.5s`, `2m` or `1m30s`.
///
/// Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. A bare number without a unit
/// is an error. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s.starts_with('-') {
        return Err(format!("negative duration: {input:?}"));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration: {input:?}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid duration: {input:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = match unit {
            "ns" => 1e-9,
            "us" | "\u{b5}s" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in duration: {input:?}")),
            _ => return Err(format!("unknown unit {unit:?} in duration: {input:?}")),
        };
        total += Duration::from_secs_f64(value * scale);
    }

    Ok(total)
}
