//! Subprocess probe for environments without ICMP socket access.
//!
//! Shells out to the platform ping tool with "numeric, one packet, timeout"
//! flags and parses the per-packet `time=<float> ms` from its output.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Pinger, ProbeError, ProbeResult, resolve_addr};

/// Pinger that invokes the OS ping utility.
pub struct ExternalPinger;

impl ExternalPinger {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExternalPinger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pinger for ExternalPinger {
    async fn ping(&self, addr: &str, timeout: Duration, cancel: &CancellationToken) -> ProbeResult {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        let ipv6 = resolve_addr(addr).await.map(|ip| ip.is_ipv6()).unwrap_or(false);
        let command = ping_command(ipv6);
        let args = ping_args(addr, timeout, ipv6);

        let start = Instant::now();
        let child = Command::new(command)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Cancellation kills the child via kill_on_drop. Whether the deadline
        // had already passed decides timeout vs cancelled.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return if start.elapsed() >= timeout {
                    Err(ProbeError::Timeout(timeout))
                } else {
                    Err(ProbeError::Cancelled)
                };
            }
            outcome = tokio::time::timeout(timeout, child) => match outcome {
                Err(_) => return Err(ProbeError::Timeout(timeout)),
                Ok(Err(e)) => return Err(ProbeError::Other(format!("failed to run {command}: {e}"))),
                Ok(Ok(output)) => output,
            },
        };

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(ProbeError::Other(format!(
                "{command} exited with {}: {}",
                output.status,
                stdout.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_rtt(&stdout) {
            Some(rtt) => Ok(rtt),
            // Zero exit but nothing parseable: fall back to wall-clock time.
            None => Ok(start.elapsed()),
        }
    }
}

/// macOS ships a separate ping6 binary; everywhere else ping handles both.
fn ping_command(ipv6: bool) -> &'static str {
    if cfg!(target_os = "macos") && ipv6 {
        "ping6"
    } else {
        "ping"
    }
}

/// Flags equivalent to "no name lookup, one packet, timeout".
///
/// The timeout unit differs per platform: milliseconds on macOS (minimum
/// 100), whole seconds rounded up (minimum 1) on Linux and the BSDs. macOS
/// ping6 has no `-W`; the caller's deadline covers it.
fn ping_args(addr: &str, timeout: Duration, ipv6: bool) -> Vec<String> {
    if cfg!(target_os = "macos") {
        if ipv6 {
            return vec!["-n".into(), "-c".into(), "1".into(), addr.into()];
        }
        let ms = (timeout.as_millis() as u64).max(100);
        return vec![
            "-n".into(),
            "-c".into(),
            "1".into(),
            "-W".into(),
            ms.to_string(),
            addr.into(),
        ];
    }

    let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
    vec![
        "-n".into(),
        "-c".into(),
        "1".into(),
        "-W".into(),
        secs.to_string(),
        addr.into(),
    ]
}

/// Parse `time=<float> ms` (or `time<...`) from ping output.
fn parse_rtt(output: &str) -> Option<Duration> {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    let re = TIME_RE.get_or_init(|| Regex::new(r"time[=<]([0-9.]+)\s*ms").unwrap());

    let value: f64 = re.captures(output)?.get(1)?.as_str().parse().ok()?;
    Some(Duration::from_secs_f64(value / 1000.0))
}
