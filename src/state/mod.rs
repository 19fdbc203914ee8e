pub mod store;

pub use store::{HISTORY_SIZE, Store};

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Target health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// No probe has completed since the target was created.
    #[default]
    Unknown,
    Ok,
    Warn,
    Down,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Unknown => "UNKNOWN",
            Status::Ok => "OK",
            Status::Warn => "WARN",
            Status::Down => "DOWN",
        };
        f.write_str(s)
    }
}

/// A single RTT measurement from a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    pub at: DateTime<Utc>,
    pub rtt: Duration,
}

/// Current state and bounded history for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub name: String,
    pub address: String,
    pub group: String,
    /// RTT of the most recent successful probe; zero before the first one.
    pub last_rtt: Duration,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_ok: u32,
    pub consecutive_ng: u32,
    pub total_success: u64,
    pub total_failure: u64,
    pub status: Status,
    /// Successful samples only, oldest first, at most `HISTORY_SIZE` entries.
    pub history: VecDeque<RttSample>,
}

impl TargetStatus {
    pub(crate) fn new(name: impl Into<String>, address: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            group: group.into(),
            last_rtt: Duration::ZERO,
            last_success_at: None,
            last_failure_at: None,
            consecutive_ok: 0,
            consecutive_ng: 0,
            total_success: 0,
            total_failure: 0,
            status: Status::Unknown,
            history: VecDeque::new(),
        }
    }

    /// Mean RTT over the full history; falls back to `last_rtt` when no
    /// samples have been recorded yet.
    pub fn average_rtt(&self) -> Duration {
        if self.history.is_empty() {
            return self.last_rtt;
        }
        let sum: Duration = self.history.iter().map(|p| p.rtt).sum();
        sum / self.history.len() as u32
    }

    /// Failure share over the target's lifetime, in percent.
    pub fn loss_percent(&self) -> f64 {
        let total = self.total_success + self.total_failure;
        if total == 0 {
            return 0.0;
        }
        self.total_failure as f64 / total as f64 * 100.0
    }
}
