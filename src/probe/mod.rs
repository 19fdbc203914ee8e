pub mod external;
pub mod fallback;
pub mod icmp;

pub use external::ExternalPinger;
pub use fallback::FallbackPinger;
pub use icmp::IcmpPinger;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Why a probe failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe cancelled")]
    Cancelled,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("name resolution failed: {0}")]
    ResolveFailed(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

/// Outcome of one probe: the measured RTT, or the failure kind.
pub type ProbeResult = Result<Duration, ProbeError>;

/// A single probe capability: one request/response cycle against one address.
///
/// Implementations must be cancellation-aware: once `cancel` fires, `ping`
/// returns `Err(ProbeError::Cancelled)` promptly and releases any OS
/// resources it acquired.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, addr: &str, timeout: Duration, cancel: &CancellationToken) -> ProbeResult;
}

/// Resolve an address string to an IP, preferring a literal parse.
pub(crate) async fn resolve_addr(addr: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{addr}:0"))
        .await
        .map_err(|e| ProbeError::ResolveFailed(format!("{addr}: {e}")))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::ResolveFailed(format!("no addresses found for {addr}")))
}
