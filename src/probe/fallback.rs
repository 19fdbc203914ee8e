//! Fallback composition: try the primary pinger, shelling out only when the
//! primary lacks socket permissions.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Pinger, ProbeError, ProbeResult};

/// Wraps two pingers; the secondary runs iff the primary returned
/// `PermissionDenied`. Every other outcome of the primary — success or any
/// other failure kind — is returned verbatim.
pub struct FallbackPinger<P, S> {
    primary: P,
    secondary: S,
}

impl<P, S> FallbackPinger<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl<P: Pinger, S: Pinger> Pinger for FallbackPinger<P, S> {
    async fn ping(&self, addr: &str, timeout: Duration, cancel: &CancellationToken) -> ProbeResult {
        match self.primary.ping(addr, timeout, cancel).await {
            Err(ProbeError::PermissionDenied(_)) => {
                tracing::debug!(addr, "primary probe lacks permissions, using fallback");
                self.secondary.ping(addr, timeout, cancel).await
            }
            result => result,
        }
    }
}
