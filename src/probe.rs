//! Bounded-retry reachability probes.
//!
//! A probe is (attempts, per-attempt timeout, inter-attempt wait) around a
//! factory producing a fresh connection. The successful connection is
//! dropped immediately; reachability is all that is being measured.

use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Unreachable;

/// Shape of a probe: how often, how patiently, how spaced.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSpec {
    pub attempts: u32,
    /// Bound on a single attempt. `None` leaves the attempt to run to
    /// completion (used for tunneled dials, which fail fast on their own).
    pub timeout: Option<Duration>,
    pub wait: Duration,
}

impl ProbeSpec {
    pub const fn new(attempts: u32, timeout: Duration, wait: Duration) -> Self {
        Self {
            attempts,
            timeout: Some(timeout),
            wait,
        }
    }

    pub const fn without_timeout(attempts: u32, wait: Duration) -> Self {
        Self {
            attempts,
            timeout: None,
            wait,
        }
    }

    /// Probe with a caller-supplied connection factory.
    pub async fn run_with<F, Fut, C, E>(&self, addr: &str, mut connect: F) -> Result<(), Unreachable>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<C, E>>,
        E: std::fmt::Display,
    {
        for attempt in 1..=self.attempts {
            let result = match self.timeout {
                Some(t) => match tokio::time::timeout(t, connect()).await {
                    Ok(r) => r.map_err(|e| e.to_string()),
                    Err(_) => Err("attempt timed out".to_string()),
                },
                None => connect().await.map_err(|e| e.to_string()),
            };
            match result {
                Ok(conn) => {
                    // Closing the probe connection is the whole point.
                    drop(conn);
                    debug!(addr, attempt, "Probe succeeded");
                    return Ok(());
                }
                Err(e) => {
                    debug!(addr, attempt, error = %e, "Probe attempt failed");
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.wait).await;
            }
        }
        Err(Unreachable {
            addr: addr.to_string(),
            attempts: self.attempts,
        })
    }

    /// Direct TCP probe to `addr` (`host:port`).
    pub async fn run_tcp(&self, addr: &str) -> Result<(), Unreachable> {
        self.run_with(addr, || TcpStream::connect(addr.to_string()))
            .await
    }
}
