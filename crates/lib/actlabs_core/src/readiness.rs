//! Bounded polling of a freshly deployed workload's health endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spacing between readiness probes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// One readiness check against a URL.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// `Ok(())` when the endpoint answered 200.
    async fn probe(&self, url: &str) -> Result<(), String>;
}

/// Unauthenticated HTTP GET probe.
pub struct HttpReadinessProbe {
    client: Client,
}

impl HttpReadinessProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn probe(&self, url: &str) -> Result<(), String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(format!("server is not up, status {}", resp.status()))
        }
    }
}

/// Result of waiting for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Answered 200 on the given attempt (1-based).
    Ready { attempt: u32 },
    /// Every attempt failed.
    TimedOut { attempts: u32 },
    /// Stopped by the cancellation token.
    Cancelled,
}

/// Polls a readiness URL up to `max_attempts` times, `interval` apart.
#[derive(Clone)]
pub struct ReadinessPoller {
    probe: Arc<dyn ReadinessProbe>,
    interval: Duration,
    max_attempts: u32,
}

impl ReadinessPoller {
    pub fn new(probe: Arc<dyn ReadinessProbe>, interval: Duration, max_attempts: u32) -> Self {
        Self {
            probe,
            interval,
            max_attempts,
        }
    }

    /// Poller spending at most `wait` at the standard [`PROBE_INTERVAL`]
    /// (180 s → 36 attempts).
    pub fn with_wait_budget(probe: Arc<dyn ReadinessProbe>, wait: Duration) -> Self {
        let attempts =
            u32::try_from(wait.as_secs() / PROBE_INTERVAL.as_secs()).unwrap_or(u32::MAX);
        Self::new(probe, PROBE_INTERVAL, attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Probe `url` until it answers 200, attempts run out, or `cancel` fires.
    pub async fn wait_until_ready(&self, url: &str, cancel: &CancellationToken) -> Readiness {
        info!(url, max_attempts = self.max_attempts, "waiting for server to come up");
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Readiness::Cancelled;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Readiness::Cancelled,
                outcome = self.probe.probe(url) => outcome,
            };
            match outcome {
                Ok(()) => {
                    info!(url, attempt, "server is up and running");
                    return Readiness::Ready { attempt };
                }
                Err(e) => debug!(url, attempt, error = %e, "server not ready"),
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Readiness::Cancelled,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }
        Readiness::TimedOut {
            attempts: self.max_attempts,
        }
    }
}
