//! Readiness polling with exponential backoff and cancellation support.
//!
//! Replaces fixed sleeps: a condition is probed until it reports ready, the
//! total wait is bounded, and a timeout is an explicit error.

use anyhow::Result;
use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for readiness polling with exponential backoff.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Initial delay between checks
    pub initial_delay: Duration,
    /// Maximum delay between checks (cap for exponential growth)
    pub max_delay: Duration,
    /// Maximum total time to wait before timeout
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

impl WaitConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Why a wait ended without the condition becoming ready
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Timeout waiting for {resource} after {elapsed:?} ({attempts} attempts){}", .last_error.as_deref().map(|e| format!(": {e}")).unwrap_or_default())]
    Timeout {
        resource: String,
        elapsed: Duration,
        attempts: u32,
        /// Error from the most recent failed probe, if any
        last_error: Option<String>,
    },

    #[error("Wait for {0} cancelled")]
    Cancelled(String),
}

/// Poll `check` until it returns `Ok(true)`.
///
/// `Ok(false)` and `Err(_)` are both treated as "not ready yet"; the last
/// error is kept for the timeout message. The delay between probes grows
/// exponentially with jitter and never overshoots the deadline.
pub async fn wait_until_ready<F, Fut>(
    config: &WaitConfig,
    cancel: &CancellationToken,
    resource_name: &str,
    mut check: F,
) -> Result<u32, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut attempts = 0u32;
    let mut last_error = None;

    let mut delays = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_factor(2.0)
        .with_jitter()
        .without_max_times()
        .build();

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled(resource_name.to_string()));
        }

        attempts += 1;
        match check().await {
            Ok(true) => {
                debug!(resource = %resource_name, attempts, "Resource ready");
                return Ok(attempts);
            }
            Ok(false) => {
                debug!(resource = %resource_name, attempt = attempts, "Resource not ready");
            }
            Err(e) => {
                debug!(resource = %resource_name, attempt = attempts, error = %e, "Readiness probe failed");
                last_error = Some(format!("{e:#}"));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout {
                resource: resource_name.to_string(),
                elapsed: now - start,
                attempts,
                last_error,
            });
        }

        let delay = delays
            .next()
            .unwrap_or(config.max_delay)
            .min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(WaitError::Cancelled(resource_name.to_string()));
            }
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
