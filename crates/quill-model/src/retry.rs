// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Exponential-backoff retry for transient provider failures.
//!
//! Only HTTP 408/429/5xx and network-level failures are retried; auth
//! errors, schema errors and cancellation surface immediately.  Jitter is
//! added so parallel sessions do not hammer a recovering endpoint in
//! lockstep.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::service::{is_abort_error, ProviderError};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first (default 3).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomised around the midpoint (0.0–1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let exp = base * self.backoff_multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range - jitter_range / 2.0;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// `true` when `err` is worth another attempt.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if is_abort_error(err) {
        return false;
    }
    if let Some(pe) = err.downcast_ref::<ProviderError>() {
        return pe.is_transient();
    }
    // Connection-level reqwest failures (DNS, reset, timeout) are transient.
    if let Some(re) = err.downcast_ref::<reqwest::Error>() {
        return re.is_connect() || re.is_timeout() || re.is_request();
    }
    false
}

/// Run `operation` up to `config.max_attempts` times, sleeping between
/// transient failures.  The last error is returned when attempts run out.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < config.max_attempts && is_transient(&e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient provider failure, retrying: {e:#}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
