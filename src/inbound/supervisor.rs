//! Reconnect supervision with jittered exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::BackoffConfig;

use super::reliable::{PumpEnd, ReliableInbound};

/// `delay = min(initial * factor^(attempt-1), max) * (1 + jitter * U(-1,1))`
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.factor,
            config.jitter,
        )
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        let capped = raw.min(self.max.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            capped * (1.0 + self.jitter * rand::thread_rng().gen_range(-1.0..=1.0))
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

/// Runs the inbound loop until aborted: start, wait until death, back
/// off, retry. A successful connect resets the attempt counter.
pub struct ReconnectSupervisor {
    inbound: Arc<ReliableInbound>,
    policy: BackoffPolicy,
}

impl ReconnectSupervisor {
    pub fn new(inbound: Arc<ReliableInbound>, policy: BackoffPolicy) -> Self {
        Self { inbound, policy }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match Arc::clone(&self.inbound).connect().await {
                Ok(session) => {
                    attempt = 0;
                    info!("inbound connected");
                    // pump() disconnects the stale subscription before
                    // returning, so the next connect cannot ghost.
                    match session.pump(&mut shutdown).await {
                        PumpEnd::Shutdown => break,
                        PumpEnd::Died(e) => warn!(error = %e, "inbound died"),
                    }
                }
                Err(e) => warn!(error = %e, "inbound connect failed"),
            }

            attempt += 1;
            let delay = self.policy.delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("inbound supervisor exited");
    }
}
