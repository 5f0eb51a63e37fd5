//! Configuration surface for a sidecar instance.
//!
//! All sections carry serde defaults so an absent or partial `config.toml`
//! yields a runnable configuration. `validate()` collects every violation
//! before rejecting, so operators see the full list at once.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ChorusError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    pub agent: AgentConfig,
    pub coordination: CoordinationConfig,
    pub filter: FilterConfig,
    pub inbound: InboundConfig,
    pub dispatch: DispatchConfig,
    pub gateway: GatewayConfig,
    pub peer_chat: PeerChatConfig,
    pub history: HistoryConfig,
    pub backoff: BackoffConfig,
}

impl ChorusConfig {
    /// Load from `config.toml` under `dir`, falling back to defaults when
    /// the file is absent.
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("config.toml");
        let config: Self = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| ChorusError::Config(e.to_string()))?;
        fs::write(dir.join("config.toml"), content).await?;
        Ok(())
    }

    /// Validate values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.agent.name.is_empty() {
            errors.push("agent.name must not be empty");
        }

        if self.coordination.max_round_ms == 0 {
            errors.push("coordination.max_round_ms must be greater than 0");
        }
        // Cleanup must outlive the round deadline or live rounds get reaped.
        if self.coordination.cleanup_ms <= self.coordination.max_round_ms {
            errors.push("coordination.cleanup_ms must exceed coordination.max_round_ms");
        }

        for (name, value) in [
            ("filter.confidence_gap", self.filter.confidence_gap),
            ("filter.overlap", self.filter.overlap),
            ("filter.high", self.filter.high),
            ("filter.low", self.filter.low),
            ("filter.synth", self.filter.synth),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(match name {
                    "filter.confidence_gap" => "filter.confidence_gap must be between 0.0 and 1.0",
                    "filter.overlap" => "filter.overlap must be between 0.0 and 1.0",
                    "filter.high" => "filter.high must be between 0.0 and 1.0",
                    "filter.low" => "filter.low must be between 0.0 and 1.0",
                    _ => "filter.synth must be between 0.0 and 1.0",
                });
            }
        }
        if self.filter.epsilon <= 0.0 {
            errors.push("filter.epsilon must be greater than 0");
        }

        if self.inbound.poll_interval_ms == 0 {
            errors.push("inbound.poll_interval_ms must be greater than 0");
        }
        if self.inbound.dedup_id_ttl_ms < self.inbound.poll_interval_ms {
            errors.push("inbound.dedup_id_ttl_ms must be at least inbound.poll_interval_ms");
        }

        if self.dispatch.backstop_ms == 0 {
            errors.push("dispatch.backstop_ms must be greater than 0");
        }
        if self.dispatch.summary_poll_ms == 0 {
            errors.push("dispatch.summary_poll_ms must be greater than 0");
        }

        if self.gateway.inflight_max == 0 {
            errors.push("gateway.inflight_max must be greater than 0");
        }
        if self.peer_chat.inflight_max == 0 {
            errors.push("peer_chat.inflight_max must be greater than 0");
        }
        if self.peer_chat.depth_cap == 0 {
            errors.push("peer_chat.depth_cap must be greater than 0");
        }

        if self.backoff.factor < 1.0 {
            errors.push("backoff.factor must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            errors.push("backoff.jitter must be between 0.0 and 1.0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ChorusError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// This instance's agent name; also the address on the dispatch stream.
    pub name: String,
    /// When false, held messages dispatch immediately without negotiation.
    pub coordination_enabled: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "chorus".to_string(),
            coordination_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Round deadline. Must strictly exceed the slowest proposal path.
    pub max_round_ms: u64,
    /// Round-state eviction. Must exceed `max_round_ms`.
    pub cleanup_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_round_ms: 15_000,
            cleanup_ms: 30_000,
        }
    }
}

impl CoordinationConfig {
    pub fn max_round(&self) -> Duration {
        Duration::from_millis(self.max_round_ms)
    }

    pub fn cleanup(&self) -> Duration {
        Duration::from_millis(self.cleanup_ms)
    }
}

/// Thresholds for the pure proposal filter. Both peers must run identical
/// values or they disagree on mode and winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub confidence_gap: f64,
    pub overlap: f64,
    pub high: f64,
    pub low: f64,
    pub synth: f64,
    pub epsilon: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            confidence_gap: 0.3,
            overlap: 0.5,
            high: 0.5,
            low: 0.3,
            synth: 0.7,
            epsilon: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// Safety-net poll cadence over the durable row store.
    pub poll_interval_ms: u64,
    /// No-op query cadence keeping the upstream session warm.
    pub health_interval_ms: u64,
    /// Id-window TTL; must cover the inbound staleness horizon.
    pub dedup_id_ttl_ms: u64,
    /// Content-window TTL catching same-payload rows under distinct ids.
    pub dedup_content_ttl_ms: u64,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            health_interval_ms: 60_000,
            dedup_id_ttl_ms: 720_000,
            dedup_content_ttl_ms: 5_000,
        }
    }
}

impl InboundConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn id_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_id_ttl_ms)
    }

    pub fn content_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_content_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Backstop on a held message: fire means reply with the original text.
    pub backstop_ms: u64,
    /// Backstop armed by a defer decision.
    pub defer_backstop_ms: u64,
    /// How long a synthesis runner-up waits for the winner's reply.
    pub synthesis_wait_ms: u64,
    /// Cadence for polling the response-summary sink during that wait.
    pub summary_poll_ms: u64,
    /// TTL of the dispatched window suppressing late duplicate decisions.
    pub dispatched_ttl_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backstop_ms: 10_000,
            defer_backstop_ms: 8_000,
            synthesis_wait_ms: 15_000,
            summary_poll_ms: 500,
            dispatched_ttl_ms: 60_000,
        }
    }
}

impl DispatchConfig {
    pub fn backstop(&self) -> Duration {
        Duration::from_millis(self.backstop_ms)
    }

    pub fn defer_backstop(&self) -> Duration {
        Duration::from_millis(self.defer_backstop_ms)
    }

    pub fn synthesis_wait(&self) -> Duration {
        Duration::from_millis(self.synthesis_wait_ms)
    }

    pub fn summary_poll(&self) -> Duration {
        Duration::from_millis(self.summary_poll_ms)
    }

    pub fn dispatched_ttl(&self) -> Duration {
        Duration::from_millis(self.dispatched_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Concurrent coordination-path gateway calls.
    pub inflight_max: usize,
    pub timeout_ms: u64,
    /// Retries after the first failed attempt, at doubled timeout.
    pub retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            inflight_max: 3,
            timeout_ms: 15_000,
            retries: 1,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerChatConfig {
    /// Concurrent free-form peer-chat gateway calls.
    pub inflight_max: usize,
    /// Maximum reply chain depth before the conversation is cut off.
    pub depth_cap: u32,
    /// Prefix length of the content fingerprint used for dedup.
    pub dedup_prefix_chars: usize,
}

impl Default for PeerChatConfig {
    fn default() -> Self {
        Self {
            inflight_max: 2,
            depth_cap: 6,
            dedup_prefix_chars: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Coordination records scanned per history load.
    pub max_records: usize,
    /// Rounds projected into the proposal prompt.
    pub max_rounds: usize,
    /// Character cap on the projected coordination history.
    pub max_chars: usize,
    /// Recent replies pulled per discovered peer.
    pub replies_per_agent: usize,
    /// Character cap per pulled reply.
    pub reply_max_chars: usize,
    /// Character cap across all pulled replies.
    pub replies_max_chars: usize,
    /// Character cap on a written response summary.
    pub summary_max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_records: 50,
            max_rounds: 5,
            max_chars: 8_000,
            replies_per_agent: 2,
            reply_max_chars: 500,
            replies_max_chars: 4_000,
            summary_max_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 2_000,
            max_ms: 60_000,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ChorusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_cleanup_must_exceed_round_deadline() {
        let mut config = ChorusConfig::default();
        config.coordination.cleanup_ms = config.coordination.max_round_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cleanup_ms"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = ChorusConfig::default();
        config.agent.name = String::new();
        config.filter.overlap = 1.5;
        config.backoff.factor = 0.5;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("agent.name"));
        assert!(err.contains("filter.overlap"));
        assert!(err.contains("backoff.factor"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ChorusConfig = toml::from_str(
            r#"
            [agent]
            name = "alpha"

            [filter]
            overlap = 0.6
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.name, "alpha");
        assert!((config.filter.overlap - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.coordination.max_round_ms, 15_000);
        assert_eq!(config.gateway.inflight_max, 3);
    }
}
