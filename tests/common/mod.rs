//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::time::Duration;

use chorus::config::ChorusConfig;
use chorus::engine::Sidecar;
use chorus::host::memory::MemoryHub;

/// Config with timers shrunk so negotiation rounds settle in tens of
/// milliseconds. The orderings the engine relies on are preserved:
/// cleanup > round deadline, backstop > round deadline.
pub fn test_config(name: &str) -> ChorusConfig {
    let mut config = ChorusConfig::default();
    config.agent.name = name.to_string();
    config.coordination.max_round_ms = 400;
    config.coordination.cleanup_ms = 2_000;
    config.inbound.poll_interval_ms = 100;
    config.dispatch.backstop_ms = 1_500;
    config.dispatch.defer_backstop_ms = 300;
    config.dispatch.synthesis_wait_ms = 1_500;
    config.dispatch.summary_poll_ms = 50;
    config.gateway.timeout_ms = 500;
    config.backoff.initial_ms = 50;
    config.backoff.max_ms = 200;
    config
}

/// Start a sidecar and wait for its fast path to come up.
pub async fn start_agent(hub: &MemoryHub, name: &str) -> Sidecar {
    let sidecar = Sidecar::start(test_config(name), hub.ports_for(name))
        .expect("test config must validate");
    let hub = hub.clone();
    let name = name.to_string();
    wait_until(
        move || hub.has_subscription(&name),
        Duration::from_secs(2),
        "fast path did not connect",
    )
    .await;
    sidecar
}

/// Poll a condition until it holds or the timeout expires.
pub async fn wait_until(
    mut condition: impl FnMut() -> bool,
    timeout: Duration,
    what: &str,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn proposal_json(angle: &str, confidence: f64, covers: &[&str]) -> String {
    format!(
        r#"{{"angle": "{}", "confidence": {}, "covers": [{}], "solo_sufficient": true}}"#,
        angle,
        confidence,
        covers
            .iter()
            .map(|c| format!(r#""{}""#, c))
            .collect::<Vec<_>>()
            .join(", ")
    )
}
