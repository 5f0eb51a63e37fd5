//! End-to-end negotiation scenarios over the in-memory host.

mod common;

use std::time::Duration;

use chorus::engine::CoordinationEngine;
use chorus::filter::Mode;
use chorus::host::memory::MemoryHub;
use chorus::host::DispatchPayload;
use chorus::protocol::{self, CoordRecord, MicroProposal, PeerChat, RecordBody};

use common::{proposal_json, start_agent, test_config, wait_until};

fn resolved_records(hub: &MemoryHub) -> Vec<(String, Mode, String, Option<String>)> {
    hub.coord_posts()
        .iter()
        .filter_map(|(speaker, content)| {
            let record = protocol::parse_record(content)?;
            match record.body {
                RecordBody::Resolved {
                    mode,
                    winner,
                    runner_up,
                    ..
                } => Some((speaker.clone(), mode, winner, runner_up)),
                _ => None,
            }
        })
        .collect()
}

fn micro_proposals_from(hub: &MemoryHub, speaker: &str) -> usize {
    hub.coord_posts()
        .iter()
        .filter(|(s, content)| {
            s == speaker
                && protocol::parse_record(content)
                    .is_some_and(|r| matches!(r.body, RecordBody::MicroPropose { .. }))
        })
        .count()
}

#[tokio::test]
async fn test_clear_solo_only_winner_replies() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;
    let beta = start_agent(&hub, "beta").await;
    hub.script_gateway("alpha", Some(&proposal_json("perf", 0.85, &["latency"])));
    hub.script_gateway("beta", Some(&proposal_json("perf", 0.40, &["latency"])));

    hub.user_message("c-1", "u-1", "why is the app slow?");

    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 1,
            Duration::from_secs(3),
            "winner reply",
        )
        .await;
    }
    {
        let beta_engine = beta.engine().clone();
        wait_until(
            move || beta_engine.holder().stats().suppressed == 1,
            Duration::from_secs(3),
            "runner-up suppression",
        )
        .await;
    }

    let replies = hub.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].agent, "alpha");
    assert!(replies[0].text.starts_with("[coordination resolved"));
    assert!(replies[0].text.contains("why is the app slow?"));

    // Suppression cancelled beta's backstop; no late reply shows up.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(hub.replies().len(), 1);

    // Both peers resolved to the same verdict.
    let resolved = resolved_records(&hub);
    assert_eq!(resolved.len(), 2);
    for (_, mode, winner, runner_up) in &resolved {
        assert_eq!(*mode, Mode::Solo);
        assert_eq!(winner, "alpha");
        assert_eq!(runner_up.as_deref(), Some("beta"));
    }

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test]
async fn test_near_tie_breaks_to_lexicographic_winner() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;
    let beta = start_agent(&hub, "beta").await;
    // |delta| = 0.005 < epsilon: beta's nominal lead does not count.
    hub.script_gateway("alpha", Some(&proposal_json("x", 0.70, &[])));
    hub.script_gateway("beta", Some(&proposal_json("y", 0.705, &[])));

    hub.user_message("c-1", "u-1", "pick one of the options");

    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 1,
            Duration::from_secs(3),
            "tie-break reply",
        )
        .await;
    }
    assert_eq!(hub.replies()[0].agent, "alpha");
    for (_, _, winner, _) in &resolved_records(&hub) {
        assert_eq!(winner, "alpha");
    }

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test]
async fn test_parallel_both_reply_on_distinct_angles() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;
    let beta = start_agent(&hub, "beta").await;
    hub.script_gateway("alpha", Some(&proposal_json("security review", 0.80, &[])));
    hub.script_gateway("beta", Some(&proposal_json("perf tuning", 0.75, &[])));

    hub.user_message("c-1", "u-1", "audit the deployment setup");

    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 2,
            Duration::from_secs(3),
            "both parallel replies",
        )
        .await;
    }

    let replies = hub.replies();
    let alpha_reply = replies.iter().find(|r| r.agent == "alpha").unwrap();
    let beta_reply = replies.iter().find(|r| r.agent == "beta").unwrap();
    // Each instance sees the other's angle in its context prefix.
    assert!(alpha_reply.text.contains("perf tuning"));
    assert!(beta_reply.text.contains("security review"));

    for (_, mode, _, _) in &resolved_records(&hub) {
        assert_eq!(*mode, Mode::Parallel);
    }

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test]
async fn test_synthesis_runner_up_builds_on_winner_reply() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;
    let beta = start_agent(&hub, "beta").await;
    hub.script_gateway(
        "alpha",
        Some(
            r#"{"angle": "caching strategy", "confidence": 0.82, "covers": ["cache"],
                "solo_sufficient": true, "builds_on_other": true}"#,
        ),
    );
    hub.script_gateway(
        "beta",
        Some(
            r#"{"angle": "caching strategy", "confidence": 0.78, "covers": ["cache"],
                "solo_sufficient": true}"#,
        ),
    );

    let message_id = hub.user_message("c-1", "u-1", "design the cache layer");

    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 2,
            Duration::from_secs(5),
            "winner then runner-up replies",
        )
        .await;
    }

    let replies = hub.replies();
    // Winner went first with the leader context.
    assert_eq!(replies[0].agent, "alpha");
    assert!(replies[0].text.contains("you go first"));
    // The runner-up waited for the winner's summary and built on it.
    assert_eq!(replies[1].agent, "beta");
    assert!(replies[1].text.contains("build on that reply"));
    assert!(replies[1].text.contains("alpha already replied"));
    assert!(!replies[1].text.contains("did not arrive"));

    // The winner's summary landed in the sink under the round id.
    let summaries = hub.summaries();
    assert!(
        summaries
            .iter()
            .any(|s| s.round_id == message_id && s.speaker == "alpha")
    );

    for (_, mode, winner, _) in &resolved_records(&hub) {
        assert_eq!(*mode, Mode::Synthesis);
        assert_eq!(winner, "alpha");
    }

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test]
async fn test_generator_failure_fails_open_with_original_text() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;
    let beta = start_agent(&hub, "beta").await;
    // alpha's gateway produces nothing; beta proposes normally but its
    // round deadline fires with only one proposal present.
    hub.script_gateway("beta", Some(&proposal_json("perf", 0.8, &[])));

    hub.user_message("c-1", "u-1", "is the cluster healthy?");

    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 2,
            Duration::from_secs(5),
            "both fail-open replies",
        )
        .await;
    }

    for reply in hub.replies() {
        // Fail-open replies carry the original text, no prefix.
        assert_eq!(reply.text, "is the cluster healthy?");
    }
    assert_eq!(micro_proposals_from(&hub, "alpha"), 0);
    assert_eq!(micro_proposals_from(&hub, "beta"), 1);
    assert!(alpha.engine().stats().fail_opens >= 1);
    assert!(beta.engine().stats().fail_opens >= 1);

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test]
async fn test_duplicate_delivery_dispatches_once() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;
    hub.script_gateway("alpha", Some(&proposal_json("perf", 0.8, &[])));

    let message_id = hub.user_message("c-1", "u-1", "one and only one reply please");

    // Single agent: the round deadline fires with no peer and fails open.
    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 1,
            Duration::from_secs(3),
            "single reply",
        )
        .await;
    }

    // Reconnection replay of the same logical event.
    hub.replay_dispatch("alpha", "c-1", "u-1", "one and only one reply please", &message_id);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(hub.replies().len(), 1);

    // The durable row ended up handled exactly once.
    let rows = hub.rows();
    assert!(
        rows.iter()
            .all(|row| row.status == chorus::host::RowStatus::Handled)
    );

    alpha.stop().await;
}

#[tokio::test]
async fn test_safety_net_poll_delivers_without_fast_path() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;
    hub.script_gateway("alpha", Some(&proposal_json("perf", 0.8, &[])));

    // Row only; no realtime event. The 100 ms poll claims and delivers.
    hub.row_only("c-1", "u-1", "poll path should find this");

    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 1,
            Duration::from_secs(3),
            "poll-path reply",
        )
        .await;
    }
    assert!(
        hub.rows()
            .iter()
            .all(|row| row.status == chorus::host::RowStatus::Handled)
    );

    alpha.stop().await;
}

#[tokio::test]
async fn test_pre_boot_rows_are_quarantined() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;

    hub.stale_row(
        "alpha",
        "m-old",
        chrono::Utc::now() - chrono::Duration::hours(1),
    );

    {
        let hub = hub.clone();
        wait_until(
            move || {
                hub.rows()
                    .iter()
                    .all(|row| row.status == chorus::host::RowStatus::Handled)
            },
            Duration::from_secs(3),
            "stale row quarantine",
        )
        .await;
    }
    // Quarantined, never delivered.
    assert!(hub.replies().is_empty());
    assert_eq!(alpha.engine().stats().rounds_started, 0);

    alpha.stop().await;
}

#[tokio::test]
async fn test_supervisor_reconnects_after_fast_path_death() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;

    hub.kill_subscription("alpha");
    {
        let hub = hub.clone();
        wait_until(
            move || hub.has_subscription("alpha"),
            Duration::from_secs(3),
            "reconnect",
        )
        .await;
    }

    // The reconnected fast path still delivers.
    hub.script_gateway("alpha", Some(&proposal_json("perf", 0.8, &[])));
    hub.user_message("c-1", "u-1", "still alive?");
    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 1,
            Duration::from_secs(3),
            "post-reconnect reply",
        )
        .await;
    }

    alpha.stop().await;
}

#[tokio::test]
async fn test_mention_bypass_skips_coordination() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;
    let beta = start_agent(&hub, "beta").await;

    hub.user_message("c-1", "u-1", "@alpha what do you think?");

    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 1,
            Duration::from_secs(3),
            "mention bypass reply",
        )
        .await;
    }
    let replies = hub.replies();
    assert_eq!(replies[0].agent, "alpha");
    // No context prefix and no negotiation took place.
    assert_eq!(replies[0].text, "@alpha what do you think?");
    assert_eq!(alpha.engine().stats().rounds_started, 0);
    assert_eq!(beta.engine().stats().rounds_started, 0);
    assert!(hub.coord_posts().is_empty());

    // Nothing fires later on beta's side either.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(hub.replies().len(), 1);

    alpha.stop().await;
    beta.stop().await;
}

fn peer_proposal(confidence: f64) -> MicroProposal {
    MicroProposal {
        angle: "perf".to_string(),
        confidence,
        covers: vec!["latency".to_string()],
        solo_sufficient: true,
        builds_on_other: None,
    }
}

fn late_trigger(message_id: &str, text: &str) -> DispatchPayload {
    DispatchPayload {
        chat_id: "c-1".to_string(),
        text: text.to_string(),
        speaker: "user".to_string(),
        user_id: "u-1".to_string(),
        message_id: message_id.to_string(),
    }
}

/// Drive a full peer-led round to resolution before the local copy of the
/// trigger arrives, so the terminal decision lands on an unheld message.
async fn settle_round_before_hold(engine: &CoordinationEngine, text: &str) {
    engine
        .handle_coordination("beta", CoordRecord::round_start("beta", "m-1", "m-1", text))
        .await;
    engine
        .handle_coordination(
            "beta",
            CoordRecord::micro_propose("beta", "m-1", peer_proposal(0.40)),
        )
        .await;
}

#[tokio::test]
async fn test_trigger_held_after_round_settled_defers_then_replies() {
    let hub = MemoryHub::new();
    let engine = CoordinationEngine::new(test_config("alpha"), hub.ports_for("alpha"));
    hub.script_gateway("alpha", Some(&proposal_json("perf", 0.85, &["latency"])));

    settle_round_before_hold(&engine, "why is the app slow?").await;
    // The terminal decision already fired against an unheld message.
    assert!(hub.replies().is_empty());

    engine
        .handle_dispatch(late_trigger("m-1", "why is the app slow?"))
        .await;
    assert_eq!(engine.holder().pending_count(), 1);

    // alpha sorts before beta, so the defer backstop dispatches.
    {
        let hub = hub.clone();
        wait_until(
            move || hub.replies().len() == 1,
            Duration::from_secs(2),
            "defer backstop reply",
        )
        .await;
    }
    assert_eq!(hub.replies()[0].text, "why is the app slow?");
}

#[tokio::test]
async fn test_trigger_held_after_round_settled_yields_to_smaller_peer() {
    let hub = MemoryHub::new();
    let engine = CoordinationEngine::new(test_config("zeta"), hub.ports_for("zeta"));
    hub.script_gateway("zeta", Some(&proposal_json("perf", 0.85, &["latency"])));

    settle_round_before_hold(&engine, "why is the app slow?").await;
    engine
        .handle_dispatch(late_trigger("m-1", "why is the app slow?"))
        .await;

    // zeta sorts after beta: the defer backstop yields instead of replying.
    {
        let holder = engine.holder().clone();
        wait_until(
            move || holder.stats().defer_yields == 1,
            Duration::from_secs(2),
            "defer yield",
        )
        .await;
    }
    assert!(hub.replies().is_empty());
    assert_eq!(engine.holder().pending_count(), 0);
}

#[tokio::test]
async fn test_peer_chat_reply_is_depth_capped_and_addressed() {
    let hub = MemoryHub::new();
    let alpha = start_agent(&hub, "alpha").await;
    let beta_ports = hub.ports_for("beta");

    // A question addressed to alpha gets a gateway-authored reply.
    hub.script_gateway("alpha", Some("sure, I can take the migration part."));
    let question = chorus::protocol::CoordRecord::new(
        "beta",
        None,
        RecordBody::Question(PeerChat {
            to: Some("alpha".to_string()),
            content: "can you take the migration part?".to_string(),
            expects_reply: Some(true),
            depth: Some(0),
        }),
    );
    beta_ports
        .chat
        .post_coordination(&question.to_json())
        .await
        .unwrap();

    {
        let engine = alpha.engine().clone();
        wait_until(
            move || engine.stats().peer_chat_replies == 1,
            Duration::from_secs(3),
            "peer chat reply",
        )
        .await;
    }
    let reply = hub
        .coord_posts()
        .iter()
        .filter_map(|(s, c)| (s == "alpha").then(|| protocol::parse_record(c)).flatten())
        .find_map(|record| match record.body {
            RecordBody::Inform(chat) => Some(chat),
            _ => None,
        })
        .expect("alpha posts an inform record");
    assert_eq!(reply.to.as_deref(), Some("beta"));
    assert_eq!(reply.depth, Some(1));

    // At the depth cap the conversation is cut off.
    let deep = chorus::protocol::CoordRecord::new(
        "beta",
        None,
        RecordBody::Question(PeerChat {
            to: Some("alpha".to_string()),
            content: "still there?".to_string(),
            expects_reply: Some(true),
            depth: Some(6),
        }),
    );
    beta_ports.chat.post_coordination(&deep.to_json()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alpha.engine().stats().peer_chat_replies, 1);

    alpha.stop().await;
}
