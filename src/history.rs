//! Best-effort context loads around the shared coordination stream.
//!
//! Everything here degrades gracefully: a failed read becomes an empty
//! string, a failed write is logged and forgotten. Nothing in this module
//! may block a round from resolving.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::HistoryConfig;
use crate::host::{CoordReads, ResponseSummary};
use crate::protocol::{self, RecordBody};

pub struct HistoryLoader {
    reads: Arc<dyn CoordReads>,
    config: HistoryConfig,
}

impl HistoryLoader {
    pub fn new(reads: Arc<dyn CoordReads>, config: HistoryConfig) -> Self {
        Self { reads, config }
    }

    /// Project prior negotiation rounds into prompt context, skipping the
    /// current round. Bounded by `max_rounds` and `max_chars`.
    pub async fn coordination_history(&self, exclude_round_id: &str) -> String {
        let messages = match self.reads.recent_coordination(self.config.max_records).await {
            Ok(messages) => messages,
            Err(e) => {
                debug!(error = %e, "coordination history unavailable");
                return String::new();
            }
        };

        // Group parseable records by round, preserving arrival order.
        let mut rounds: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        for message in &messages {
            let Some(record) = protocol::parse_record(&message.content) else {
                continue;
            };
            let Some(round_id) = record.round_id.clone() else {
                continue;
            };
            if round_id == exclude_round_id {
                continue;
            }
            let line = match &record.body {
                RecordBody::RoundStart {
                    trigger_content, ..
                } => format!("  trigger: {}", truncate_chars(trigger_content, 120)),
                RecordBody::MicroPropose { proposal } => format!(
                    "  {} proposed {} (confidence {:.2})",
                    message.speaker, proposal.angle, proposal.confidence
                ),
                RecordBody::Resolved {
                    mode,
                    winner,
                    reason,
                    ..
                } => format!("  resolved {}: winner {} ({})", mode, winner, reason),
                _ => continue,
            };
            if !rounds.contains_key(&round_id) {
                order.push(round_id.clone());
            }
            rounds.entry(round_id).or_default().push(line);
        }

        // Keep the most recent rounds.
        let kept: Vec<&String> = order
            .iter()
            .rev()
            .take(self.config.max_rounds)
            .collect();

        let mut out = String::new();
        for round_id in kept.into_iter().rev() {
            let mut block = format!("round {}\n", round_id);
            for line in &rounds[round_id] {
                block.push_str(line);
                block.push('\n');
            }
            for summary in self.summaries(round_id).await {
                block.push_str(&format!(
                    "  {} replied: {}\n",
                    summary.speaker,
                    truncate_chars(&summary.content, 120)
                ));
            }
            if out.chars().count() + block.chars().count() > self.config.max_chars {
                break;
            }
            out.push_str(&block);
        }
        out
    }

    /// Recent replies by every other agent discovered in the summary sink,
    /// bounded per agent and in total.
    pub async fn recent_peer_replies(&self, source_chat_id: &str, my_name: &str) -> String {
        let speakers = match self.reads.known_speakers().await {
            Ok(speakers) => speakers,
            Err(e) => {
                debug!(error = %e, "peer discovery unavailable");
                return String::new();
            }
        };

        let mut out = String::new();
        for speaker in speakers.iter().filter(|s| s.as_str() != my_name) {
            let replies = match self
                .reads
                .recent_bot_replies(source_chat_id, speaker, self.config.replies_per_agent)
                .await
            {
                Ok(replies) => replies,
                Err(e) => {
                    debug!(speaker, error = %e, "peer replies unavailable");
                    continue;
                }
            };
            for reply in replies {
                let line = format!(
                    "{}: {}\n",
                    speaker,
                    truncate_chars(&reply, self.config.reply_max_chars)
                );
                if out.chars().count() + line.chars().count() > self.config.replies_max_chars {
                    return out;
                }
                out.push_str(&line);
            }
        }
        out
    }

    /// Fire-and-forget write so the peer's synthesis wait can observe the
    /// reply. Content is truncated to the sink cap.
    pub async fn write_summary(
        &self,
        round_id: &str,
        speaker: &str,
        content: &str,
        source_chat_id: Option<String>,
    ) {
        let summary = ResponseSummary {
            round_id: round_id.to_string(),
            speaker: speaker.to_string(),
            content: truncate_chars(content, self.config.summary_max_chars),
            source_chat_id,
            created_at: Utc::now(),
        };
        if let Err(e) = self.reads.write_summary(summary).await {
            warn!(round_id, error = %e, "response summary write failed");
        }
    }

    /// Poll the sink until a summary by `speaker` shows up for `round_id`,
    /// or the timeout elapses.
    pub async fn wait_for_summary(
        &self,
        round_id: &str,
        speaker: &str,
        timeout: Duration,
        poll_every: Duration,
    ) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for summary in self.summaries(round_id).await {
                if summary.speaker == speaker {
                    return Some(summary.content);
                }
            }
            if tokio::time::Instant::now() + poll_every > deadline {
                return None;
            }
            tokio::time::sleep(poll_every).await;
        }
    }

    async fn summaries(&self, round_id: &str) -> Vec<ResponseSummary> {
        match self.reads.summaries_for(round_id).await {
            Ok(summaries) => summaries,
            Err(e) => {
                debug!(round_id, error = %e, "summary sink unavailable");
                Vec::new()
            }
        }
    }
}

/// Char-boundary-safe prefix truncation.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
