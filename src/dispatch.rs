//! Dispatch holder: gates the user-visible reply on the coordination
//! decision.
//!
//! Every held message carries a backstop timer, so no decision path (not
//! even a peer that never answers) leaves the user waiting indefinitely.
//! A dedup window on message id records what has already been dispatched
//! and swallows late duplicate decisions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::dedup::DedupWindow;
use crate::engine::{DecisionAction, DispatchDecision};
use crate::history::HistoryLoader;
use crate::host::{ChatPort, DispatchPayload};
use crate::prompts;

/// Observes replies that actually went out, so the engine can update its
/// advisory register.
pub trait ReplyObserver: Send + Sync {
    fn replied(&self, chat_id: &str, round_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    /// Held pending a coordination decision.
    Held,
    /// An `@`-mention named this instance; dispatched immediately,
    /// coordination skipped.
    Bypassed,
    /// An `@`-mention named another instance; dropped.
    MentionElsewhere,
    /// Already held or already dispatched.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HolderStats {
    pub held: u64,
    pub dispatched: u64,
    pub suppressed: u64,
    pub backstop_fires: u64,
    pub defer_yields: u64,
    pub decision_races: u64,
}

struct PendingDispatch {
    chat_id: String,
    text: String,
    user_id: String,
    backstop: Option<JoinHandle<()>>,
}

impl Drop for PendingDispatch {
    fn drop(&mut self) {
        if let Some(timer) = self.backstop.take() {
            timer.abort();
        }
    }
}

pub struct DispatchHolder {
    agent_name: String,
    config: DispatchConfig,
    chat: Arc<dyn ChatPort>,
    history: Arc<HistoryLoader>,
    observer: Weak<dyn ReplyObserver>,
    pending: Mutex<HashMap<String, PendingDispatch>>,
    dispatched: DedupWindow,
    stats: Mutex<HolderStats>,
    /// Handed to timer tasks; a dead upgrade means the engine is gone.
    self_ref: Weak<DispatchHolder>,
}

impl DispatchHolder {
    pub fn new(
        agent_name: String,
        config: DispatchConfig,
        chat: Arc<dyn ChatPort>,
        history: Arc<HistoryLoader>,
        observer: Weak<dyn ReplyObserver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            agent_name,
            config,
            chat,
            history,
            observer,
            pending: Mutex::new(HashMap::new()),
            dispatched: DedupWindow::new("dispatched"),
            stats: Mutex::new(HolderStats::default()),
            self_ref: weak.clone(),
        })
    }

    /// Hold a user-triggered message while a round runs. The round id
    /// equals the message id.
    pub async fn hold(&self, payload: &DispatchPayload) -> HoldOutcome {
        let message_id = &payload.message_id;
        if self.dispatched.contains(message_id) {
            debug!(message_id, "already dispatched; dropping hold");
            return HoldOutcome::Duplicate;
        }

        match mention_target(&payload.text, &self.agent_name) {
            MentionTarget::Me => {
                if self.mark_dispatched(message_id) {
                    return HoldOutcome::Duplicate;
                }
                info!(message_id, "mention bypass; dispatching without coordination");
                self.run_pipeline(
                    &payload.chat_id,
                    &payload.user_id,
                    message_id,
                    &payload.text,
                    false,
                )
                .await;
                return HoldOutcome::Bypassed;
            }
            MentionTarget::Other => {
                // Record as dispatched so a late decision is a no-op.
                self.mark_dispatched(message_id);
                debug!(message_id, "mention names another agent; dropping");
                return HoldOutcome::MentionElsewhere;
            }
            MentionTarget::None => {}
        }

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(message_id) {
                return HoldOutcome::Duplicate;
            }
            pending.insert(
                message_id.clone(),
                PendingDispatch {
                    chat_id: payload.chat_id.clone(),
                    text: payload.text.clone(),
                    user_id: payload.user_id.clone(),
                    backstop: Some(self.arm_backstop(message_id, self.config.backstop())),
                },
            );
        }
        self.stats.lock().held += 1;
        HoldOutcome::Held
    }

    /// Dispatch without holding. Used when coordination is disabled.
    pub async fn dispatch_direct(&self, payload: &DispatchPayload) {
        if self.mark_dispatched(&payload.message_id) {
            return;
        }
        self.run_pipeline(
            &payload.chat_id,
            &payload.user_id,
            &payload.message_id,
            &payload.text,
            false,
        )
        .await;
    }

    /// Apply the engine's decision for a held message.
    pub async fn apply_decision(&self, decision: DispatchDecision) {
        let message_id = decision.trigger_message_id.clone();
        if self.dispatched.contains(&message_id) {
            warn!(message_id, "dropping decision for already-dispatched message");
            self.stats.lock().decision_races += 1;
            return;
        }

        match decision.action {
            DecisionAction::Respond { synthesize_context } => {
                let Some(entry) = self.take_entry(&message_id) else {
                    warn!(message_id, "decision for unheld message; dropping");
                    return;
                };
                if self.mark_dispatched(&message_id) {
                    self.stats.lock().decision_races += 1;
                    return;
                }
                let text = match synthesize_context {
                    Some(context) => format!("{}\n\n{}", context, entry.text),
                    None => entry.text.clone(),
                };
                self.run_pipeline(
                    &entry.chat_id,
                    &entry.user_id,
                    &decision.round_id,
                    &text,
                    true,
                )
                .await;
            }
            DecisionAction::Suppress => {
                let removed = self.take_entry(&message_id).is_some();
                self.mark_dispatched(&message_id);
                self.stats.lock().suppressed += 1;
                info!(message_id, removed, "suppressed; peer covers this message");
            }
            DecisionAction::AwaitPeer {
                winner_name,
                my_proposal,
                other_proposal,
            } => {
                // Cancel the backstop but keep the entry; the wait task
                // owns the rest of this message's lifecycle.
                let armed = {
                    let mut pending = self.pending.lock();
                    match pending.get_mut(&message_id) {
                        Some(entry) => {
                            if let Some(timer) = entry.backstop.take() {
                                timer.abort();
                            }
                            true
                        }
                        None => false,
                    }
                };
                if !armed {
                    warn!(message_id, "await-peer decision for unheld message; dropping");
                    return;
                }
                let holder = self.self_ref.clone();
                let round_id = decision.round_id.clone();
                tokio::spawn(async move {
                    let Some(holder) = holder.upgrade() else {
                        return;
                    };
                    let winner_reply = holder
                        .history
                        .wait_for_summary(
                            &round_id,
                            &winner_name,
                            holder.config.synthesis_wait(),
                            holder.config.summary_poll(),
                        )
                        .await;
                    let context = match winner_reply {
                        Some(reply) => prompts::synthesis_follow_context(
                            &winner_name,
                            &reply,
                            &my_proposal,
                            &other_proposal,
                        ),
                        None => {
                            info!(round_id, winner = %winner_name, "synthesis wait timed out; falling back to parallel reply");
                            prompts::parallel_fallback_context(&my_proposal, &other_proposal)
                        }
                    };
                    holder.finish_wait(&message_id, &round_id, &context).await;
                });
            }
            DecisionAction::Defer { peer_name } => {
                let armed = {
                    let mut pending = self.pending.lock();
                    match pending.get_mut(&message_id) {
                        Some(entry) => {
                            if let Some(timer) = entry.backstop.take() {
                                timer.abort();
                            }
                            entry.backstop = Some(self.arm_defer_backstop(
                                &message_id,
                                peer_name.clone(),
                                self.config.defer_backstop(),
                            ));
                            true
                        }
                        None => false,
                    }
                };
                if !armed {
                    warn!(message_id, "defer decision for unheld message; dropping");
                }
            }
        }
    }

    /// Abort all timers and forget all held work.
    pub fn stop(&self) {
        self.pending.lock().clear();
        self.dispatched.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> HolderStats {
        *self.stats.lock()
    }

    fn arm_backstop(&self, message_id: &str, after: std::time::Duration) -> JoinHandle<()> {
        let holder = self.self_ref.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(holder) = holder.upgrade() {
                holder.on_backstop(&message_id).await;
            }
        })
    }

    fn arm_defer_backstop(
        &self,
        message_id: &str,
        peer_name: Option<String>,
        after: std::time::Duration,
    ) -> JoinHandle<()> {
        let holder = self.self_ref.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(holder) = holder.upgrade() {
                holder.on_defer_backstop(&message_id, peer_name.as_deref()).await;
            }
        })
    }

    async fn on_backstop(&self, message_id: &str) {
        let Some(entry) = self.take_entry(message_id) else {
            return;
        };
        if self.mark_dispatched(message_id) {
            return;
        }
        warn!(message_id, "backstop fired; replying with the original text");
        self.stats.lock().backstop_fires += 1;
        self.run_pipeline(&entry.chat_id, &entry.user_id, message_id, &entry.text, false)
            .await;
    }

    async fn on_defer_backstop(&self, message_id: &str, peer_name: Option<&str>) {
        let Some(entry) = self.take_entry(message_id) else {
            return;
        };
        if self.mark_dispatched(message_id) {
            return;
        }
        // Both peers may have deferred; the lexicographically smaller name
        // replies so exactly one of them does.
        let mine_to_take = peer_name.is_none_or(|peer| self.agent_name.as_str() < peer);
        if !mine_to_take {
            info!(message_id, peer = peer_name, "defer backstop yields to peer");
            self.stats.lock().defer_yields += 1;
            return;
        }
        warn!(message_id, "defer backstop fired; replying with the original text");
        self.stats.lock().backstop_fires += 1;
        self.run_pipeline(&entry.chat_id, &entry.user_id, message_id, &entry.text, false)
            .await;
    }

    async fn finish_wait(&self, message_id: &str, round_id: &str, context: &str) {
        let Some(entry) = self.take_entry(message_id) else {
            return;
        };
        if self.mark_dispatched(message_id) {
            return;
        }
        let text = format!("{}\n\n{}", context, entry.text);
        self.run_pipeline(&entry.chat_id, &entry.user_id, round_id, &text, true)
            .await;
    }

    async fn run_pipeline(
        &self,
        chat_id: &str,
        user_id: &str,
        round_id: &str,
        text: &str,
        write_summary: bool,
    ) {
        match self.chat.dispatch_reply(chat_id, text, user_id).await {
            Ok(reply) => {
                self.stats.lock().dispatched += 1;
                if write_summary {
                    // Reply first, then the summary, so the peer's
                    // synthesis wait observes a reply that exists.
                    self.history
                        .write_summary(round_id, &self.agent_name, &reply, Some(chat_id.to_string()))
                        .await;
                }
                if let Some(observer) = self.observer.upgrade() {
                    observer.replied(chat_id, round_id);
                }
            }
            Err(e) => {
                error!(round_id, error = %e, "dispatch pipeline failed");
            }
        }
    }

    fn take_entry(&self, message_id: &str) -> Option<PendingDispatch> {
        let mut entry = self.pending.lock().remove(message_id)?;
        if let Some(timer) = entry.backstop.take() {
            timer.abort();
        }
        Some(entry)
    }

    /// Returns whether the message had already been recorded as dispatched.
    fn mark_dispatched(&self, message_id: &str) -> bool {
        self.dispatched.mark(message_id, self.config.dispatched_ttl())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MentionTarget {
    None,
    Me,
    Other,
}

/// Scan for `@name` tokens. A mention of this instance wins over any
/// other mention in the same message.
fn mention_target(text: &str, my_name: &str) -> MentionTarget {
    let mut saw_other = false;
    for token in text.split_whitespace() {
        let Some(name) = token.strip_prefix('@') else {
            continue;
        };
        let name = name.trim_end_matches(|c: char| !c.is_alphanumeric());
        if name.is_empty() {
            continue;
        }
        if name.eq_ignore_ascii_case(my_name) {
            return MentionTarget::Me;
        }
        saw_other = true;
    }
    if saw_other {
        MentionTarget::Other
    } else {
        MentionTarget::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mention_target() {
        assert_eq!(mention_target("hello there", "alpha"), MentionTarget::None);
        assert_eq!(mention_target("@alpha take this", "alpha"), MentionTarget::Me);
        assert_eq!(mention_target("@Alpha, please", "alpha"), MentionTarget::Me);
        assert_eq!(mention_target("@beta take this", "alpha"), MentionTarget::Other);
        assert_eq!(
            mention_target("@beta or maybe @alpha", "alpha"),
            MentionTarget::Me
        );
        assert_eq!(mention_target("mail me @ home", "alpha"), MentionTarget::None);
    }
}
