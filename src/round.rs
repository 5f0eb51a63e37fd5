//! Per-round negotiation state and its store.
//!
//! One `RoundState` exists per round id; `resolved` only moves false to
//! true; a peer proposal arriving before ours is buffered in
//! `other_proposal`, never dropped. Timer handles live in the state so
//! resolving or evicting a round reliably cancels them.

use std::collections::HashMap;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::protocol::MicroProposal;

#[derive(Debug)]
pub struct RoundState {
    pub round_id: String,
    pub trigger_message_id: String,
    pub trigger_content: String,
    pub source_chat_id: Option<String>,
    pub my_proposal: Option<MicroProposal>,
    pub other_proposal: Option<MicroProposal>,
    pub other_name: Option<String>,
    /// Context loaded once at round start.
    pub coord_history: String,
    pub recent_peer_replies: String,
    pub resolved: bool,
    pub started_at: Instant,
    pub deadline_timer: Option<JoinHandle<()>>,
    pub cleanup_timer: Option<JoinHandle<()>>,
}

impl RoundState {
    pub fn new(round_id: &str, trigger_message_id: &str, trigger_content: &str) -> Self {
        Self {
            round_id: round_id.to_string(),
            trigger_message_id: trigger_message_id.to_string(),
            trigger_content: trigger_content.to_string(),
            source_chat_id: None,
            my_proposal: None,
            other_proposal: None,
            other_name: None,
            coord_history: String::new(),
            recent_peer_replies: String::new(),
            resolved: false,
            started_at: Instant::now(),
            deadline_timer: None,
            cleanup_timer: None,
        }
    }

    pub fn with_source_chat(mut self, chat_id: Option<String>) -> Self {
        self.source_chat_id = chat_id;
        self
    }

    /// Both proposals present and the round not yet terminal.
    pub fn ready_to_resolve(&self) -> bool {
        !self.resolved && self.my_proposal.is_some() && self.other_proposal.is_some()
    }

    /// Transition to terminal. Returns false if already resolved; the
    /// deadline timer is cancelled either way.
    pub fn resolve(&mut self) -> bool {
        if let Some(timer) = self.deadline_timer.take() {
            timer.abort();
        }
        if self.resolved {
            return false;
        }
        self.resolved = true;
        true
    }

    pub fn cancel_timers(&mut self) {
        if let Some(timer) = self.deadline_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.cleanup_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for RoundState {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

/// Round states keyed by round id. Lives inside the engine's single
/// execution domain; no interior locking of its own.
#[derive(Debug, Default)]
pub struct RoundStore {
    rounds: HashMap<String, RoundState>,
}

impl RoundStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, enforcing one state per round id. Returns false (and leaves
    /// the existing state untouched) when the round already exists.
    pub fn insert(&mut self, state: RoundState) -> bool {
        if self.rounds.contains_key(&state.round_id) {
            return false;
        }
        self.rounds.insert(state.round_id.clone(), state);
        true
    }

    pub fn get(&self, round_id: &str) -> Option<&RoundState> {
        self.rounds.get(round_id)
    }

    pub fn get_mut(&mut self, round_id: &str) -> Option<&mut RoundState> {
        self.rounds.get_mut(round_id)
    }

    pub fn contains(&self, round_id: &str) -> bool {
        self.rounds.contains_key(round_id)
    }

    pub fn remove(&mut self, round_id: &str) -> Option<RoundState> {
        self.rounds.remove(round_id)
    }

    pub fn any_unresolved(&self) -> bool {
        self.rounds.values().any(|round| !round.resolved)
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Drop every round, cancelling all timers.
    pub fn clear(&mut self) {
        self.rounds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_state_per_round_id() {
        let mut store = RoundStore::new();
        assert!(store.insert(RoundState::new("m-1", "m-1", "hello")));
        assert!(!store.insert(RoundState::new("m-1", "m-1", "other")));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("m-1").unwrap().trigger_content, "hello");
    }

    #[test]
    fn test_resolve_is_monotonic() {
        let mut state = RoundState::new("m-1", "m-1", "hello");
        assert!(state.resolve());
        assert!(!state.resolve());
        assert!(state.resolved);
    }

    #[test]
    fn test_ready_to_resolve() {
        let mut state = RoundState::new("m-1", "m-1", "hello");
        assert!(!state.ready_to_resolve());
        state.my_proposal = Some(MicroProposal {
            angle: "a".to_string(),
            confidence: 0.5,
            covers: vec![],
            solo_sufficient: false,
            builds_on_other: None,
        });
        assert!(!state.ready_to_resolve());
        state.other_proposal = state.my_proposal.clone();
        assert!(state.ready_to_resolve());
        state.resolve();
        assert!(!state.ready_to_resolve());
    }

    #[test]
    fn test_any_unresolved() {
        let mut store = RoundStore::new();
        assert!(!store.any_unresolved());
        store.insert(RoundState::new("m-1", "m-1", "hello"));
        assert!(store.any_unresolved());
        store.get_mut("m-1").unwrap().resolve();
        assert!(!store.any_unresolved());
    }
}
