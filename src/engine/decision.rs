//! The decision a resolved round raises to the dispatch holder.

use crate::protocol::MicroProposal;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchDecision {
    pub round_id: String,
    pub trigger_message_id: String,
    pub action: DecisionAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionAction {
    /// Reply now, optionally with a context prefix prepended to the
    /// original text.
    Respond { synthesize_context: Option<String> },
    /// Cancel the held message; the peer covers it.
    Suppress,
    /// Synthesis runner-up: wait for the winner's reply summary, then
    /// build on it (or fall back to a parallel-style reply).
    AwaitPeer {
        winner_name: String,
        my_proposal: MicroProposal,
        other_proposal: MicroProposal,
    },
    /// No terminal verdict yet; the holder re-arms a shorter backstop in
    /// case the peer's decision never arrives.
    Defer { peer_name: Option<String> },
}

impl DispatchDecision {
    /// The negotiation path could not complete; reply anyway with the
    /// original user text.
    pub fn fail_open(round_id: &str, trigger_message_id: &str) -> Self {
        Self {
            round_id: round_id.to_string(),
            trigger_message_id: trigger_message_id.to_string(),
            action: DecisionAction::Respond {
                synthesize_context: None,
            },
        }
    }

    pub fn should_respond(&self) -> bool {
        matches!(self.action, DecisionAction::Respond { .. })
    }
}
