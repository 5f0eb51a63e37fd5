//! Prompt and context assembly.
//!
//! The micro-proposal prompt feeds the fast gateway call at round start;
//! the `synthesize_context` builders produce the prefixes the holder
//! prepends before running the reply pipeline.

use crate::protocol::MicroProposal;
use crate::register::RegisterState;

/// Prompt asking the model for a micro-proposal JSON object.
pub fn micro_proposal(
    agent_name: &str,
    trigger: &str,
    register: &RegisterState,
    coord_history: &str,
    peer_replies: &str,
) -> String {
    let mut prompt = format!(
        "You are {agent_name}, one of several assistants sharing a chat. A user \
         message just arrived and the assistants are negotiating who replies.\n\n\
         User message:\n{trigger}\n\n"
    );
    let register_lines = register.prompt_lines();
    if !register_lines.is_empty() {
        prompt.push_str(&format!("Recent activity in this chat:\n{register_lines}\n\n"));
    }
    if !coord_history.is_empty() {
        prompt.push_str(&format!("Earlier negotiation rounds:\n{coord_history}\n\n"));
    }
    if !peer_replies.is_empty() {
        prompt.push_str(&format!("Recent peer replies:\n{peer_replies}\n\n"));
    }
    prompt.push_str(
        "Assess what you would contribute. Reply with only a JSON object:\n\
         {\"angle\": \"<short label for your take>\", \"confidence\": <0..1>, \
         \"covers\": [\"<topic>\", ...], \"solo_sufficient\": <bool>, \
         \"builds_on_other\": <bool, optional>}\n\
         Pick an angle that complements rather than duplicates the recent ones.",
    );
    prompt
}

/// Context for the solo winner.
pub fn solo_winner_context(
    my_angle: &str,
    peer_name: &str,
    peer_angle: &str,
    reason: &str,
) -> String {
    format!(
        "[coordination resolved. your angle: {my_angle}; {peer_name}'s angle: {peer_angle}; \
         you were selected ({reason}). reply on your angle.]"
    )
}

/// Context when both agents reply in parallel.
pub fn parallel_context(my_angle: &str, peer_name: &str, peer_angle: &str) -> String {
    format!(
        "[coordination resolved: parallel replies. focus on your unique angle: {my_angle}. \
         {peer_name} is covering {peer_angle} separately; do not duplicate it.]"
    )
}

/// Context for the synthesis winner, who replies first.
pub fn synthesis_leader_context(my_angle: &str, peer_name: &str) -> String {
    format!(
        "[coordination resolved: synthesis. you go first with your angle: {my_angle}; \
         {peer_name} will build on your reply.]"
    )
}

/// Context for the synthesis runner-up once the winner's reply arrived.
pub fn synthesis_follow_context(
    winner_name: &str,
    winner_reply: &str,
    mine: &MicroProposal,
    theirs: &MicroProposal,
) -> String {
    format!(
        "[coordination resolved: synthesis. {winner_name} already replied, covering {}:\n\
         {winner_reply}\n\
         build on that reply from your angle: {}. do not repeat what was said.]",
        theirs.angle, mine.angle
    )
}

/// Fallback when the winner's reply never shows up inside the wait.
pub fn parallel_fallback_context(mine: &MicroProposal, theirs: &MicroProposal) -> String {
    format!(
        "[coordination resolved: synthesis, but the peer reply did not arrive in time. \
         reply independently on your angle: {}; the peer intended to cover {}.]",
        mine.angle, theirs.angle
    )
}

/// Prompt for a free-form peer-chat reply.
pub fn peer_chat_reply(
    agent_name: &str,
    speaker: &str,
    kind: &str,
    content: &str,
    depth: u32,
) -> String {
    format!(
        "You are {agent_name}. Fellow agent {speaker} sent you a {kind} \
         (exchange depth {depth}):\n{content}\n\n\
         Reply briefly and concretely. If nothing useful remains to add, say so in one line."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(angle: &str) -> MicroProposal {
        MicroProposal {
            angle: angle.to_string(),
            confidence: 0.8,
            covers: vec![],
            solo_sufficient: true,
            builds_on_other: None,
        }
    }

    #[test]
    fn test_micro_proposal_prompt_sections() {
        let mut register = RegisterState::default();
        register.note_response("beta", "perf");
        let prompt = micro_proposal("alpha", "how do I cache this?", &register, "round m-0", "beta: use redis");
        assert!(prompt.contains("You are alpha"));
        assert!(prompt.contains("how do I cache this?"));
        assert!(prompt.contains("recent angle by beta: perf"));
        assert!(prompt.contains("round m-0"));
        assert!(prompt.contains("beta: use redis"));
        assert!(prompt.contains("\"confidence\""));
    }

    #[test]
    fn test_micro_proposal_prompt_omits_empty_sections() {
        let prompt = micro_proposal("alpha", "hi", &RegisterState::default(), "", "");
        assert!(!prompt.contains("Earlier negotiation rounds"));
        assert!(!prompt.contains("Recent peer replies"));
        assert!(!prompt.contains("Recent activity"));
    }

    #[test]
    fn test_contexts_name_the_peer_angle() {
        let context = parallel_context("security", "beta", "perf");
        assert!(context.contains("security"));
        assert!(context.contains("beta"));
        assert!(context.contains("perf"));

        let follow = synthesis_follow_context("beta", "use an LRU", &proposal("eviction"), &proposal("caching"));
        assert!(follow.contains("use an LRU"));
        assert!(follow.contains("eviction"));
        assert!(follow.contains("caching"));
    }
}
