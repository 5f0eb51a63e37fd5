//! Pure proposal filter.
//!
//! Given both micro-proposals and both agent names, computes the dispatch
//! mode, the winner and the runner-up. The function is deterministic and
//! symmetric under argument swap, so two peers that observe the same two
//! proposals agree on the outcome without any ordering protocol. It reads
//! no register state, no timers, no I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;
use crate::protocol::MicroProposal;

/// How the held user message gets answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One agent replies; the other suppresses.
    Solo,
    /// Both reply from distinct angles.
    Parallel,
    /// The winner replies first; the runner-up builds on it.
    Synthesis,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Solo => write!(f, "solo"),
            Self::Parallel => write!(f, "parallel"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterResult {
    pub mode: Mode,
    pub winner: String,
    pub runner_up: Option<String>,
    pub reason: String,
    /// Both proposals, keyed by agent name.
    pub proposals: BTreeMap<String, MicroProposal>,
}

impl FilterResult {
    pub fn winner_proposal(&self) -> Option<&MicroProposal> {
        self.proposals.get(&self.winner)
    }
}

/// Token-set similarity over `angle` plus `covers`, in [0, 1].
///
/// Jaccard over lowercased whitespace tokens longer than two characters.
/// Two empty token sets count as identical; exactly one empty counts as
/// fully distinct.
pub fn angle_similarity(a: &MicroProposal, b: &MicroProposal) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);
    match (set_a.is_empty(), set_b.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => {
            let intersection = set_a.intersection(&set_b).count();
            let union = set_a.union(&set_b).count();
            intersection as f64 / union as f64
        }
    }
}

fn token_set(proposal: &MicroProposal) -> BTreeSet<String> {
    let text = format!("{} {}", proposal.angle, proposal.covers.join(" "));
    text.to_lowercase()
        .split_whitespace()
        .filter(|token| token.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Run the routing rules. First match wins.
pub fn resolve(
    mine: &MicroProposal,
    theirs: &MicroProposal,
    my_name: &str,
    other_name: &str,
    config: &FilterConfig,
) -> FilterResult {
    let delta = (mine.confidence - theirs.confidence).abs();
    let sim = angle_similarity(mine, theirs);

    let (winner, runner_up) = pick_winner(mine, theirs, my_name, other_name, config.epsilon);
    let (high_conf, low_conf) = if mine.confidence >= theirs.confidence {
        (mine.confidence, theirs.confidence)
    } else {
        (theirs.confidence, mine.confidence)
    };
    let builds = mine.builds_on_other.unwrap_or(false) || theirs.builds_on_other.unwrap_or(false);

    let both_above = |threshold: f64| high_conf > threshold && low_conf > threshold;

    let (mode, reason) = if delta > config.confidence_gap {
        (
            Mode::Solo,
            format!(
                "confidence gap {:.2} exceeds {:.2}; {} leads",
                delta, config.confidence_gap, winner
            ),
        )
    } else if both_above(config.high) && sim < config.overlap {
        (
            Mode::Parallel,
            format!(
                "both confident ({:.2}/{:.2}) with distinct angles (similarity {:.2})",
                high_conf, low_conf, sim
            ),
        )
    } else if both_above(config.synth) && sim >= config.overlap && builds {
        (
            Mode::Synthesis,
            format!(
                "both strong ({:.2}/{:.2}) on overlapping angles (similarity {:.2}) with a build offer",
                high_conf, low_conf, sim
            ),
        )
    } else if both_above(config.high) && sim >= config.overlap {
        (
            Mode::Solo,
            format!(
                "overlapping angles (similarity {:.2}); one voice is enough, {} leads",
                sim, winner
            ),
        )
    } else if high_conf < config.low {
        (
            Mode::Solo,
            format!(
                "both tentative ({:.2}/{:.2}); {} answers rather than neither",
                high_conf, low_conf, winner
            ),
        )
    } else {
        (
            Mode::Solo,
            format!("no routing rule matched (delta {:.2}, similarity {:.2}); {} leads by default",
                delta, sim, winner
            ),
        )
    };

    let mut proposals = BTreeMap::new();
    proposals.insert(my_name.to_string(), mine.clone());
    proposals.insert(other_name.to_string(), theirs.clone());

    FilterResult {
        mode,
        winner,
        runner_up: Some(runner_up),
        reason,
        proposals,
    }
}

/// Higher confidence wins; within epsilon the lexicographically smaller
/// name wins so both peers break the tie identically.
fn pick_winner(
    mine: &MicroProposal,
    theirs: &MicroProposal,
    my_name: &str,
    other_name: &str,
    epsilon: f64,
) -> (String, String) {
    let delta = mine.confidence - theirs.confidence;
    let mine_wins = if delta.abs() < epsilon {
        my_name < other_name
    } else {
        delta > 0.0
    };
    if mine_wins {
        (my_name.to_string(), other_name.to_string())
    } else {
        (other_name.to_string(), my_name.to_string())
    }
}
