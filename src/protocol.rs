//! Coordination records, the only wire format this crate defines.
//!
//! Records travel as JSON chat messages on the shared coordination stream.
//! The envelope carries the protocol version and round scoping; the body is
//! a tagged variant on `kind`. Unknown kinds and unknown protocol versions
//! are dropped by `parse_record`, never raised.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::filter::Mode;

/// Version emitted on outbound records.
pub const PROTOCOL_VERSION: &str = "chorus/1";

/// Versions accepted inbound. Legacy entries parse identically and are
/// logged at debug.
pub const ACCEPTED_PROTOCOLS: &[&str] = &["chorus/1", "coord/1", "coord/0"];

/// An agent's compact self-assessment for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroProposal {
    /// Short free-text label for the angle this agent would take.
    pub angle: String,
    /// Self-assessed confidence in [0, 1].
    pub confidence: f64,
    /// Topics the reply would cover.
    #[serde(default)]
    pub covers: Vec<String>,
    /// Whether this agent believes its reply alone suffices.
    #[serde(default)]
    pub solo_sufficient: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builds_on_other: Option<bool>,
}

impl MicroProposal {
    /// Parse a proposal out of raw model output. Tolerates code fences and
    /// prose around the JSON object; clamps confidence into [0, 1].
    pub fn from_model_output(text: &str) -> Option<Self> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end < start {
            return None;
        }
        let mut proposal: Self = serde_json::from_str(&text[start..=end]).ok()?;
        proposal.confidence = proposal.confidence.clamp(0.0, 1.0);
        Some(proposal)
    }
}

/// Free-form peer-chat payload shared by the layer-2 kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerChat {
    /// Addressee; absent or "*" means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expects_reply: Option<bool>,
    /// Reply chain depth, capped by configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

impl PeerChat {
    pub fn is_addressed_to(&self, name: &str) -> bool {
        match self.to.as_deref() {
            None | Some("*") => true,
            Some(target) => target == name,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    /// Start a new round whose id equals the triggering message id.
    RoundStart {
        trigger_message_id: String,
        trigger_content: String,
    },
    /// A peer's proposal for the current round.
    MicroPropose { proposal: MicroProposal },
    /// Terminal log for a round; informational to peers.
    Resolved {
        mode: Mode,
        winner: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runner_up: Option<String>,
        reason: String,
        my_proposal: MicroProposal,
        other_proposal: MicroProposal,
    },
    /// Author-post-facto assessment; never consumed by the state machine.
    Signal {
        solo_insufficient: bool,
        confidence: f64,
        reason: String,
        basis: String,
        chain_depth: u32,
    },
    Question(PeerChat),
    Inform(PeerChat),
    Flag(PeerChat),
    Delegate(PeerChat),
    Status(PeerChat),
}

impl RecordBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::RoundStart { .. } => "round_start",
            Self::MicroPropose { .. } => "micro_propose",
            Self::Resolved { .. } => "resolved",
            Self::Signal { .. } => "signal",
            Self::Question(_) => "question",
            Self::Inform(_) => "inform",
            Self::Flag(_) => "flag",
            Self::Delegate(_) => "delegate",
            Self::Status(_) => "status",
        }
    }

    pub fn peer_chat(&self) -> Option<&PeerChat> {
        match self {
            Self::Question(p) | Self::Inform(p) | Self::Flag(p) | Self::Delegate(p)
            | Self::Status(p) => Some(p),
            _ => None,
        }
    }
}

/// Envelope around a record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordRecord {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_chat_id: Option<String>,
    /// Authoring agent name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(flatten)]
    pub body: RecordBody,
}

impl CoordRecord {
    pub fn new(from: &str, round_id: Option<String>, body: RecordBody) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            round_id,
            source_chat_id: None,
            from: Some(from.to_string()),
            body,
        }
    }

    pub fn with_source_chat(mut self, chat_id: Option<String>) -> Self {
        self.source_chat_id = chat_id;
        self
    }

    pub fn round_start(
        from: &str,
        round_id: &str,
        trigger_message_id: &str,
        trigger_content: &str,
    ) -> Self {
        Self::new(
            from,
            Some(round_id.to_string()),
            RecordBody::RoundStart {
                trigger_message_id: trigger_message_id.to_string(),
                trigger_content: trigger_content.to_string(),
            },
        )
    }

    pub fn micro_propose(from: &str, round_id: &str, proposal: MicroProposal) -> Self {
        Self::new(
            from,
            Some(round_id.to_string()),
            RecordBody::MicroPropose { proposal },
        )
    }

    pub fn to_json(&self) -> String {
        // The envelope and bodies only hold maps, strings and numbers.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse one coordination record off the wire.
///
/// Drops (returns `None`) on malformed JSON, unknown protocol versions,
/// unknown kinds, and missing required fields. Never raises.
pub fn parse_record(content: &str) -> Option<CoordRecord> {
    let value: serde_json::Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "dropping unparseable coordination record");
            return None;
        }
    };

    let protocol = value.get("protocol").and_then(|p| p.as_str()).unwrap_or("");
    if !ACCEPTED_PROTOCOLS.contains(&protocol) {
        debug!(protocol, "dropping record with unknown protocol version");
        return None;
    }
    if protocol != PROTOCOL_VERSION {
        debug!(protocol, "accepting legacy protocol version");
    }

    match serde_json::from_value::<CoordRecord>(value.clone()) {
        Ok(record) => Some(record),
        Err(e) => {
            let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or("?");
            warn!(kind, error = %e, "dropping malformed coordination record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> MicroProposal {
        MicroProposal {
            angle: "perf".to_string(),
            confidence: 0.8,
            covers: vec!["latency".to_string()],
            solo_sufficient: true,
            builds_on_other: None,
        }
    }

    #[test]
    fn test_round_trip_micro_propose() {
        let record = CoordRecord::micro_propose("alpha", "m-1", proposal());
        let parsed = parse_record(&record.to_json()).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.body.kind_name(), "micro_propose");
    }

    #[test]
    fn test_unknown_kind_is_dropped() {
        let raw = r#"{"protocol":"chorus/1","kind":"teleport","round_id":"m-1"}"#;
        assert!(parse_record(raw).is_none());
    }

    #[test]
    fn test_unknown_protocol_is_dropped() {
        let raw = r#"{"protocol":"coord/9","kind":"micro_propose","round_id":"m-1"}"#;
        assert!(parse_record(raw).is_none());
    }

    #[test]
    fn test_legacy_protocol_is_accepted() {
        let mut record = CoordRecord::round_start("alpha", "m-1", "m-1", "hello");
        record.protocol = "coord/0".to_string();
        assert!(parse_record(&record.to_json()).is_some());
    }

    #[test]
    fn test_malformed_json_is_dropped() {
        assert!(parse_record("not json at all").is_none());
        assert!(parse_record(r#"{"protocol":"chorus/1""#).is_none());
    }

    #[test]
    fn test_missing_required_field_is_dropped() {
        // micro_propose without a proposal
        let raw = r#"{"protocol":"chorus/1","kind":"micro_propose","round_id":"m-1"}"#;
        assert!(parse_record(raw).is_none());
    }

    #[test]
    fn test_proposal_from_fenced_model_output() {
        let text = "Here you go:\n```json\n{\"angle\":\"caching\",\"confidence\":1.4,\"covers\":[\"redis\"],\"solo_sufficient\":false}\n```";
        let parsed = MicroProposal::from_model_output(text).unwrap();
        assert_eq!(parsed.angle, "caching");
        // Out-of-range confidence is clamped, not rejected.
        assert!((parsed.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_proposal_from_garbage_output() {
        assert!(MicroProposal::from_model_output("no json here").is_none());
        assert!(MicroProposal::from_model_output("}{").is_none());
    }

    #[test]
    fn test_peer_chat_addressing() {
        let mut chat = PeerChat {
            to: None,
            content: "ping".to_string(),
            expects_reply: Some(true),
            depth: None,
        };
        assert!(chat.is_addressed_to("alpha"));
        chat.to = Some("*".to_string());
        assert!(chat.is_addressed_to("alpha"));
        chat.to = Some("beta".to_string());
        assert!(!chat.is_addressed_to("alpha"));
        assert!(chat.is_addressed_to("beta"));
    }
}
