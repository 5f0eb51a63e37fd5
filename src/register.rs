//! Advisory per-chat register: who spoke last, with what angles.
//!
//! Injected into proposal prompts only, never read by the filter, so peers
//! with slightly divergent registers still agree on the outcome.

use serde::{Deserialize, Serialize};

/// Maximum retained `{agent, angle}` entries.
pub const MAX_RECENT_ANGLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AngleEntry {
    pub agent: String,
    pub angle: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterState {
    pub last_responder: Option<String>,
    /// Newest-first, unique by agent, at most [`MAX_RECENT_ANGLES`].
    pub recent_angles: Vec<AngleEntry>,
}

impl RegisterState {
    /// Record that `agent` actually replied with `angle`.
    pub fn note_response(&mut self, agent: &str, angle: &str) {
        self.last_responder = Some(agent.to_string());
        self.recent_angles.retain(|entry| entry.agent != agent);
        self.recent_angles.insert(
            0,
            AngleEntry {
                agent: agent.to_string(),
                angle: angle.to_string(),
            },
        );
        self.recent_angles.truncate(MAX_RECENT_ANGLES);
    }

    /// Render advisory context lines for the proposal prompt. Empty when
    /// nothing has been recorded yet.
    pub fn prompt_lines(&self) -> String {
        let mut lines = Vec::new();
        if let Some(last) = &self.last_responder {
            lines.push(format!("last responder: {}", last));
        }
        for entry in &self.recent_angles {
            lines.push(format!("recent angle by {}: {}", entry.agent, entry.angle));
        }
        lines.join("\n")
    }
}
