//! Seams to the host: the gateway, the chat backend, the durable row
//! store, the realtime fan-out and the coordination-history reads.
//!
//! The engine consumes these as trait objects so the sidecar embeds into
//! any backend. `host::memory` provides the in-process implementation used
//! by the integration tests and the `simulate` command.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One user-triggered unit of work off the dispatch stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub chat_id: String,
    pub text: String,
    /// Display name of the author.
    pub speaker: String,
    pub user_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Handled,
}

/// A durable dispatch row addressed to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRow {
    pub bot_id: String,
    pub message_id: String,
    pub status: RowStatus,
    pub created_at: DateTime<Utc>,
    pub handled_at: Option<DateTime<Utc>>,
    pub payload: DispatchPayload,
}

/// A row in the response-summary sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSummary {
    pub round_id: String,
    pub speaker: String,
    pub content: String,
    pub source_chat_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Options for one gateway call.
#[derive(Debug, Clone, Default)]
pub struct GatewayOpts {
    pub model: Option<String>,
    /// Long-lived logical session; `None` means a per-call session.
    pub session_id: Option<String>,
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
}

/// Language-model gateway. `Ok(None)` means the gateway gave up after its
/// own retries; callers treat that as a generator failure, not an error.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn call(&self, prompt: &str, opts: GatewayOpts) -> Result<Option<String>>;

    /// Stateless fast variant with a per-call session.
    async fn call_fast(&self, prompt: &str) -> Result<Option<String>>;
}

/// Outbound surfaces on the chat backend.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Write a coordination record to the shared stream. Best-effort;
    /// callers log failures and move on.
    async fn post_coordination(&self, content: &str) -> Result<()>;

    /// Run the reply pipeline for a held user message; returns the
    /// concatenated reply text.
    async fn dispatch_reply(&self, chat_id: &str, text: &str, user_id: &str) -> Result<String>;

    async fn send_outbound(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// Durable dispatch rows. The CAS claim is the only cross-instance
/// synchronization point.
#[async_trait]
pub trait DispatchRows: Send + Sync {
    /// Rows in state pending addressed to `bot_id`.
    async fn pending_for(&self, bot_id: &str) -> Result<Vec<DispatchRow>>;

    /// Compare-and-swap claim: set handled where
    /// `(bot_id, message_id, status=pending)` still matches. Returns
    /// whether this caller won the claim.
    async fn claim(&self, bot_id: &str, message_id: &str) -> Result<bool>;

    /// Bulk-mark rows created before `cutoff` as handled without
    /// delivering them. Returns the number of rows quarantined.
    async fn quarantine_before(&self, bot_id: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    /// No-op query keeping the upstream session warm.
    async fn ping(&self) -> Result<()>;
}

/// An event off the realtime fast path.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Dispatch(DispatchPayload),
    Coordination {
        message_id: String,
        speaker: String,
        content: String,
    },
}

impl InboundEvent {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Dispatch(payload) => &payload.message_id,
            Self::Coordination { message_id, .. } => message_id,
        }
    }
}

/// Broadcast-style realtime channel keyed by agent id.
#[async_trait]
pub trait Realtime: Send + Sync {
    async fn subscribe(&self, agent_id: &str) -> Result<Box<dyn Subscription>>;
}

/// A live fast-path subscription. `next` returning `None` signals death;
/// the supervisor reconnects. A stale subscription must be disconnected
/// (awaited) before a replacement is created, or ghost subscriptions keep
/// delivering duplicates.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Option<InboundEvent>;

    async fn disconnect(self: Box<Self>);
}

/// Read side of the shared coordination stream and the summary sink.
#[async_trait]
pub trait CoordReads: Send + Sync {
    /// The newest `limit` messages from the shared coordination chat, in
    /// chronological order.
    async fn recent_coordination(&self, limit: usize) -> Result<Vec<CoordMessage>>;

    /// Recent replies a given bot posted in `chat_id`, newest first.
    async fn recent_bot_replies(
        &self,
        chat_id: &str,
        speaker: &str,
        limit: usize,
    ) -> Result<Vec<String>>;

    async fn write_summary(&self, summary: ResponseSummary) -> Result<()>;

    async fn summaries_for(&self, round_id: &str) -> Result<Vec<ResponseSummary>>;

    /// Agent names observed in the summary sink.
    async fn known_speakers(&self) -> Result<Vec<String>>;
}

/// One raw message on the shared coordination chat.
#[derive(Debug, Clone)]
pub struct CoordMessage {
    pub speaker: String,
    pub content: String,
}

/// The full set of host ports a sidecar needs.
#[derive(Clone)]
pub struct HostPorts {
    pub gateway: std::sync::Arc<dyn Gateway>,
    pub chat: std::sync::Arc<dyn ChatPort>,
    pub rows: std::sync::Arc<dyn DispatchRows>,
    pub realtime: std::sync::Arc<dyn Realtime>,
    pub reads: std::sync::Arc<dyn CoordReads>,
}
