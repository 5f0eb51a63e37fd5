//! In-memory host: every port backed by shared in-process state.
//!
//! One hub models the chat backend, the durable row store, the realtime
//! fan-out, the summary sink and a scriptable gateway for any number of
//! agents. Backs the integration tests and `chorus simulate`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::host::{
    ChatPort, CoordMessage, CoordReads, DispatchPayload, DispatchRow, DispatchRows, Gateway,
    GatewayOpts, HostPorts, InboundEvent, Realtime, ResponseSummary, RowStatus, Subscription,
};

/// A reply the pipeline produced, as observed by the hub.
#[derive(Debug, Clone)]
pub struct ReplyEvent {
    pub agent: String,
    pub chat_id: String,
    pub text: String,
}

#[derive(Default)]
struct HubInner {
    agents: Mutex<Vec<String>>,
    subscriptions: Mutex<HashMap<String, (u64, mpsc::UnboundedSender<InboundEvent>)>>,
    next_subscription: AtomicU64,
    coord_log: Mutex<Vec<CoordMessage>>,
    replies: Mutex<Vec<ReplyEvent>>,
    outbound: Mutex<Vec<(String, String)>>,
    rows: Mutex<Vec<DispatchRow>>,
    summaries: Mutex<Vec<ResponseSummary>>,
    gateway_scripts: Mutex<HashMap<String, VecDeque<Option<String>>>>,
    prompts: Mutex<Vec<(String, String)>>,
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports wired to this hub for one agent. Registers the agent so
    /// subsequent user messages address it.
    pub fn ports_for(&self, agent: &str) -> HostPorts {
        {
            let mut agents = self.inner.agents.lock();
            if !agents.iter().any(|a| a == agent) {
                agents.push(agent.to_string());
            }
        }
        HostPorts {
            gateway: Arc::new(MemGateway {
                inner: Arc::clone(&self.inner),
                agent: agent.to_string(),
            }),
            chat: Arc::new(MemChat {
                inner: Arc::clone(&self.inner),
                agent: agent.to_string(),
            }),
            rows: Arc::new(MemRows {
                inner: Arc::clone(&self.inner),
            }),
            realtime: Arc::new(MemRealtime {
                inner: Arc::clone(&self.inner),
            }),
            reads: Arc::new(MemReads {
                inner: Arc::clone(&self.inner),
            }),
        }
    }

    /// Queue the next gateway response for an agent. `None` scripts a
    /// generator failure.
    pub fn script_gateway(&self, agent: &str, response: Option<&str>) {
        self.inner
            .gateway_scripts
            .lock()
            .entry(agent.to_string())
            .or_default()
            .push_back(response.map(str::to_string));
    }

    /// A user message: one pending row per registered agent plus a
    /// fast-path event to each live subscription.
    pub fn user_message(&self, chat_id: &str, user_id: &str, text: &str) -> String {
        let message_id = format!("m-{}", Uuid::new_v4());
        self.user_message_with_id(chat_id, user_id, text, &message_id);
        message_id
    }

    pub fn user_message_with_id(&self, chat_id: &str, user_id: &str, text: &str, message_id: &str) {
        let payload = payload(chat_id, user_id, text, message_id);
        for agent in self.agent_names() {
            self.push_row(&agent, &payload, Utc::now());
            self.send_event(&agent, InboundEvent::Dispatch(payload.clone()));
        }
    }

    /// A row with no fast-path event; only the safety-net poll finds it.
    pub fn row_only(&self, chat_id: &str, user_id: &str, text: &str) -> String {
        let message_id = format!("m-{}", Uuid::new_v4());
        let payload = payload(chat_id, user_id, text, &message_id);
        for agent in self.agent_names() {
            self.push_row(&agent, &payload, Utc::now());
        }
        message_id
    }

    /// A pending row created in the past, simulating pre-boot backlog.
    pub fn stale_row(&self, agent: &str, message_id: &str, created_at: DateTime<Utc>) {
        let payload = payload("c-stale", "u-stale", "old message", message_id);
        self.push_row(agent, &payload, created_at);
    }

    /// Re-send a fast-path event verbatim (reconnection replay).
    pub fn replay_dispatch(&self, agent: &str, chat_id: &str, user_id: &str, text: &str, message_id: &str) {
        self.send_event(
            agent,
            InboundEvent::Dispatch(payload(chat_id, user_id, text, message_id)),
        );
    }

    /// Drop an agent's live subscription, simulating fast-path death.
    pub fn kill_subscription(&self, agent: &str) {
        self.inner.subscriptions.lock().remove(agent);
    }

    pub fn has_subscription(&self, agent: &str) -> bool {
        self.inner.subscriptions.lock().contains_key(agent)
    }

    pub fn replies(&self) -> Vec<ReplyEvent> {
        self.inner.replies.lock().clone()
    }

    pub fn coord_posts(&self) -> Vec<(String, String)> {
        self.inner
            .coord_log
            .lock()
            .iter()
            .map(|m| (m.speaker.clone(), m.content.clone()))
            .collect()
    }

    pub fn rows(&self) -> Vec<DispatchRow> {
        self.inner.rows.lock().clone()
    }

    pub fn summaries(&self) -> Vec<ResponseSummary> {
        self.inner.summaries.lock().clone()
    }

    pub fn prompts_for(&self, agent: &str) -> Vec<String> {
        self.inner
            .prompts
            .lock()
            .iter()
            .filter(|(a, _)| a == agent)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn agent_names(&self) -> Vec<String> {
        self.inner.agents.lock().clone()
    }

    fn push_row(&self, agent: &str, payload: &DispatchPayload, created_at: DateTime<Utc>) {
        self.inner.rows.lock().push(DispatchRow {
            bot_id: agent.to_string(),
            message_id: payload.message_id.clone(),
            status: RowStatus::Pending,
            created_at,
            handled_at: None,
            payload: payload.clone(),
        });
    }

    fn send_event(&self, agent: &str, event: InboundEvent) {
        if let Some((_, tx)) = self.inner.subscriptions.lock().get(agent) {
            let _ = tx.send(event);
        }
    }
}

fn payload(chat_id: &str, user_id: &str, text: &str, message_id: &str) -> DispatchPayload {
    DispatchPayload {
        chat_id: chat_id.to_string(),
        text: text.to_string(),
        speaker: user_id.to_string(),
        user_id: user_id.to_string(),
        message_id: message_id.to_string(),
    }
}

struct MemGateway {
    inner: Arc<HubInner>,
    agent: String,
}

impl MemGateway {
    fn pop(&self, prompt: &str) -> Option<String> {
        self.inner
            .prompts
            .lock()
            .push((self.agent.clone(), prompt.to_string()));
        self.inner
            .gateway_scripts
            .lock()
            .get_mut(&self.agent)
            .and_then(VecDeque::pop_front)
            .flatten()
    }
}

#[async_trait]
impl Gateway for MemGateway {
    async fn call(&self, prompt: &str, _opts: GatewayOpts) -> Result<Option<String>> {
        Ok(self.pop(prompt))
    }

    async fn call_fast(&self, prompt: &str) -> Result<Option<String>> {
        Ok(self.pop(prompt))
    }
}

struct MemChat {
    inner: Arc<HubInner>,
    agent: String,
}

#[async_trait]
impl ChatPort for MemChat {
    async fn post_coordination(&self, content: &str) -> Result<()> {
        self.inner.coord_log.lock().push(CoordMessage {
            speaker: self.agent.clone(),
            content: content.to_string(),
        });
        // The shared stream fans out to every subscriber, author included.
        let subscriptions = self.inner.subscriptions.lock();
        for (_, tx) in subscriptions.values() {
            let _ = tx.send(InboundEvent::Coordination {
                message_id: format!("coord-{}", Uuid::new_v4()),
                speaker: self.agent.clone(),
                content: content.to_string(),
            });
        }
        Ok(())
    }

    async fn dispatch_reply(&self, chat_id: &str, text: &str, _user_id: &str) -> Result<String> {
        self.inner.replies.lock().push(ReplyEvent {
            agent: self.agent.clone(),
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        });
        Ok(text.to_string())
    }

    async fn send_outbound(&self, chat_id: &str, text: &str) -> Result<()> {
        self.inner
            .outbound
            .lock()
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
}

struct MemRows {
    inner: Arc<HubInner>,
}

#[async_trait]
impl DispatchRows for MemRows {
    async fn pending_for(&self, bot_id: &str) -> Result<Vec<DispatchRow>> {
        Ok(self
            .inner
            .rows
            .lock()
            .iter()
            .filter(|row| row.bot_id == bot_id && row.status == RowStatus::Pending)
            .cloned()
            .collect())
    }

    async fn claim(&self, bot_id: &str, message_id: &str) -> Result<bool> {
        let mut rows = self.inner.rows.lock();
        for row in rows.iter_mut() {
            if row.bot_id == bot_id
                && row.message_id == message_id
                && row.status == RowStatus::Pending
            {
                row.status = RowStatus::Handled;
                row.handled_at = Some(Utc::now());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn quarantine_before(&self, bot_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.inner.rows.lock();
        let mut count = 0;
        for row in rows.iter_mut() {
            if row.bot_id == bot_id && row.status == RowStatus::Pending && row.created_at < cutoff {
                row.status = RowStatus::Handled;
                row.handled_at = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct MemRealtime {
    inner: Arc<HubInner>,
}

#[async_trait]
impl Realtime for MemRealtime {
    async fn subscribe(&self, agent_id: &str) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscriptions
            .lock()
            .insert(agent_id.to_string(), (id, tx));
        Ok(Box::new(MemSubscription {
            inner: Arc::clone(&self.inner),
            agent: agent_id.to_string(),
            id,
            rx,
        }))
    }
}

struct MemSubscription {
    inner: Arc<HubInner>,
    agent: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<InboundEvent>,
}

#[async_trait]
impl Subscription for MemSubscription {
    async fn next(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }

    async fn disconnect(self: Box<Self>) {
        let mut subscriptions = self.inner.subscriptions.lock();
        // Only remove our own registration; a replacement may already be
        // live under the same agent name.
        if subscriptions.get(&self.agent).is_some_and(|(id, _)| *id == self.id) {
            subscriptions.remove(&self.agent);
        }
    }
}

struct MemReads {
    inner: Arc<HubInner>,
}

#[async_trait]
impl CoordReads for MemReads {
    async fn recent_coordination(&self, limit: usize) -> Result<Vec<CoordMessage>> {
        let log = self.inner.coord_log.lock();
        let skip = log.len().saturating_sub(limit);
        Ok(log.iter().skip(skip).cloned().collect())
    }

    async fn recent_bot_replies(
        &self,
        chat_id: &str,
        speaker: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        Ok(self
            .inner
            .replies
            .lock()
            .iter()
            .rev()
            .filter(|reply| reply.agent == speaker && reply.chat_id == chat_id)
            .take(limit)
            .map(|reply| reply.text.clone())
            .collect())
    }

    async fn write_summary(&self, summary: ResponseSummary) -> Result<()> {
        self.inner.summaries.lock().push(summary);
        Ok(())
    }

    async fn summaries_for(&self, round_id: &str) -> Result<Vec<ResponseSummary>> {
        Ok(self
            .inner
            .summaries
            .lock()
            .iter()
            .filter(|summary| summary.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn known_speakers(&self) -> Result<Vec<String>> {
        let mut speakers: Vec<String> = Vec::new();
        for summary in self.inner.summaries.lock().iter() {
            if !speakers.contains(&summary.speaker) {
                speakers.push(summary.speaker.clone());
            }
        }
        Ok(speakers)
    }
}
