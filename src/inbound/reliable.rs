//! Exactly-once local delivery over an at-least-once event stream.
//!
//! Three delivery paths cooperate: a realtime fast path, a safety-net poll
//! over the durable row store, and supervisor-driven reconnection. The id
//! window is marked before any callback and is the hard at-most-once gate;
//! the row-store CAS claim only reduces cross-instance double work.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::InboundConfig;
use crate::dedup::DedupWindow;
use crate::error::{ChorusError, Result};
use crate::host::{DispatchRows, InboundEvent, Realtime, Subscription};
use crate::protocol;

use super::InboundHandler;

pub struct ReliableInbound {
    agent_id: String,
    config: InboundConfig,
    rows: Arc<dyn DispatchRows>,
    realtime: Arc<dyn Realtime>,
    handler: Arc<dyn InboundHandler>,
    id_window: Arc<DedupWindow>,
    /// Rows created before this instant are never replayed to callbacks.
    boot_time: DateTime<Utc>,
}

/// Why a pump loop returned.
#[derive(Debug)]
pub enum PumpEnd {
    /// Clean shutdown was requested.
    Shutdown,
    /// The fast path died; the supervisor should reconnect.
    Died(ChorusError),
}

impl ReliableInbound {
    pub fn new(
        agent_id: String,
        config: InboundConfig,
        rows: Arc<dyn DispatchRows>,
        realtime: Arc<dyn Realtime>,
        handler: Arc<dyn InboundHandler>,
        id_window: Arc<DedupWindow>,
    ) -> Self {
        Self {
            agent_id,
            config,
            rows,
            realtime,
            handler,
            id_window,
            boot_time: Utc::now(),
        }
    }

    pub fn boot_time(&self) -> DateTime<Utc> {
        self.boot_time
    }

    /// Subscribe the fast path. The returned session owns the
    /// subscription and disconnects it before handing control back.
    pub async fn connect(self: Arc<Self>) -> Result<InboundSession> {
        let subscription = self.realtime.subscribe(&self.agent_id).await?;
        Ok(InboundSession {
            inbound: self,
            subscription,
        })
    }

    /// One pass of the safety net: quarantine pre-boot rows, then claim
    /// and deliver unseen live ones.
    pub async fn poll_rows(&self) {
        match self
            .rows
            .quarantine_before(&self.agent_id, self.boot_time)
            .await
        {
            Ok(0) => {}
            Ok(count) => info!(count, "quarantined stale pending rows"),
            Err(e) => warn!(error = %e, "stale-row quarantine failed"),
        }

        let pending = match self.rows.pending_for(&self.agent_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "safety-net poll failed");
                return;
            }
        };

        for row in pending {
            if row.created_at < self.boot_time {
                // Raced the bulk quarantine; the next pass gets it.
                continue;
            }
            if self.id_window.contains(&row.message_id) {
                continue;
            }
            // Claim before invoking. A lost claim means another path owns
            // the invocation; claim errors fail open to the local gate.
            match self.rows.claim(&self.agent_id, &row.message_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(message_id = %row.message_id, "claim lost; other path owns this row");
                    continue;
                }
                Err(e) => {
                    warn!(message_id = %row.message_id, error = %e, "claim failed; invoking anyway");
                }
            }
            self.deliver(InboundEvent::Dispatch(row.payload)).await;
        }
    }

    /// Mark the id window, claim dispatch rows best-effort, then invoke
    /// the matching callback once.
    async fn deliver(&self, event: InboundEvent) {
        if self
            .id_window
            .mark(event.message_id(), self.config.id_ttl())
        {
            debug!(message_id = %event.message_id(), "duplicate delivery; dropping");
            return;
        }
        match event {
            InboundEvent::Dispatch(payload) => {
                if let Err(e) = self.rows.claim(&self.agent_id, &payload.message_id).await {
                    warn!(message_id = %payload.message_id, error = %e, "fast-path claim failed; invoking anyway");
                }
                self.handler.on_dispatch(payload).await;
            }
            InboundEvent::Coordination {
                speaker, content, ..
            } => {
                // Malformed and unknown records die here, quietly.
                if let Some(record) = protocol::parse_record(&content) {
                    self.handler.on_coordination(&speaker, record).await;
                }
            }
        }
    }

    async fn health_ping(&self) {
        if let Err(e) = self.rows.ping().await {
            warn!(error = %e, "health ping failed");
        }
    }
}

/// A connected fast path plus the polling loops around it.
pub struct InboundSession {
    inbound: Arc<ReliableInbound>,
    subscription: Box<dyn Subscription>,
}

impl InboundSession {
    /// Pump events until shutdown or death. The subscription is always
    /// disconnected (awaited) before this returns, so the supervisor can
    /// safely create a fresh one without ghost deliveries.
    pub async fn pump(self, shutdown: &mut watch::Receiver<bool>) -> PumpEnd {
        let InboundSession {
            inbound,
            mut subscription,
        } = self;

        let mut poll = tokio::time::interval(inbound.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut health = tokio::time::interval(inbound.config.health_interval());
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first health tick; the first poll tick is
        // wanted immediately for the boot-time quarantine.
        health.tick().await;

        let end = loop {
            tokio::select! {
                event = subscription.next() => match event {
                    Some(event) => inbound.deliver(event).await,
                    None => {
                        break PumpEnd::Died(ChorusError::Subscription(
                            "fast path closed".to_string(),
                        ));
                    }
                },
                _ = poll.tick() => inbound.poll_rows().await,
                _ = health.tick() => inbound.health_ping().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break PumpEnd::Shutdown;
                    }
                }
            }
        };

        subscription.disconnect().await;
        end
    }
}
