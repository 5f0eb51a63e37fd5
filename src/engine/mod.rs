//! Coordination engine: the round state machine.
//!
//! One engine instance exists per agent. All mutable coordination state
//! (round store, registers, dedup windows, stats) lives behind a single
//! mutex that is never held across an await; every await in the event
//! paths is bracketed by re-checks of `resolved` and of round existence.

mod decision;
mod peer_chat;

pub use decision::{DecisionAction, DispatchDecision};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ChorusConfig;
use crate::dedup::{self, DedupWindow};
use crate::dispatch::{DispatchHolder, HoldOutcome, ReplyObserver};
use crate::error::Result;
use crate::filter::{self, Mode};
use crate::gate::BoundedGate;
use crate::history::HistoryLoader;
use crate::host::{DispatchPayload, HostPorts};
use crate::inbound::{BackoffPolicy, InboundHandler, ReconnectSupervisor, ReliableInbound};
use crate::prompts;
use crate::protocol::{CoordRecord, MicroProposal, RecordBody};
use crate::register::RegisterState;
use crate::round::{RoundState, RoundStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub rounds_started: u64,
    pub resolved_solo: u64,
    pub resolved_parallel: u64,
    pub resolved_synthesis: u64,
    pub fail_opens: u64,
    pub proposals_posted: u64,
    pub peer_chat_replies: u64,
    pub records_dropped: u64,
}

struct EngineState {
    rounds: RoundStore,
    registers: HashMap<String, RegisterState>,
    stats: EngineStats,
}

pub struct CoordinationEngine {
    name: String,
    config: ChorusConfig,
    ports: HostPorts,
    history: Arc<HistoryLoader>,
    holder: Arc<DispatchHolder>,
    state: Mutex<EngineState>,
    /// Shared with the inbound layer, which marks it before any callback.
    id_window: Arc<DedupWindow>,
    content_window: DedupWindow,
    peer_window: DedupWindow,
    gateway_gate: BoundedGate,
    layer2_gate: BoundedGate,
    stopped: AtomicBool,
    self_ref: Weak<CoordinationEngine>,
}

/// What the generator path still owes after my proposal settled.
enum GenerationOutcome {
    Post {
        proposal: MicroProposal,
        source_chat_id: Option<String>,
        resolve: bool,
    },
    AlreadyResolved,
    FailOpen { trigger_message_id: String },
}

impl CoordinationEngine {
    pub fn new(config: ChorusConfig, ports: HostPorts) -> Arc<Self> {
        let history = Arc::new(HistoryLoader::new(
            Arc::clone(&ports.reads),
            config.history.clone(),
        ));
        Arc::new_cyclic(|weak: &Weak<CoordinationEngine>| {
            let observer: Weak<dyn ReplyObserver> = weak.clone();
            let holder = DispatchHolder::new(
                config.agent.name.clone(),
                config.dispatch.clone(),
                Arc::clone(&ports.chat),
                Arc::clone(&history),
                observer,
            );
            Self {
                name: config.agent.name.clone(),
                gateway_gate: BoundedGate::new("gateway", config.gateway.inflight_max),
                layer2_gate: BoundedGate::new("peer-chat", config.peer_chat.inflight_max),
                id_window: Arc::new(DedupWindow::new("inbound-id")),
                content_window: DedupWindow::new("inbound-content"),
                peer_window: DedupWindow::new("peer-chat"),
                state: Mutex::new(EngineState {
                    rounds: RoundStore::new(),
                    registers: HashMap::new(),
                    stats: EngineStats::default(),
                }),
                history,
                holder,
                config,
                ports,
                stopped: AtomicBool::new(false),
                self_ref: weak.clone(),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &Arc<DispatchHolder> {
        &self.holder
    }

    pub fn id_window(&self) -> &Arc<DedupWindow> {
        &self.id_window
    }

    pub fn stats(&self) -> EngineStats {
        self.state.lock().stats
    }

    /// A user message arrived on the dispatch stream.
    pub async fn handle_dispatch(&self, payload: DispatchPayload) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        // Same logical message may arrive as a second row under a fresh id.
        let key = dedup::content_key(&payload.chat_id, &payload.user_id, &payload.text);
        if self
            .content_window
            .mark(&key, self.config.inbound.content_ttl())
        {
            debug!(message_id = %payload.message_id, "duplicate content; dropping");
            return;
        }

        if !self.config.agent.coordination_enabled {
            self.holder.dispatch_direct(&payload).await;
            return;
        }

        match self.holder.hold(&payload).await {
            HoldOutcome::Held => {
                // The peer may have driven the whole round to resolution
                // before our copy of the trigger arrived; that terminal
                // decision hit an unheld message and will not come again.
                if let Some(decision) = self.defer_for_settled_round(&payload.message_id) {
                    self.holder.apply_decision(decision).await;
                } else {
                    self.start_round(
                        &payload.message_id,
                        &payload.message_id,
                        &payload.text,
                        Some(payload.chat_id.clone()),
                        true,
                    )
                    .await;
                }
            }
            HoldOutcome::Bypassed | HoldOutcome::MentionElsewhere | HoldOutcome::Duplicate => {}
        }
    }

    /// Initial defer: the trigger is held, but its round already resolved
    /// locally, so no terminal decision is coming. The holder re-arms a
    /// shorter backstop; if both peers ended up here, the alphabetical
    /// tiebreak picks a single replier.
    fn defer_for_settled_round(&self, round_id: &str) -> Option<DispatchDecision> {
        let guard = self.state.lock();
        let round = guard.rounds.get(round_id)?;
        if !round.resolved {
            return None;
        }
        debug!(round_id, "round settled before hold; deferring");
        Some(DispatchDecision {
            round_id: round_id.to_string(),
            trigger_message_id: round.trigger_message_id.clone(),
            action: DecisionAction::Defer {
                peer_name: round.other_name.clone(),
            },
        })
    }

    /// A record arrived on the shared coordination stream.
    pub async fn handle_coordination(&self, speaker: &str, record: CoordRecord) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let from = record.from.as_deref().unwrap_or(speaker);
        if from == self.name {
            // Our own records echo back on the shared stream.
            return;
        }

        match &record.body {
            RecordBody::RoundStart {
                trigger_message_id,
                trigger_content,
            } => {
                let Some(round_id) = record.round_id.as_deref() else {
                    self.drop_record("round_start without round_id");
                    return;
                };
                self.start_round(
                    round_id,
                    trigger_message_id,
                    trigger_content,
                    record.source_chat_id.clone(),
                    false,
                )
                .await;
            }
            RecordBody::MicroPropose { proposal } => {
                let Some(round_id) = record.round_id.as_deref() else {
                    self.drop_record("micro_propose without round_id");
                    return;
                };
                self.on_peer_proposal(from, round_id, proposal.clone()).await;
            }
            RecordBody::Resolved { mode, winner, .. } => {
                debug!(from, %mode, winner, "peer resolution observed");
            }
            RecordBody::Signal { .. } => {
                debug!(from, "signal record observed");
            }
            RecordBody::Question(chat)
            | RecordBody::Inform(chat)
            | RecordBody::Flag(chat)
            | RecordBody::Delegate(chat)
            | RecordBody::Status(chat) => {
                peer_chat::handle(self, from, &record, chat).await;
            }
        }
    }

    /// Insert round state, arm the deadline and kick off proposal
    /// generation. Drops silently when the round already exists.
    async fn start_round(
        &self,
        round_id: &str,
        trigger_message_id: &str,
        trigger_content: &str,
        source_chat_id: Option<String>,
        emit_start: bool,
    ) {
        {
            let mut guard = self.state.lock();
            if guard.rounds.contains(round_id) {
                debug!(round_id, "round already exists; dropping start");
                return;
            }
            let mut round = RoundState::new(round_id, trigger_message_id, trigger_content)
                .with_source_chat(source_chat_id.clone());
            round.deadline_timer = Some(self.arm_deadline(round_id));
            guard.rounds.insert(round);
            guard.stats.rounds_started += 1;
        }
        info!(round_id, "round started");

        if emit_start {
            let record =
                CoordRecord::round_start(&self.name, round_id, trigger_message_id, trigger_content)
                    .with_source_chat(source_chat_id);
            self.post(&record).await;
        }

        self.generate_proposal(round_id).await;
    }

    async fn generate_proposal(&self, round_id: &str) {
        let source_chat_id = match self.state.lock().rounds.get(round_id) {
            Some(round) => round.source_chat_id.clone(),
            None => return,
        };

        // Both context loads are best-effort and run concurrently.
        let (coord_history, peer_replies) = tokio::join!(
            self.history.coordination_history(round_id),
            self.history
                .recent_peer_replies(source_chat_id.as_deref().unwrap_or(""), &self.name),
        );

        let prompt = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(round) = state.rounds.get_mut(round_id) else {
                return;
            };
            round.coord_history = coord_history;
            round.recent_peer_replies = peer_replies;
            let register = round
                .source_chat_id
                .as_ref()
                .and_then(|chat_id| state.registers.get(chat_id))
                .cloned()
                .unwrap_or_default();
            prompts::micro_proposal(
                &self.name,
                &round.trigger_content,
                &register,
                &round.coord_history,
                &round.recent_peer_replies,
            )
        };

        let proposal = self.call_for_proposal(&prompt).await;

        // Generation settled, success or not: cleanup gets scheduled now.
        let outcome = {
            let mut guard = self.state.lock();
            let Some(round) = guard.rounds.get_mut(round_id) else {
                return;
            };
            round.cleanup_timer = Some(self.arm_cleanup(round_id));
            match proposal {
                Some(proposal) => {
                    round.my_proposal = Some(proposal.clone());
                    if round.resolved {
                        // The deadline won the race; nothing further may
                        // be emitted for this round.
                        GenerationOutcome::AlreadyResolved
                    } else {
                        GenerationOutcome::Post {
                            proposal,
                            source_chat_id: round.source_chat_id.clone(),
                            resolve: round.other_proposal.is_some(),
                        }
                    }
                }
                None if round.resolved => GenerationOutcome::AlreadyResolved,
                None => GenerationOutcome::FailOpen {
                    trigger_message_id: round.trigger_message_id.clone(),
                },
            }
        };

        match outcome {
            GenerationOutcome::Post {
                proposal,
                source_chat_id,
                resolve,
            } => {
                let record = CoordRecord::micro_propose(&self.name, round_id, proposal)
                    .with_source_chat(source_chat_id);
                self.post(&record).await;
                self.state.lock().stats.proposals_posted += 1;
                if resolve {
                    self.resolve_round(round_id).await;
                }
            }
            GenerationOutcome::AlreadyResolved => {
                debug!(round_id, "proposal settled after resolution; discarded");
            }
            GenerationOutcome::FailOpen { trigger_message_id } => {
                error!(round_id, "proposal generation failed; failing open");
                {
                    let mut guard = self.state.lock();
                    guard.rounds.remove(round_id);
                    guard.stats.fail_opens += 1;
                }
                self.holder
                    .apply_decision(DispatchDecision::fail_open(round_id, &trigger_message_id))
                    .await;
            }
        }
    }

    /// Fast gateway call with a per-call session, one retry at doubled
    /// timeout, and the output parsed into a proposal.
    async fn call_for_proposal(&self, prompt: &str) -> Option<MicroProposal> {
        let Some(_permit) = self.gateway_gate.enter().await else {
            return None;
        };
        let mut timeout = self.config.gateway.timeout();
        for attempt in 0..=self.config.gateway.retries {
            match tokio::time::timeout(timeout, self.ports.gateway.call_fast(prompt)).await {
                Ok(Ok(Some(text))) => match MicroProposal::from_model_output(&text) {
                    Some(proposal) => return Some(proposal),
                    None => warn!(attempt, "unparseable proposal output"),
                },
                Ok(Ok(None)) => warn!(attempt, "gateway returned no proposal"),
                Ok(Err(e)) => warn!(attempt, error = %e, "proposal gateway call failed"),
                Err(_) => warn!(attempt, "proposal gateway call timed out"),
            }
            timeout *= 2;
        }
        None
    }

    async fn on_peer_proposal(&self, from: &str, round_id: &str, proposal: MicroProposal) {
        let ready = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(round) = state.rounds.get_mut(round_id) else {
                state.stats.records_dropped += 1;
                debug!(round_id, from, "proposal for unknown round; dropping");
                return;
            };
            if round.resolved {
                state.stats.records_dropped += 1;
                debug!(round_id, from, "proposal for resolved round; dropping");
                return;
            }
            // Buffered if our own proposal is still generating.
            round.other_proposal = Some(proposal);
            round.other_name = Some(from.to_string());
            round.ready_to_resolve()
        };
        if ready {
            self.resolve_round(round_id).await;
        }
    }

    /// One-shot: run the filter, emit the terminal record, raise the
    /// decision.
    async fn resolve_round(&self, round_id: &str) {
        let (record, signal, decision) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(round) = state.rounds.get_mut(round_id) else {
                return;
            };
            if !round.ready_to_resolve() {
                return;
            }
            round.resolve();
            let (Some(mine), Some(theirs), Some(other_name)) = (
                round.my_proposal.clone(),
                round.other_proposal.clone(),
                round.other_name.clone(),
            ) else {
                return;
            };
            let source_chat_id = round.source_chat_id.clone();
            let trigger_message_id = round.trigger_message_id.clone();
            let result =
                filter::resolve(&mine, &theirs, &self.name, &other_name, &self.config.filter);
            match result.mode {
                Mode::Solo => state.stats.resolved_solo += 1,
                Mode::Parallel => state.stats.resolved_parallel += 1,
                Mode::Synthesis => state.stats.resolved_synthesis += 1,
            }
            info!(round_id, mode = %result.mode, winner = %result.winner, "round resolved");

            let record = CoordRecord::new(
                &self.name,
                Some(round_id.to_string()),
                RecordBody::Resolved {
                    mode: result.mode,
                    winner: result.winner.clone(),
                    runner_up: result.runner_up.clone(),
                    reason: result.reason.clone(),
                    my_proposal: mine.clone(),
                    other_proposal: theirs.clone(),
                },
            )
            .with_source_chat(source_chat_id.clone());

            // The resolved record is the round's terminal emission; the
            // signal is unscoped commentary, so it carries no round id.
            let signal = CoordRecord::new(
                &self.name,
                None,
                RecordBody::Signal {
                    solo_insufficient: !mine.solo_sufficient,
                    confidence: mine.confidence,
                    reason: result.reason.clone(),
                    basis: mine.angle.clone(),
                    chain_depth: 0,
                },
            )
            .with_source_chat(source_chat_id);

            let i_won = result.winner == self.name;
            let action = match result.mode {
                Mode::Solo if i_won => DecisionAction::Respond {
                    synthesize_context: Some(prompts::solo_winner_context(
                        &mine.angle,
                        &other_name,
                        &theirs.angle,
                        &result.reason,
                    )),
                },
                Mode::Solo => DecisionAction::Suppress,
                Mode::Parallel => DecisionAction::Respond {
                    synthesize_context: Some(prompts::parallel_context(
                        &mine.angle,
                        &other_name,
                        &theirs.angle,
                    )),
                },
                Mode::Synthesis if i_won => DecisionAction::Respond {
                    synthesize_context: Some(prompts::synthesis_leader_context(
                        &mine.angle,
                        &other_name,
                    )),
                },
                Mode::Synthesis => DecisionAction::AwaitPeer {
                    winner_name: result.winner.clone(),
                    my_proposal: mine,
                    other_proposal: theirs,
                },
            };
            let decision = DispatchDecision {
                round_id: round_id.to_string(),
                trigger_message_id,
                action,
            };
            (record, signal, decision)
        };

        // Neither post rewinds state on failure.
        self.post(&record).await;
        self.post(&signal).await;
        self.holder.apply_decision(decision).await;
    }

    pub(crate) async fn on_round_deadline(&self, round_id: &str) {
        let decision = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(round) = state.rounds.get_mut(round_id) else {
                return;
            };
            if !round.resolve() {
                return;
            }
            state.stats.fail_opens += 1;
            DispatchDecision::fail_open(round_id, &round.trigger_message_id)
        };
        warn!(round_id, "round deadline fired; failing open");
        self.holder.apply_decision(decision).await;
    }

    pub(crate) fn cleanup_round(&self, round_id: &str) {
        let removed = self.state.lock().rounds.remove(round_id);
        if let Some(mut round) = removed {
            // This runs on the cleanup task itself; detach its handle
            // instead of aborting mid-flight.
            if let Some(timer) = round.cleanup_timer.take() {
                drop(timer);
            }
            debug!(round_id, "round state evicted");
        }
    }

    fn has_unresolved_round(&self) -> bool {
        self.state.lock().rounds.any_unresolved()
    }

    fn drop_record(&self, why: &str) {
        self.state.lock().stats.records_dropped += 1;
        debug!(why, "dropping coordination record");
    }

    async fn post(&self, record: &CoordRecord) {
        if let Err(e) = self.ports.chat.post_coordination(&record.to_json()).await {
            warn!(kind = record.body.kind_name(), error = %e, "coordination post failed");
        }
    }

    fn arm_deadline(&self, round_id: &str) -> JoinHandle<()> {
        let engine = self.self_ref.clone();
        let round_id = round_id.to_string();
        let after = self.config.coordination.max_round();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(engine) = engine.upgrade() {
                engine.on_round_deadline(&round_id).await;
            }
        })
    }

    fn arm_cleanup(&self, round_id: &str) -> JoinHandle<()> {
        let engine = self.self_ref.clone();
        let round_id = round_id.to_string();
        let after = self.config.coordination.cleanup();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(engine) = engine.upgrade() {
                engine.cleanup_round(&round_id);
            }
        })
    }

    /// Quiesce: drain gates, drop held work, clear all windows and rounds.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.gateway_gate.drain();
        self.layer2_gate.drain();
        self.holder.stop();
        {
            let mut guard = self.state.lock();
            guard.rounds.clear();
            guard.registers.clear();
        }
        self.id_window.clear();
        self.content_window.clear();
        self.peer_window.clear();
        info!(agent = %self.name, "engine stopped");
    }
}

impl ReplyObserver for CoordinationEngine {
    fn replied(&self, chat_id: &str, round_id: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let angle = state
            .rounds
            .get(round_id)
            .and_then(|round| round.my_proposal.as_ref())
            .map(|proposal| proposal.angle.clone());
        let Some(angle) = angle else {
            return;
        };
        state
            .registers
            .entry(chat_id.to_string())
            .or_default()
            .note_response(&self.name, &angle);
    }
}

#[async_trait]
impl InboundHandler for CoordinationEngine {
    async fn on_dispatch(&self, payload: DispatchPayload) {
        self.handle_dispatch(payload).await;
    }

    async fn on_coordination(&self, speaker: &str, record: CoordRecord) {
        self.handle_coordination(speaker, record).await;
    }
}

/// A running sidecar: the engine plus its supervised inbound loop.
pub struct Sidecar {
    engine: Arc<CoordinationEngine>,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl Sidecar {
    pub fn start(config: ChorusConfig, ports: HostPorts) -> Result<Self> {
        config.validate()?;
        let engine = CoordinationEngine::new(config.clone(), ports.clone());
        let engine_clone: Arc<CoordinationEngine> = Arc::clone(&engine);
        let handler: Arc<dyn InboundHandler> = engine_clone;
        let inbound = Arc::new(ReliableInbound::new(
            config.agent.name.clone(),
            config.inbound.clone(),
            Arc::clone(&ports.rows),
            Arc::clone(&ports.realtime),
            handler,
            Arc::clone(engine.id_window()),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor =
            ReconnectSupervisor::new(inbound, BackoffPolicy::from_config(&config.backoff));
        let supervisor = tokio::spawn(supervisor.run(shutdown_rx));
        Ok(Self {
            engine,
            shutdown,
            supervisor,
        })
    }

    pub fn engine(&self) -> &Arc<CoordinationEngine> {
        &self.engine
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.engine.stop();
        let _ = self.supervisor.await;
    }
}
