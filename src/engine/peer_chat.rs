//! Layer-2 free-form peer chat, multiplexed on the coordination stream.
//!
//! Chatter never outranks a live negotiation: while any round is
//! unresolved these records are dropped outright. Replies are depth-capped
//! and pass through their own bounded gate.

use tracing::{debug, warn};

use super::CoordinationEngine;
use crate::dedup;
use crate::host::GatewayOpts;
use crate::prompts;
use crate::protocol::{CoordRecord, PeerChat, RecordBody};

pub(super) async fn handle(
    engine: &CoordinationEngine,
    speaker: &str,
    record: &CoordRecord,
    chat: &PeerChat,
) {
    let kind = record.body.kind_name();

    if engine.has_unresolved_round() {
        debug!(speaker, kind, "round in flight; dropping peer chat");
        return;
    }
    if !chat.is_addressed_to(&engine.name) {
        debug!(speaker, kind, to = ?chat.to, "peer chat addressed elsewhere");
        return;
    }

    let key = dedup::speaker_key(
        speaker,
        &chat.content,
        engine.config.peer_chat.dedup_prefix_chars,
    );
    if engine
        .peer_window
        .mark(&key, engine.config.inbound.content_ttl())
    {
        debug!(speaker, kind, "duplicate peer chat; dropping");
        return;
    }

    let depth = chat.depth();
    if depth >= engine.config.peer_chat.depth_cap {
        debug!(speaker, depth, "peer chat depth cap reached");
        return;
    }

    let wants_reply = chat.expects_reply.unwrap_or(matches!(
        record.body,
        RecordBody::Question(_) | RecordBody::Delegate(_)
    ));
    if !wants_reply {
        return;
    }

    let Some(_permit) = engine.layer2_gate.enter().await else {
        return;
    };

    let prompt = prompts::peer_chat_reply(&engine.name, speaker, kind, &chat.content, depth);
    let reply = match tokio::time::timeout(
        engine.config.gateway.timeout(),
        engine.ports.gateway.call(&prompt, GatewayOpts::default()),
    )
    .await
    {
        Ok(Ok(Some(text))) => text,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!(speaker, error = %e, "peer chat gateway call failed");
            return;
        }
        Err(_) => {
            warn!(speaker, "peer chat gateway call timed out");
            return;
        }
    };

    let response = CoordRecord::new(
        &engine.name,
        None,
        RecordBody::Inform(PeerChat {
            to: Some(speaker.to_string()),
            content: reply,
            expects_reply: Some(false),
            depth: Some(depth + 1),
        }),
    );
    engine.post(&response).await;
    engine.state.lock().stats.peer_chat_replies += 1;
}
