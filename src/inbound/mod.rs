//! Reliable inbound delivery: fast path, safety-net poll, reconnect.

mod reliable;
mod supervisor;

pub use reliable::{InboundSession, PumpEnd, ReliableInbound};
pub use supervisor::{BackoffPolicy, ReconnectSupervisor};

use async_trait::async_trait;

use crate::host::DispatchPayload;
use crate::protocol::CoordRecord;

/// Upper-layer callbacks. The inbound layer guarantees at-most-once local
/// invocation per logical message id.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_dispatch(&self, payload: DispatchPayload);

    async fn on_coordination(&self, speaker: &str, record: CoordRecord);
}
