//! Typed entity-changed events.
//!
//! Every successful write a job performs is announced on a broadcast channel
//! so observers (UI layers, protocol handlers) can re-read the entity store.
//! This is the only completion signal the core exposes: `enqueue` is
//! fire-and-forget, and failures surface solely as state that never
//! converges.

use tokio::sync::broadcast;

/// Capacity of the broadcast channel; slow subscribers lag rather than block
/// the workers.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A successful write to the entity store.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityEvent {
    ConversationUpdated { conversation_id: String },
    ConversationExited { conversation_id: String },
    UserUpdated { user_id: String },
    AssetUpdated { asset_id: String },
}

/// Create the event channel the engine publishes on.
pub fn channel() -> broadcast::Sender<EntityEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
