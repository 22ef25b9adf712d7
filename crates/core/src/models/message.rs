//! Chat message model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::VectorClock;

/// Simulation hints carried in a message's metadata.
///
/// When `simulate_delay` is set the hub defers the fan-out by `delay_ms`
/// milliseconds while stamping, history append, and the sender ack happen
/// immediately. This artificially reorders arrivals so causal delivery can
/// be exercised end-to-end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub simulate_delay: bool,
    #[serde(default)]
    pub delay_ms: u64,
}

impl MessageMetadata {
    /// Metadata requesting a deferred fan-out.
    pub fn delayed(delay_ms: u64) -> Self {
        Self {
            simulate_delay: true,
            delay_ms,
        }
    }
}

/// A chat message stamped with the sender's vector clock.
///
/// The stamp is the sender's clock *after* it was incremented for this
/// send. Wire field names follow the frame schema (`user_id`,
/// `vector_clock`); timestamps cross the wire as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: String,
    #[serde(rename = "user_id")]
    pub sender_id: Uuid,
    #[serde(rename = "username")]
    pub sender_username: String,
    pub text: String,
    #[serde(rename = "vector_clock")]
    pub clock: VectorClock,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl ChatMessage {
    pub fn new(
        room_id: impl Into<String>,
        sender_id: Uuid,
        sender_username: impl Into<String>,
        text: impl Into<String>,
        clock: VectorClock,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: room_id.into(),
            sender_id,
            sender_username: sender_username.into(),
            text: text.into(),
            clock,
            timestamp: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
