//! Wire frame taxonomy
//!
//! Every frame is a self-describing JSON record with a `type` field.
//! Decoding rejects records lacking `type` or naming an unknown kind;
//! unknown extra fields are ignored for forward compatibility. Vector
//! clocks cross the wire as ID-ordered `[[id, count], …]` pairs and
//! timestamps as integer milliseconds since the epoch — both handled by
//! the core types' serde impls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use causerie_core::{ChatMessage, MessageMetadata, ParticipantInfo, RoomInfo, VectorClock};

/// Frames sent by a participant to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Enter a room under a display name. Omitting `room_id` selects the
    /// default room.
    Join {
        username: String,
        #[serde(default)]
        room_id: Option<String>,
    },

    /// Send a chat message. `vector_clock` is the sender's clock after its
    /// own tick for this send; the hub folds it into the session clock
    /// before stamping.
    Chat {
        text: String,
        vector_clock: VectorClock,
        #[serde(default)]
        metadata: MessageMetadata,
    },

    /// Typing indicator, relayed to the room excluding the sender.
    Typing { is_typing: bool },

    /// Ask for the room's recent history window.
    RequestHistory,

    /// Ask for the room's current user list.
    GetUsers,

    /// Liveness probe; the hub replies with `pong`.
    Ping,
}

/// Frames sent by the hub to a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection: the assigned participant ID.
    Init {
        client_id: Uuid,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        server_time: DateTime<Utc>,
        default_room: String,
    },

    /// Reply to a successful join.
    JoinSuccess {
        room: RoomInfo,
        users: Vec<ParticipantInfo>,
        message_count: usize,
    },

    /// Current membership of the room, broadcast on join/leave.
    UserList {
        users: Vec<ParticipantInfo>,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    /// A stamped chat message.
    Chat(ChatMessage),

    /// Human-readable notice (joins, leaves, state errors). Not
    /// vector-clock stamped; delivered without buffering.
    System {
        message: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<Uuid>,
    },

    /// Reply to `request_history`: the room's recent window, oldest first.
    History {
        messages: Vec<ChatMessage>,
        total: usize,
    },

    /// A peer's typing indicator.
    UserTyping {
        user_id: Uuid,
        username: String,
        is_typing: bool,
    },

    /// Acknowledgement to the sender: the hub stamped and recorded the
    /// message under `message_id`.
    MessageDelivered {
        message_id: Uuid,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    /// Reply to `ping`.
    Pong,
}
