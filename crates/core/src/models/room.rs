//! Room model - a broadcast domain with membership and recent history

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ChatMessage;

/// Messages retained per room for history replay.
pub const HISTORY_WINDOW: usize = 50;

/// The room every participant lands in unless they ask for another.
pub const DEFAULT_ROOM: &str = "main";

/// A room: membership set plus a bounded FIFO of recent messages.
///
/// A participant appears in at most one room's member set at a time; the
/// hub enforces this by moving sessions rather than copying them.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub name: String,
    members: HashSet<Uuid>,
    history: VecDeque<ChatMessage>,
    pub created_at: DateTime<Utc>,
}

/// Room summary sent to a joining participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            members: HashSet::new(),
            history: VecDeque::with_capacity(HISTORY_WINDOW),
            created_at: Utc::now(),
        }
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
        }
    }

    pub fn insert_member(&mut self, id: Uuid) -> bool {
        self.members.insert(id)
    }

    pub fn remove_member(&mut self, id: Uuid) -> bool {
        self.members.remove(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.members.contains(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.members.iter().copied()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Append to the history window, dropping the oldest past capacity.
    pub fn record_message(&mut self, message: ChatMessage) {
        if self.history.len() >= HISTORY_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }

    /// Recent messages, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }

    pub fn message_count(&self) -> usize {
        self.history.len()
    }
}
