//! Participant model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::VectorClock;

/// A participant as presented in user-list updates.
///
/// The ID is assigned by the hub on connect and is what keys vector
/// clocks; the display name is chosen at join time and is advisory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: Uuid,
    pub username: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
    pub vector_clock: VectorClock,
}
