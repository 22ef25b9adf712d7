//! Causerie Core Library
//!
//! Vector clocks, the causal delivery engine, and the chat data models.
//! Everything here is transport-free: the net crate layers the wire and
//! the broadcast hub on top.

pub mod causal;
pub mod clock;
pub mod models;

pub use causal::{BufferedInfo, CausalEngine, EngineStats, Offer, DEFAULT_BUFFER_CAPACITY};
pub use clock::{Causality, Readiness, VectorClock};
pub use models::*;
