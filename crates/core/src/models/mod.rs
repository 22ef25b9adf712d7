//! Data models for Causerie

mod message;
mod participant;
mod room;

pub use message::*;
pub use participant::*;
pub use room::*;
