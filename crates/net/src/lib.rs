//! Causerie Network Library
//!
//! TCP transport for causal-order group chat.
//!
//! # Architecture
//!
//! - **Hub**: accepts participant connections, stamps chat messages with
//!   the sender's vector clock, and fans them out per room
//! - **Client**: connects to a hub and releases incoming chat through its
//!   causal delivery engine, so the UI only ever sees causal order
//! - **Protocol**: length-prefixed JSON frames with a `type` tag
//!
//! # Usage
//!
//! ```ignore
//! // Operator starts a hub
//! let hub = Hub::start(8080).await?;
//!
//! // Participants connect and join
//! let mut client = Client::connect(hub.addr()).await?;
//! client.join("alice", None).await?;
//!
//! // Process events
//! while let Some(event) = client.next_event().await {
//!     match event {
//!         ClientEvent::Chat(msg) => { /* causally ordered */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod hub;
pub mod protocol;

pub use client::{Client, ClientEvent};
pub use error::{Error, Result};
pub use hub::{Hub, DEFAULT_PORT};
pub use protocol::{ClientFrame, ServerFrame};
