//! Participant client for a Causerie hub
//!
//! The client owns the local vector clock and the causal delivery engine:
//! incoming chat frames are offered to the engine and surface as
//! [`ClientEvent::Chat`] only once causally ready, in deterministic causal
//! order. Own messages are echoed optimistically by `send_chat` and never
//! re-enter the engine.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use causerie_core::{
    BufferedInfo, CausalEngine, ChatMessage, EngineStats, MessageMetadata, Offer, ParticipantInfo,
    RoomInfo, VectorClock,
};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{ClientFrame, ServerFrame};

/// Event surfaced to the presentation layer
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The hub assigned our participant ID
    Ready {
        client_id: Uuid,
        default_room: String,
    },
    /// Successfully joined a room
    Joined {
        room: RoomInfo,
        users: Vec<ParticipantInfo>,
        message_count: usize,
    },
    /// A peer's chat message, released by the causal engine
    Chat(ChatMessage),
    /// A message we sent was stamped and recorded by the hub
    Acked {
        local_id: Uuid,
        message_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    /// Notice from the hub (joins, leaves, state errors)
    System {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Updated room roster
    UserList { users: Vec<ParticipantInfo> },
    /// A peer's typing indicator
    Typing {
        user_id: Uuid,
        username: String,
        is_typing: bool,
    },
    /// A history reply finished replaying through the engine
    HistoryReplayed { total: usize },
    /// Pong from the hub
    Pong,
    /// Connection lost
    Disconnected,
}

/// Client handle
pub struct Client {
    state: Arc<RwLock<ClientState>>,
    event_rx: mpsc::Receiver<ClientEvent>,
    cmd_tx: mpsc::Sender<Command>,
}

struct ClientState {
    client_id: Option<Uuid>,
    username: Option<String>,
    room_id: Option<String>,
    engine: CausalEngine,
    /// Provisional IDs of sends awaiting their `message_delivered` ack,
    /// oldest first. The transport is FIFO, so acks pair up in order.
    pending: VecDeque<Uuid>,
}

enum Command {
    Send(ClientFrame),
    Disconnect,
}

impl Client {
    /// Connect to a hub. The returned client is anonymous until
    /// [`Client::join`]; the `Ready` event carries the assigned ID.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        info!(addr = %addr, "Connecting to hub");

        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = tokio::io::split(stream);

        let state = Arc::new(RwLock::new(ClientState {
            client_id: None,
            username: None,
            room_id: None,
            engine: CausalEngine::new(),
            pending: VecDeque::new(),
        }));

        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        tokio::spawn(connection_task(
            reader,
            writer,
            state.clone(),
            event_tx,
            cmd_rx,
        ));

        Ok(Client {
            state,
            event_rx,
            cmd_tx,
        })
    }

    /// Get the next event
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    /// Our hub-assigned participant ID, once `init` has arrived
    pub async fn client_id(&self) -> Option<Uuid> {
        self.state.read().await.client_id
    }

    /// Snapshot of the local causal clock
    pub async fn clock(&self) -> VectorClock {
        self.state.read().await.engine.local_clock().snapshot()
    }

    /// Causal engine counters
    pub async fn engine_stats(&self) -> EngineStats {
        self.state.read().await.engine.stats()
    }

    /// Messages currently withheld waiting for predecessors
    pub async fn buffered(&self) -> Vec<BufferedInfo> {
        self.state.read().await.engine.buffered()
    }

    /// Join a room under a display name. `None` selects the default room.
    pub async fn join(&self, username: impl Into<String>, room_id: Option<String>) -> Result<()> {
        let username = username.into();
        self.state.write().await.username = Some(username.clone());
        self.send(ClientFrame::Join { username, room_id }).await
    }

    /// Send a chat message.
    ///
    /// Ticks the local clock and returns the optimistic local echo with a
    /// provisional ID; the hub's `message_delivered` ack reconciles it
    /// (surfaced as [`ClientEvent::Acked`]). Our own tick happens-before
    /// anything we do next, so displaying the echo immediately is
    /// consistent with causal order.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatMessage> {
        self.send_chat_with(text, MessageMetadata::default()).await
    }

    /// Send a chat message with metadata, e.g. a simulated fan-out delay
    pub async fn send_chat_with(
        &self,
        text: impl Into<String>,
        metadata: MessageMetadata,
    ) -> Result<ChatMessage> {
        let text = text.into();
        let (frame, echo) = {
            let mut s = self.state.write().await;
            let client_id = s.client_id.ok_or(Error::NotConnected)?;
            let (room_id, username) = match (s.room_id.clone(), s.username.clone()) {
                (Some(room_id), Some(username)) => (room_id, username),
                _ => return Err(Error::NotJoined),
            };

            let stamp = s.engine.tick(client_id);
            let echo = ChatMessage::new(room_id, client_id, username, text.clone(), stamp.clone())
                .with_metadata(metadata);
            s.pending.push_back(echo.id);

            (
                ClientFrame::Chat {
                    text,
                    vector_clock: stamp,
                    metadata,
                },
                echo,
            )
        };

        self.send(frame).await?;
        Ok(echo)
    }

    /// Send a typing indicator
    pub async fn typing(&self, is_typing: bool) -> Result<()> {
        self.send(ClientFrame::Typing { is_typing }).await
    }

    /// Ask for the room's recent history; replies replay through the
    /// causal engine and surface as ordinary `Chat` events
    pub async fn request_history(&self) -> Result<()> {
        self.send(ClientFrame::RequestHistory).await
    }

    /// Ask for the room's current user list
    pub async fn get_users(&self) -> Result<()> {
        self.send(ClientFrame::GetUsers).await
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<()> {
        self.send(ClientFrame::Ping).await
    }

    /// Disconnect from the hub
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }

    async fn send(&self, frame: ClientFrame) -> Result<()> {
        self.cmd_tx
            .send(Command::Send(frame))
            .await
            .map_err(|_| Error::NotConnected)
    }
}

/// Main connection task
async fn connection_task(
    mut reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    state: Arc<RwLock<ClientState>>,
    event_tx: mpsc::Sender<ClientEvent>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    loop {
        tokio::select! {
            result = read_frame::<_, ServerFrame>(&mut reader) => {
                match result {
                    Ok(frame) => {
                        handle_server_frame(frame, &state, &event_tx).await;
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!("Hub closed connection");
                        break;
                    }
                    Err(Error::Protocol(e)) => {
                        warn!(error = %e, "Dropping malformed frame");
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }
        }
    }

    let _ = event_tx.send(ClientEvent::Disconnected).await;
    info!("Disconnected from hub");
}

/// Handle one frame from the hub
async fn handle_server_frame(
    frame: ServerFrame,
    state: &Arc<RwLock<ClientState>>,
    event_tx: &mpsc::Sender<ClientEvent>,
) {
    match frame {
        ServerFrame::Init {
            client_id,
            server_time: _,
            default_room,
        } => {
            {
                let mut s = state.write().await;
                s.client_id = Some(client_id);
                s.engine.observe(client_id);
            }
            info!(client_id = %client_id, "Hub assigned identity");
            let _ = event_tx
                .send(ClientEvent::Ready {
                    client_id,
                    default_room,
                })
                .await;
        }
        ServerFrame::JoinSuccess {
            room,
            users,
            message_count,
        } => {
            state.write().await.room_id = Some(room.id.clone());
            info!(room_id = %room.id, users = users.len(), "Joined room");
            let _ = event_tx
                .send(ClientEvent::Joined {
                    room,
                    users,
                    message_count,
                })
                .await;
        }
        ServerFrame::Chat(message) => {
            let released = {
                let mut s = state.write().await;
                offer_to_engine(&mut s, message)
            };
            for message in released {
                let _ = event_tx.send(ClientEvent::Chat(message)).await;
            }
        }
        ServerFrame::History { messages, total } => {
            let released = {
                let mut s = state.write().await;
                let mut released = Vec::new();
                for message in messages {
                    released.extend(offer_to_engine(&mut s, message));
                }
                released
            };
            for message in released {
                let _ = event_tx.send(ClientEvent::Chat(message)).await;
            }
            let _ = event_tx.send(ClientEvent::HistoryReplayed { total }).await;
        }
        ServerFrame::System {
            message,
            timestamp,
            user_id: _,
        } => {
            let _ = event_tx.send(ClientEvent::System { message, timestamp }).await;
        }
        ServerFrame::UserList {
            users,
            timestamp: _,
        } => {
            let _ = event_tx.send(ClientEvent::UserList { users }).await;
        }
        ServerFrame::UserTyping {
            user_id,
            username,
            is_typing,
        } => {
            let _ = event_tx
                .send(ClientEvent::Typing {
                    user_id,
                    username,
                    is_typing,
                })
                .await;
        }
        ServerFrame::MessageDelivered {
            message_id,
            timestamp,
        } => {
            let local_id = state.write().await.pending.pop_front();
            match local_id {
                Some(local_id) => {
                    debug!(local_id = %local_id, message_id = %message_id, "Send acknowledged");
                    let _ = event_tx
                        .send(ClientEvent::Acked {
                            local_id,
                            message_id,
                            timestamp,
                        })
                        .await;
                }
                None => {
                    debug!(message_id = %message_id, "Ack with no pending send");
                }
            }
        }
        ServerFrame::Pong => {
            let _ = event_tx.send(ClientEvent::Pong).await;
        }
    }
}

/// Offer one incoming message to the engine and collect everything it
/// releases, in delivery order. Self-sent echoes are suppressed by sender
/// ID; the hub already excludes the sender from fan-out, so this only
/// fires for our own messages replayed from history.
fn offer_to_engine(s: &mut ClientState, message: ChatMessage) -> Vec<ChatMessage> {
    if s.client_id == Some(message.sender_id) {
        debug!(message_id = %message.id, "Suppressing own echo");
        return Vec::new();
    }

    match s.engine.offer(message) {
        Offer::Delivered(first) => {
            let mut released = vec![first];
            released.extend(s.engine.drain());
            released
        }
        Offer::Buffered => {
            debug!(
                buffered = s.engine.stats().current_buffer_size,
                "Message waiting for causal predecessors"
            );
            Vec::new()
        }
        Offer::Duplicate => {
            debug!("Duplicate message dropped");
            Vec::new()
        }
        Offer::Overflow => {
            warn!("Causal buffer overflow; message dropped");
            Vec::new()
        }
    }
}
