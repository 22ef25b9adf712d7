//! Broadcast hub for causal-order chat
//!
//! The hub accepts participant connections, assigns identities, tracks
//! room membership, and stamps every chat message with the sender's
//! vector clock before fanning it out. Causal buffering happens at the
//! recipients; the hub itself only guarantees per-sender FIFO via its
//! single-writer sessions and authoritative stamping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use causerie_core::{
    ChatMessage, MessageMetadata, ParticipantInfo, Room, VectorClock, DEFAULT_ROOM,
};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{ClientFrame, ServerFrame};

/// Default listen port for hubs
pub const DEFAULT_PORT: u16 = 8080;

/// Outbound frames queued per session before backpressure closes it
const OUTBOUND_QUEUE: usize = 64;

/// Liveness probe interval; a session idle past two intervals is closed
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pause between a leave notice and the refreshed user list
const LEAVE_SETTLE: Duration = Duration::from_millis(200);

/// Hub-side state for one connected participant
struct Session {
    id: Uuid,
    /// Set at join time; `None` while Connected-Anonymous
    username: Option<String>,
    room_id: Option<String>,
    /// Authoritative clock for this sender; ticked once per chat frame
    clock: VectorClock,
    tx: mpsc::Sender<ServerFrame>,
    closer: Arc<Notify>,
    joined_at: DateTime<Utc>,
    last_seen: Instant,
}

impl Session {
    fn info(&self) -> Option<ParticipantInfo> {
        self.username.as_ref().map(|username| ParticipantInfo {
            id: self.id,
            username: username.clone(),
            joined_at: self.joined_at,
            vector_clock: self.clock.snapshot(),
        })
    }
}

/// Hub state shared across tasks
struct HubState {
    sessions: HashMap<Uuid, Session>,
    rooms: HashMap<String, Room>,
}

impl HubState {
    fn room_users(&self, room_id: &str) -> Vec<ParticipantInfo> {
        let Some(room) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        let mut users: Vec<ParticipantInfo> = room
            .members()
            .filter_map(|id| self.sessions.get(&id).and_then(Session::info))
            .collect();
        users.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        users
    }
}

/// Hub handle
pub struct Hub {
    addr: SocketAddr,
    state: Arc<RwLock<HubState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Hub {
    /// Start a hub on the given port (0 binds an ephemeral port). The
    /// default room exists from the start; others are created lazily.
    pub async fn start(port: u16) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Hub started");

        let (shutdown_tx, _) = broadcast::channel(1);

        let mut rooms = HashMap::new();
        rooms.insert(DEFAULT_ROOM.to_string(), Room::new(DEFAULT_ROOM));

        let state = Arc::new(RwLock::new(HubState {
            sessions: HashMap::new(),
            rooms,
        }));

        tokio::spawn(accept_loop(listener, state.clone(), shutdown_tx.clone()));
        tokio::spawn(liveness_sweeper(state.clone(), shutdown_tx.subscribe()));

        Ok(Hub {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// The hub's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of currently connected sessions (joined or anonymous)
    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Stop accepting connections and close every session
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Hub shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<HubState>>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let state = state.clone();
                        let shutdown_rx = shutdown_tx.subscribe();
                        tokio::spawn(handle_connection(stream, addr, state, shutdown_rx));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single participant connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RwLock<HubState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = tokio::io::split(stream);

    let session_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let closer = Arc::new(Notify::new());

    {
        let mut s = state.write().await;
        s.sessions.insert(
            session_id,
            Session {
                id: session_id,
                username: None,
                room_id: None,
                clock: VectorClock::seeded(session_id),
                tx: tx.clone(),
                closer: closer.clone(),
                joined_at: Utc::now(),
                last_seen: Instant::now(),
            },
        );
    }

    let writer_handle = tokio::spawn(writer_task(writer, rx));

    // The session is Connected-Anonymous until a join frame arrives.
    let init = ServerFrame::Init {
        client_id: session_id,
        server_time: Utc::now(),
        default_room: DEFAULT_ROOM.to_string(),
    };
    if tx.send(init).await.is_err() {
        writer_handle.abort();
        state.write().await.sessions.remove(&session_id);
        return;
    }

    info!(addr = %addr, session_id = %session_id, "Participant connected");

    loop {
        tokio::select! {
            result = read_frame::<_, ClientFrame>(&mut reader) => {
                match result {
                    Ok(frame) => {
                        handle_frame(frame, session_id, &state).await;
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!(session_id = %session_id, "Connection closed");
                        break;
                    }
                    Err(Error::Protocol(e)) => {
                        // Malformed frame: drop it, keep the session open.
                        warn!(session_id = %session_id, error = %e, "Dropping malformed frame");
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = closer.notified() => {
                debug!(session_id = %session_id, "Session closed by hub");
                break;
            }
            _ = shutdown_rx.recv() => {
                debug!(session_id = %session_id, "Hub shutting down");
                break;
            }
        }
    }

    writer_handle.abort();
    leave(&state, session_id).await;

    info!(session_id = %session_id, "Participant disconnected");
}

/// Writer task - drains the session's outbound queue onto the socket
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<ServerFrame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Dispatch one inbound frame
async fn handle_frame(frame: ClientFrame, session_id: Uuid, state: &Arc<RwLock<HubState>>) {
    // Any inbound frame counts as liveness.
    {
        let mut s = state.write().await;
        if let Some(session) = s.sessions.get_mut(&session_id) {
            session.last_seen = Instant::now();
        }
    }

    match frame {
        ClientFrame::Join { username, room_id } => {
            handle_join(session_id, username, room_id, state).await;
        }
        ClientFrame::Chat {
            text,
            vector_clock,
            metadata,
        } => {
            handle_chat(session_id, text, vector_clock, metadata, state).await;
        }
        ClientFrame::Typing { is_typing } => {
            handle_typing(session_id, is_typing, state).await;
        }
        ClientFrame::RequestHistory => {
            handle_request_history(session_id, state).await;
        }
        ClientFrame::GetUsers => {
            handle_get_users(session_id, state).await;
        }
        ClientFrame::Ping => {
            send_to(state, session_id, ServerFrame::Pong).await;
        }
    }
}

/// Handle a join: enter the room, seed the session clock, announce
async fn handle_join(
    session_id: Uuid,
    username: String,
    room_id: Option<String>,
    state: &Arc<RwLock<HubState>>,
) {
    let username = username.trim().to_string();
    if username.is_empty() {
        system_error(state, session_id, "Display name cannot be empty").await;
        return;
    }

    enum JoinOutcome {
        AlreadyJoined,
        Joined {
            room_id: String,
            reply: ServerFrame,
            users: Vec<ParticipantInfo>,
        },
    }

    let outcome = {
        let mut s = state.write().await;
        let Some(session) = s.sessions.get(&session_id) else {
            return;
        };
        if session.room_id.is_some() {
            JoinOutcome::AlreadyJoined
        } else {
            let room_id = room_id.unwrap_or_else(|| DEFAULT_ROOM.to_string());

            // Seed the newcomer's clock from each member's own entry, so
            // the newcomer's future sends dominate everything already said.
            let member_ids: Vec<Uuid> = s
                .rooms
                .get(&room_id)
                .map(|r| r.members().collect())
                .unwrap_or_default();
            let mut seeded = VectorClock::seeded(session_id);
            for member in member_ids {
                if let Some(peer) = s.sessions.get(&member) {
                    seeded.set(member, peer.clock.get(member));
                }
            }

            let room = s
                .rooms
                .entry(room_id.clone())
                .or_insert_with(|| Room::new(room_id.as_str()));
            room.insert_member(session_id);
            let room_info = room.info();
            let message_count = room.message_count();

            if let Some(session) = s.sessions.get_mut(&session_id) {
                session.username = Some(username.clone());
                session.room_id = Some(room_id.clone());
                session.clock = seeded;
            }

            let users = s.room_users(&room_id);
            JoinOutcome::Joined {
                room_id,
                reply: ServerFrame::JoinSuccess {
                    room: room_info,
                    users: users.clone(),
                    message_count,
                },
                users,
            }
        }
    };

    match outcome {
        JoinOutcome::AlreadyJoined => {
            system_error(state, session_id, "Already joined a room").await;
        }
        JoinOutcome::Joined {
            room_id,
            reply,
            users,
        } => {
            info!(session_id = %session_id, username = %username, room_id = %room_id, "Participant joined");

            broadcast_room(
                state,
                &room_id,
                ServerFrame::UserList {
                    users,
                    timestamp: Utc::now(),
                },
                None,
            )
            .await;
            broadcast_room(
                state,
                &room_id,
                ServerFrame::System {
                    message: format!("{username} joined the room"),
                    timestamp: Utc::now(),
                    user_id: Some(session_id),
                },
                Some(session_id),
            )
            .await;
            send_to(state, session_id, reply).await;
        }
    }
}

/// Handle a chat frame: stamp, record, ack, fan out
async fn handle_chat(
    session_id: Uuid,
    text: String,
    client_clock: VectorClock,
    metadata: MessageMetadata,
    state: &Arc<RwLock<HubState>>,
) {
    let stamped = {
        let mut s = state.write().await;
        let Some(session) = s.sessions.get_mut(&session_id) else {
            return;
        };
        match (session.room_id.clone(), session.username.clone()) {
            (Some(room_id), Some(username)) => {
                // Fold in the causal context the client reports, then
                // stamp with the hub's authoritative count of this
                // sender's sends.
                let sends = session.clock.get(session_id);
                session.clock.merge(&client_clock);
                session.clock.set(session_id, sends + 1);
                let stamp = session.clock.snapshot();

                let message = ChatMessage::new(room_id.clone(), session_id, username, text, stamp)
                    .with_metadata(metadata);
                if let Some(room) = s.rooms.get_mut(&room_id) {
                    room.record_message(message.clone());
                }
                Some(message)
            }
            _ => None,
        }
    };

    let Some(message) = stamped else {
        system_error(state, session_id, "Join a room before chatting").await;
        return;
    };

    debug!(
        session_id = %session_id,
        message_id = %message.id,
        room_id = %message.room_id,
        "Stamped chat message"
    );

    // The ack carries the hub-assigned ID so the sender can reconcile its
    // optimistic echo; it is never deferred by the simulation delay.
    send_to(
        state,
        session_id,
        ServerFrame::MessageDelivered {
            message_id: message.id,
            timestamp: message.timestamp,
        },
    )
    .await;

    if message.metadata.simulate_delay && message.metadata.delay_ms > 0 {
        // Each delayed message gets its own timer task, so several delays
        // run concurrently instead of queueing behind one another.
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(message.metadata.delay_ms)).await;
            debug!(message_id = %message.id, "Releasing delayed broadcast");
            let room_id = message.room_id.clone();
            broadcast_room(&state, &room_id, ServerFrame::Chat(message), Some(session_id)).await;
        });
    } else {
        let room_id = message.room_id.clone();
        broadcast_room(state, &room_id, ServerFrame::Chat(message), Some(session_id)).await;
    }
}

/// Relay a typing indicator to the room, excluding the sender
async fn handle_typing(session_id: Uuid, is_typing: bool, state: &Arc<RwLock<HubState>>) {
    let located = {
        let s = state.read().await;
        s.sessions.get(&session_id).and_then(|session| {
            match (&session.room_id, &session.username) {
                (Some(room_id), Some(username)) => Some((room_id.clone(), username.clone())),
                _ => None,
            }
        })
    };
    let Some((room_id, username)) = located else {
        system_error(state, session_id, "Join a room before you can type").await;
        return;
    };

    broadcast_room(
        state,
        &room_id,
        ServerFrame::UserTyping {
            user_id: session_id,
            username,
            is_typing,
        },
        Some(session_id),
    )
    .await;
}

/// Reply with the room's recent history window
async fn handle_request_history(session_id: Uuid, state: &Arc<RwLock<HubState>>) {
    let reply = {
        let s = state.read().await;
        s.sessions
            .get(&session_id)
            .and_then(|session| session.room_id.as_ref())
            .and_then(|room_id| s.rooms.get(room_id))
            .map(|room| {
                let messages: Vec<ChatMessage> = room.history().cloned().collect();
                let total = messages.len();
                ServerFrame::History { messages, total }
            })
    };
    match reply {
        Some(frame) => send_to(state, session_id, frame).await,
        None => system_error(state, session_id, "Join a room before requesting history").await,
    }
}

/// Reply with the room's current user list
async fn handle_get_users(session_id: Uuid, state: &Arc<RwLock<HubState>>) {
    let reply = {
        let s = state.read().await;
        s.sessions
            .get(&session_id)
            .and_then(|session| session.room_id.as_ref())
            .map(|room_id| ServerFrame::UserList {
                users: s.room_users(room_id),
                timestamp: Utc::now(),
            })
    };
    match reply {
        Some(frame) => send_to(state, session_id, frame).await,
        None => system_error(state, session_id, "Join a room before listing users").await,
    }
}

/// Tear down a session: drop it from its room and announce the leave.
/// Peers keep the departed participant's clock entries.
async fn leave(state: &Arc<RwLock<HubState>>, session_id: Uuid) {
    let departed = {
        let mut s = state.write().await;
        let Some(session) = s.sessions.remove(&session_id) else {
            return;
        };
        match (session.room_id, session.username) {
            (Some(room_id), Some(username)) => {
                if let Some(room) = s.rooms.get_mut(&room_id) {
                    room.remove_member(session_id);
                }
                Some((room_id, username))
            }
            // Connected-Anonymous sessions leave silently.
            _ => None,
        }
    };
    let Some((room_id, username)) = departed else {
        return;
    };

    broadcast_room(
        state,
        &room_id,
        ServerFrame::System {
            message: format!("{username} left the room"),
            timestamp: Utc::now(),
            user_id: Some(session_id),
        },
        None,
    )
    .await;

    // Give the notice a moment to land before refreshing the roster.
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(LEAVE_SETTLE).await;
        let users = state.read().await.room_users(&room_id);
        broadcast_room(
            &state,
            &room_id,
            ServerFrame::UserList {
                users,
                timestamp: Utc::now(),
            },
            None,
        )
        .await;
    });
}

/// Queue a frame for every member of a room, optionally excluding one.
///
/// Sends never block on a slow peer: a full outbound queue closes that
/// session instead, since skipping a frame would break causal safety at
/// the recipient.
async fn broadcast_room(
    state: &Arc<RwLock<HubState>>,
    room_id: &str,
    frame: ServerFrame,
    except: Option<Uuid>,
) {
    let overflowed: Vec<Uuid> = {
        let s = state.read().await;
        let Some(room) = s.rooms.get(room_id) else {
            return;
        };
        let mut overflowed = Vec::new();
        for member in room.members() {
            if Some(member) == except {
                continue;
            }
            let Some(session) = s.sessions.get(&member) else {
                continue;
            };
            match session.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %member, "Outbound queue overflow");
                    overflowed.push(member);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session_id = %member, "Failed to queue frame for closing session");
                }
            }
        }
        overflowed
    };

    for member in overflowed {
        close_session(state, member).await;
    }
}

/// Queue a frame for a single session
async fn send_to(state: &Arc<RwLock<HubState>>, session_id: Uuid, frame: ServerFrame) {
    let overflowed = {
        let s = state.read().await;
        match s.sessions.get(&session_id) {
            Some(session) => matches!(
                session.tx.try_send(frame),
                Err(mpsc::error::TrySendError::Full(_))
            ),
            None => false,
        }
    };
    if overflowed {
        warn!(session_id = %session_id, "Outbound queue overflow");
        close_session(state, session_id).await;
    }
}

/// Reply to a state error with a system notice; no state is mutated
async fn system_error(state: &Arc<RwLock<HubState>>, session_id: Uuid, message: &str) {
    warn!(session_id = %session_id, error = message, "State error");
    send_to(
        state,
        session_id,
        ServerFrame::System {
            message: message.to_string(),
            timestamp: Utc::now(),
            user_id: None,
        },
    )
    .await;
}

/// Ask a session's connection task to shut down
async fn close_session(state: &Arc<RwLock<HubState>>, session_id: Uuid) {
    let s = state.read().await;
    if let Some(session) = s.sessions.get(&session_id) {
        session.closer.notify_one();
    }
}

/// Close sessions that have gone quiet for two ping intervals
async fn liveness_sweeper(state: Arc<RwLock<HubState>>, mut shutdown_rx: broadcast::Receiver<()>) {
    let deadline = PING_INTERVAL * 2;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(PING_INTERVAL) => {
                let idle: Vec<Uuid> = {
                    let s = state.read().await;
                    s.sessions
                        .values()
                        .filter(|session| session.last_seen.elapsed() > deadline)
                        .map(|session| session.id)
                        .collect()
                };
                for session_id in idle {
                    warn!(session_id = %session_id, "Closing unresponsive session");
                    close_session(&state, session_id).await;
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Liveness sweeper shutting down");
                break;
            }
        }
    }
}
