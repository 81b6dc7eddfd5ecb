//! WebSocket sync server with per-document live sessions, plus the HTTP API.
//!
//! Architecture:
//! ```text
//! Client A ──┐  Subscribe / Submit / Presence
//!            ├──────────────► SyncServer ──► MutationGateway ──► ChangeLog
//! Client B ──┘                    │                                  │
//!      ▲                          │ presence                         │ Subscription
//!      │                          ▼                                  │ (catch-up + live)
//!      │                    RoomManager ── BroadcastGroup            │
//!      └──────────── Operation / Ack / Reject / Presence ◄───────────┘
//! ```
//!
//! Each connection drives one session: committed operations come from its
//! change log subscription, never from other connections, so every session
//! sees the same gap-free order.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::api::{self, AppState};
use crate::broadcast::{BroadcastGroup, BroadcastStats, Envelope, RoomManager};
use crate::change_log::{ChangeLog, ChangeLogError, Subscription};
use crate::config::ServerConfig;
use crate::gateway::{MutationGateway, SubmitRequest};
use crate::model::{DocumentId, Operation, SessionId};
use crate::presence::PresenceState;
use crate::protocol::{MessageType, ProtocolError, RejectBody, RejectCode, SyncMessage};
use crate::storage::{MemoryStore, OperationStore, RocksStore, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("change log: {0}")]
    Log(#[from] ChangeLogError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub operations_sent: u64,
    pub submits_committed: u64,
    pub submits_rejected: u64,
    /// Presence rooms, filled in when the stats are read
    pub presence: BroadcastStats,
}

#[derive(Clone)]
struct ConnectionContext {
    gateway: Arc<MutationGateway>,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
}

/// The session a connection has subscribed to.
struct Joined {
    session_id: SessionId,
    doc_id: DocumentId,
    room: Arc<BroadcastGroup>,
}

#[derive(Default)]
struct LiveState {
    joined: Option<Joined>,
    subscription: Option<Subscription>,
    presence_rx: Option<broadcast::Receiver<Envelope>>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<MutationGateway>,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open storage, recover every persisted document and build the server.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn OperationStore> = match config.store_config() {
            Some(store_config) => Arc::new(RocksStore::open(store_config)?),
            None => {
                log::info!("No storage path configured, keeping operations in memory");
                Arc::new(MemoryStore::new())
            }
        };

        let log = ChangeLog::open(store, config.change_log_config())?;
        let recovered = log.documents().len();
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        Ok(Self {
            gateway: Arc::new(MutationGateway::new(Arc::new(log))),
            rooms: Arc::new(RoomManager::new(config.broadcast_capacity)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            config,
        })
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Result<Self, ServerError> {
        Self::new(ServerConfig::default())
    }

    /// Serve WebSocket and HTTP until either listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let ws_listener = TcpListener::bind(&self.config.ws_addr).await?;
        let http_listener = TcpListener::bind(&self.config.http_addr).await?;
        log::info!("Sync server listening on ws://{}", self.config.ws_addr);
        log::info!("HTTP API listening on http://{}", self.config.http_addr);

        tokio::try_join!(self.serve_ws(ws_listener), self.serve_http(http_listener))?;
        Ok(())
    }

    pub async fn serve_http(&self, listener: TcpListener) -> Result<(), ServerError> {
        let app = api::router(AppState {
            gateway: self.gateway.clone(),
        });
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Accept WebSocket connections, one task each.
    pub async fn serve_ws(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = ConnectionContext {
                gateway: self.gateway.clone(),
                rooms: self.rooms.clone(),
                stats: self.stats.clone(),
                config: self.config.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut state = LiveState::default();
        let result = Self::drive(&ctx, addr, &mut ws_sender, &mut ws_receiver, &mut state).await;

        if let Some(joined) = state.joined.take() {
            Self::leave(&ctx, joined).await;
        }
        let _ = ws_sender.close().await;
        ctx.stats.write().await.active_connections -= 1;
        result
    }

    async fn drive(
        ctx: &ConnectionContext,
        addr: SocketAddr,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        state: &mut LiveState,
    ) -> Result<(), BoxError> {
        let heartbeat = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match SyncMessage::decode(&data) {
                                Ok(sync_msg) => {
                                    for reply in Self::handle_frame(ctx, state, sync_msg).await? {
                                        send(ws_sender, &reply).await?;
                                    }
                                }
                                Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                op = next_operation(&mut state.subscription) => {
                    match op {
                        Ok(op) => {
                            let session_id = state.joined.as_ref().map(|j| j.session_id).unwrap_or_default();
                            send(ws_sender, &SyncMessage::operation(session_id, &op)?).await?;
                            ctx.stats.write().await.operations_sent += 1;
                        }
                        Err(e) => {
                            log::error!("Subscription of {addr} failed: {e}");
                            return Err(e.into());
                        }
                    }
                }

                envelope = next_presence(&mut state.presence_rx) => {
                    match envelope {
                        Ok(envelope) => {
                            let own = state.joined.as_ref().map(|j| j.session_id);
                            if Some(envelope.from) != own {
                                ws_sender.send(Message::Binary(envelope.bytes.to_vec().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::debug!("Presence for {addr} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            state.presence_rx = None;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if last_seen.elapsed() > heartbeat * 3 {
                        log::info!("Connection from {addr} timed out");
                        return Ok(());
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    /// Handle one client frame, returning the replies to send.
    async fn handle_frame(
        ctx: &ConnectionContext,
        state: &mut LiveState,
        msg: SyncMessage,
    ) -> Result<Vec<SyncMessage>, ProtocolError> {
        match msg.msg_type {
            MessageType::Subscribe => Self::subscribe(ctx, state, &msg).await,

            MessageType::Submit => {
                let body = match msg.submit_body() {
                    Ok(body) => body,
                    Err(e) => {
                        let head = ctx.gateway.change_log().head(msg.doc_id).unwrap_or(0);
                        let reject = RejectBody {
                            client_sequence: 0,
                            code: RejectCode::Malformed,
                            message: e.to_string(),
                        };
                        return Ok(vec![SyncMessage::reject(msg.session_id, msg.doc_id, head, &reject)?]);
                    }
                };

                let request = SubmitRequest::new(msg.doc_id, msg.sequence, body.change)
                    .from_session(msg.session_id, body.client_sequence);
                match ctx.gateway.submit(request).await {
                    Ok(op) => {
                        ctx.stats.write().await.submits_committed += 1;
                        Ok(vec![SyncMessage::ack(msg.session_id, &op)?])
                    }
                    Err(e) => {
                        ctx.stats.write().await.submits_rejected += 1;
                        if e.is_fatal() {
                            log::error!("Submit to {} failed: {}", msg.doc_id, e);
                        } else {
                            log::debug!("Submit to {} rejected: {}", msg.doc_id, e);
                        }
                        let head = ctx.gateway.change_log().head(msg.doc_id).unwrap_or(0);
                        let reject = RejectBody {
                            client_sequence: body.client_sequence,
                            code: RejectCode::from(&e),
                            message: e.to_string(),
                        };
                        Ok(vec![SyncMessage::reject(msg.session_id, msg.doc_id, head, &reject)?])
                    }
                }
            }

            MessageType::Presence => {
                if let Some(joined) = &state.joined {
                    if let Ok(update) = msg.presence_body() {
                        match &update.state {
                            PresenceState::Editing { record_id, .. } => {
                                log::trace!("Presence: {} editing {} in {}", update.user_name, record_id, joined.doc_id);
                            }
                            other => log::trace!("Presence: {} {:?} in {}", update.user_name, other, joined.doc_id),
                        }
                    }
                    joined.room.publish(&msg).await?;
                }
                Ok(Vec::new())
            }

            MessageType::Ping => Ok(vec![SyncMessage::pong(msg.session_id)]),

            other => {
                log::debug!("Unhandled message type: {:?}", other);
                Ok(Vec::new())
            }
        }
    }

    /// Start (or restart) the connection's live session.
    async fn subscribe(
        ctx: &ConnectionContext,
        state: &mut LiveState,
        msg: &SyncMessage,
    ) -> Result<Vec<SyncMessage>, ProtocolError> {
        if let Some(previous) = state.joined.take() {
            state.subscription = None;
            state.presence_rx = None;
            Self::leave(ctx, previous).await;
        }

        let reject = |code: RejectCode, message: String, head: u64| {
            let body = RejectBody {
                client_sequence: 0,
                code,
                message,
            };
            SyncMessage::reject(msg.session_id, msg.doc_id, head, &body).map(|m| vec![m])
        };

        let room = ctx.rooms.get_or_create(msg.doc_id).await;
        if room.member_count().await >= ctx.config.max_sessions_per_document {
            ctx.rooms.remove_if_empty(&msg.doc_id).await;
            return reject(RejectCode::Internal, "too many sessions on document".into(), 0);
        }

        let subscription = match ctx.gateway.change_log().subscribe(msg.doc_id, msg.sequence) {
            Ok(sub) => sub,
            Err(e) => {
                ctx.rooms.remove_if_empty(&msg.doc_id).await;
                let head = ctx.gateway.change_log().head(msg.doc_id).unwrap_or(0);
                let code = match e {
                    ChangeLogError::UnknownDocument(_) => RejectCode::UnknownDocument,
                    ChangeLogError::AheadOfHead { .. } => RejectCode::AheadOfHead,
                    _ => RejectCode::Internal,
                };
                log::debug!("Subscribe of {} to {} refused: {}", msg.session_id, msg.doc_id, e);
                return reject(code, e.to_string(), head);
            }
        };
        let head = ctx.gateway.change_log().head(msg.doc_id).unwrap_or(0);

        let (presence_rx, current) = room.join(msg.session_id).await;
        state.subscription = Some(subscription);
        state.presence_rx = Some(presence_rx);
        state.joined = Some(Joined {
            session_id: msg.session_id,
            doc_id: msg.doc_id,
            room,
        });

        log::info!(
            "Session {} subscribed to {} after {} (head {})",
            msg.session_id,
            msg.doc_id,
            msg.sequence,
            head
        );

        let mut replies = vec![SyncMessage::subscribed(msg.session_id, msg.doc_id, head)];
        for bytes in current {
            replies.push(SyncMessage::decode(&bytes)?);
        }
        Ok(replies)
    }

    async fn leave(ctx: &ConnectionContext, joined: Joined) {
        joined.room.leave(&joined.session_id).await;
        let update = crate::presence::PresenceUpdate::left(joined.session_id);
        if let Ok(msg) = SyncMessage::presence(joined.session_id, joined.doc_id, &update) {
            let _ = joined.room.publish(&msg).await;
        }
        if ctx.rooms.remove_if_empty(&joined.doc_id).await {
            log::debug!("Room {} removed (empty)", joined.doc_id);
        }
        log::info!("Session {} left {}", joined.session_id, joined.doc_id);
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.presence = self.rooms.stats().await;
        stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<MutationGateway> {
        &self.gateway
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

async fn send(ws_sender: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

async fn next_operation(
    subscription: &mut Option<Subscription>,
) -> Result<Arc<Operation>, ChangeLogError> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

async fn next_presence(
    rx: &mut Option<broadcast::Receiver<Envelope>>,
) -> Result<Envelope, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
