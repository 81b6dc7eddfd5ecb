//! WebSocket sync client for a single document.
//!
//! Provides:
//! - Connection lifecycle with reconnect and exponential backoff
//! - A cached projection kept current by the operation stream
//! - Offline queue for submits made while disconnected
//! - Presence updates
//!
//! A background driver task owns the socket; [`SyncClient`] is a cheap handle
//! that talks to it through a command channel and shared state.

use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::model::{Change, DocumentId, Operation, SessionId};
use crate::presence::{PeerPresence, PresenceRoom, PresenceState, PresenceUpdate};
use crate::projection::Projection;
use crate::protocol::{MessageType, ProtocolError, RejectCode, SyncMessage};
use crate::session::{ReconnectPolicy, Session, SessionState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("session closed")]
    Closed,
    #[error("offline queue full ({0} pending)")]
    QueueFull(usize),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Subscription accepted; catch-up from `resumed_after` follows
    Connected { head: u64, resumed_after: u64 },
    /// A committed operation, applied to the cached projection
    Operation(Operation),
    /// One of our submits was committed
    Acked { client_sequence: u64, sequence: u64 },
    /// One of our submits was refused
    Rejected {
        client_sequence: u64,
        code: RejectCode,
        message: String,
    },
    Presence(PresenceUpdate),
    /// Connection lost; the next attempt starts after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal
    Closed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub user_name: String,
    pub reconnect: ReconnectPolicy,
    /// Maximum submits awaiting acknowledgement
    pub offline_capacity: usize,
    /// Peers silent for this long are dropped from the presence view
    pub presence_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            user_name: user_name.into(),
            reconnect: ReconnectPolicy::default(),
            offline_capacity: 10_000,
            presence_timeout: Duration::from_secs(60),
        }
    }
}

/// A submit that has not been acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmit {
    pub client_sequence: u64,
    pub base_sequence: u64,
    pub change: Change,
    sent: bool,
}

/// Submits awaiting acknowledgement, in submission order.
///
/// Entries stay queued until the server acks or rejects them, so a reconnect
/// resends everything unconfirmed under its original client sequence.
pub struct OfflineQueue {
    queue: VecDeque<PendingSubmit>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    pub fn enqueue(&mut self, client_sequence: u64, base_sequence: u64, change: Change) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(PendingSubmit {
            client_sequence,
            base_sequence,
            change,
            sent: false,
        });
        true
    }

    /// Remove the entry for `client_sequence` once the server answered it.
    pub fn resolve(&mut self, client_sequence: u64) -> Option<PendingSubmit> {
        let pos = self
            .queue
            .iter()
            .position(|p| p.client_sequence == client_sequence)?;
        self.queue.remove(pos)
    }

    /// Entries not yet sent on the current connection, marked as sent.
    pub fn take_unsent(&mut self) -> Vec<PendingSubmit> {
        self.queue
            .iter_mut()
            .filter(|p| !p.sent)
            .map(|p| {
                p.sent = true;
                p.clone()
            })
            .collect()
    }

    /// A new connection starts: everything unconfirmed must be sent again.
    pub fn reset_sent(&mut self) {
        for p in &mut self.queue {
            p.sent = false;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingSubmit> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

struct ClientState {
    session: Session,
    projection: Projection,
    pending: OfflineQueue,
    next_client_sequence: u64,
    presence: PresenceRoom,
    presence_timeout: Duration,
}

enum Command {
    Flush,
    Presence(PresenceUpdate),
    Close,
}

/// How a single connection ended.
enum ConnectionEnd {
    /// The client asked to close
    Requested,
    /// The server refused the session for good
    Fatal(String),
    /// Worth retrying
    Transport(String),
}

/// Handle to a live session on one document.
#[derive(Clone)]
pub struct SyncClient {
    session_id: SessionId,
    doc_id: DocumentId,
    state: Arc<Mutex<ClientState>>,
    commands: mpsc::Sender<Command>,
}

impl SyncClient {
    /// Start a session on `doc_id` and spawn its driver task.
    pub fn connect(config: ClientConfig, doc_id: DocumentId) -> (Self, mpsc::Receiver<SyncEvent>) {
        let session = Session::new(doc_id, config.reconnect.clone());
        Self::spawn(config, session, Projection::new(doc_id), 1)
    }

    /// Resume a session from a projection the caller already holds.
    ///
    /// `next_client_sequence` must be above every client sequence the session
    /// used before, or new submits are answered as duplicates.
    pub fn resume(
        config: ClientConfig,
        session_id: SessionId,
        next_client_sequence: u64,
        projection: Projection,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let session = Session::resume(
            session_id,
            projection.doc_id(),
            projection.sequence(),
            config.reconnect.clone(),
        );
        Self::spawn(config, session, projection, next_client_sequence.max(1))
    }

    fn spawn(
        config: ClientConfig,
        session: Session,
        projection: Projection,
        next_client_sequence: u64,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(256);

        let session_id = session.id();
        let doc_id = session.doc_id();
        let state = Arc::new(Mutex::new(ClientState {
            presence: PresenceRoom::new(session_id, config.user_name.clone()),
            presence_timeout: config.presence_timeout,
            pending: OfflineQueue::new(config.offline_capacity),
            next_client_sequence,
            session,
            projection,
        }));

        let url = format!("{}/{}", config.server_url.trim_end_matches('/'), doc_id);
        tokio::spawn(drive(url, state.clone(), command_rx, event_tx));

        (
            Self {
                session_id,
                doc_id,
                state,
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Queue a change against the cached projection. Returns its client
    /// sequence; the outcome arrives as `Acked` or `Rejected`.
    pub async fn submit(&self, change: Change) -> Result<u64, ClientError> {
        let mut state = self.state.lock().await;
        if state.session.is_closed() {
            return Err(ClientError::Closed);
        }
        let client_sequence = state.next_client_sequence;
        let base = state.projection.sequence();
        if !state.pending.enqueue(client_sequence, base, change) {
            return Err(ClientError::QueueFull(state.pending.len()));
        }
        state.next_client_sequence += 1;
        drop(state);

        // A full channel already holds a flush
        let _ = self.commands.try_send(Command::Flush);
        Ok(client_sequence)
    }

    /// Change what this session is focused on. Dropped while offline.
    pub async fn set_presence(&self, presence: PresenceState) {
        let update = {
            let mut state = self.state.lock().await;
            if state.session.state() != SessionState::Synced {
                return;
            }
            state.presence.update_local(presence)
        };
        if let Some(update) = update {
            let _ = self.commands.try_send(Command::Presence(update));
        }
    }

    /// Leave the document and stop the driver.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub async fn state(&self) -> SessionState {
        self.state.lock().await.session.state()
    }

    pub async fn last_acked(&self) -> u64 {
        self.state.lock().await.session.last_acked()
    }

    /// Copy of the cached record set.
    pub async fn projection(&self) -> Projection {
        self.state.lock().await.projection.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn peers(&self) -> Vec<PeerPresence> {
        self.state.lock().await.presence.peers().cloned().collect()
    }
}

async fn drive(
    url: String,
    state: Arc<Mutex<ClientState>>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SyncEvent>,
) {
    loop {
        let reason = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => {
                let resume_after = {
                    let mut st = state.lock().await;
                    st.pending.reset_sent();
                    match st.session.on_connected() {
                        Ok(seq) => seq,
                        Err(e) => {
                            let _ = events.send(SyncEvent::Closed { reason: e.to_string() }).await;
                            return;
                        }
                    }
                };
                log::info!("Connected to {url}, resuming after {resume_after}");

                match run_connection(ws, resume_after, &state, &mut commands, &events).await {
                    ConnectionEnd::Requested => {
                        finish(&state, &events, "closed by client").await;
                        return;
                    }
                    ConnectionEnd::Fatal(reason) => {
                        log::warn!("Session on {url} refused: {reason}");
                        finish(&state, &events, &reason).await;
                        return;
                    }
                    ConnectionEnd::Transport(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        let (attempt, delay) = {
            let mut st = state.lock().await;
            match st.session.on_transport_failure(&reason) {
                Ok(delay) => (st.session.failed_attempts(), delay),
                Err(e) => {
                    drop(st);
                    let _ = events.send(SyncEvent::Closed { reason: e.to_string() }).await;
                    return;
                }
            }
        };
        let _ = events.send(SyncEvent::Reconnecting { attempt, delay }).await;

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                _ = prune.tick() => {
                let pruned = state.lock().await.presence.prune_idle(presence_timeout);
                if pruned > 0 {
                    log::debug!("Dropped {pruned} idle peers from {doc_id}");
                }
            }

            cmd = commands.recv() => match cmd {
                    Some(Command::Close) | None => {
                        finish(&state, &events, "closed by client").await;
                        return;
                    }
                    // Replayed on reconnect
                    Some(_) => continue,
                },
            }
        }
    }
}

async fn finish(state: &Arc<Mutex<ClientState>>, events: &mpsc::Sender<SyncEvent>, reason: &str) {
    state.lock().await.session.close();
    let _ = events
        .send(SyncEvent::Closed {
            reason: reason.to_string(),
        })
        .await;
}

async fn run_connection(
    ws: WsStream,
    resume_after: u64,
    state: &Arc<Mutex<ClientState>>,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<SyncEvent>,
) -> ConnectionEnd {
    let (mut writer, mut reader) = ws.split();
    let (session_id, doc_id, presence_timeout) = {
        let st = state.lock().await;
        (st.session.id(), st.session.doc_id(), st.presence_timeout)
    };
    let mut subscribed = false;
    let mut prune = tokio::time::interval(presence_timeout.max(Duration::from_millis(10)));
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let hello = SyncMessage::subscribe(session_id, doc_id, resume_after);
    if let Err(e) = send(&mut writer, &hello).await {
        return ConnectionEnd::Transport(e);
    }

    loop {
        tokio::select! {
            frame = reader.next() => {
                let msg = match frame {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Dropping undecodable frame: {e}");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return ConnectionEnd::Transport("connection closed".into());
                    }
                    Some(Err(e)) => return ConnectionEnd::Transport(e.to_string()),
                    _ => continue,
                };

                match handle_frame(msg, state, events).await {
                    Ok(FrameOutcome::Subscribed) => {
                        subscribed = true;
                        if let Err(e) = flush(&mut writer, state, session_id, doc_id).await {
                            return ConnectionEnd::Transport(e);
                        }
                    }
                    Ok(FrameOutcome::Handled) => {}
                    Err(end) => return end,
                }
            }

            cmd = commands.recv() => match cmd {
                Some(Command::Flush) if subscribed => {
                    if let Err(e) = flush(&mut writer, state, session_id, doc_id).await {
                        return ConnectionEnd::Transport(e);
                    }
                }
                Some(Command::Presence(update)) if subscribed => {
                    let sent = match SyncMessage::presence(session_id, doc_id, &update) {
                        Ok(msg) => send(&mut writer, &msg).await,
                        Err(e) => Err(e.to_string()),
                    };
                    if let Err(e) = sent {
                        return ConnectionEnd::Transport(e);
                    }
                }
                Some(Command::Close) | None => {
                    let left = state.lock().await.presence.leave_update();
                    if let Ok(msg) = SyncMessage::presence(session_id, doc_id, &left) {
                        let _ = send(&mut writer, &msg).await;
                    }
                    let _ = writer.close().await;
                    return ConnectionEnd::Requested;
                }
                Some(_) => {}
            },
        }
    }
}

enum FrameOutcome {
    Subscribed,
    Handled,
}

async fn handle_frame(
    msg: SyncMessage,
    state: &Arc<Mutex<ClientState>>,
    events: &mpsc::Sender<SyncEvent>,
) -> Result<FrameOutcome, ConnectionEnd> {
    let event = match msg.msg_type {
        MessageType::Subscribed => {
            let resumed_after = state.lock().await.session.last_acked();
            let _ = events
                .send(SyncEvent::Connected {
                    head: msg.sequence,
                    resumed_after,
                })
                .await;
            return Ok(FrameOutcome::Subscribed);
        }

        MessageType::Operation => {
            let op = msg
                .operation_body()
                .map_err(|e| ConnectionEnd::Transport(e.to_string()))?;
            let mut st = state.lock().await;
            let expected = st.session.last_acked() + 1;
            if op.sequence < expected {
                return Ok(FrameOutcome::Handled);
            }
            if op.sequence > expected {
                // Resubscribing restarts the stream at the right place
                return Err(ConnectionEnd::Transport(format!(
                    "gap in operation stream: expected {expected}, got {}",
                    op.sequence
                )));
            }
            st.session.acknowledge(op.sequence);
            st.projection.apply(&op);
            Some(SyncEvent::Operation(op))
        }

        MessageType::Ack => {
            let op = msg
                .ack_body()
                .map_err(|e| ConnectionEnd::Transport(e.to_string()))?;
            state.lock().await.pending.resolve(op.client_sequence);
            Some(SyncEvent::Acked {
                client_sequence: op.client_sequence,
                sequence: op.sequence,
            })
        }

        MessageType::Reject => {
            let body = msg
                .reject_body()
                .map_err(|e| ConnectionEnd::Transport(e.to_string()))?;
            if body.client_sequence == 0 {
                return Err(match body.code {
                    RejectCode::UnknownDocument | RejectCode::AheadOfHead => {
                        ConnectionEnd::Fatal(body.message)
                    }
                    _ => ConnectionEnd::Transport(body.message),
                });
            }
            state.lock().await.pending.resolve(body.client_sequence);
            Some(SyncEvent::Rejected {
                client_sequence: body.client_sequence,
                code: body.code,
                message: body.message,
            })
        }

        MessageType::Presence => match msg.presence_body() {
            Ok(update) => {
                state.lock().await.presence.handle_update(&update);
                Some(SyncEvent::Presence(update))
            }
            Err(e) => {
                log::debug!("Ignoring malformed presence: {e}");
                None
            }
        },

        _ => None,
    };

    if let Some(event) = event {
        let _ = events.send(event).await;
    }
    Ok(FrameOutcome::Handled)
}

async fn flush<S>(
    writer: &mut S,
    state: &Arc<Mutex<ClientState>>,
    session_id: SessionId,
    doc_id: DocumentId,
) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let unsent = state.lock().await.pending.take_unsent();
    if unsent.len() > 1 {
        log::info!("Replaying {} queued submits", unsent.len());
    }
    for p in unsent {
        let msg = SyncMessage::submit(session_id, doc_id, p.base_sequence, p.client_sequence, p.change)
            .map_err(|e| e.to_string())?;
        send(writer, &msg).await?;
    }
    Ok(())
}

async fn send<S>(writer: &mut S, msg: &SyncMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let bytes = msg.encode().map_err(|e| e.to_string())?;
    writer
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldMap, FieldValue};
    use uuid::Uuid;

    fn named(value: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("name".into(), FieldValue::text(value));
        fields
    }

    async fn unused_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(1, 0, Change::create("r1", named("a")));
        queue.enqueue(2, 0, Change::delete("r1"));
        assert_eq!(queue.len(), 2);

        let unsent = queue.take_unsent();
        assert_eq!(unsent.len(), 2);
        assert_eq!(unsent[0].client_sequence, 1);
        assert!(queue.take_unsent().is_empty());

        queue.reset_sent();
        assert_eq!(queue.take_unsent().len(), 2);

        assert_eq!(queue.resolve(1).unwrap().client_sequence, 1);
        assert!(queue.resolve(1).is_none());
        assert_eq!(queue.iter().map(|p| p.client_sequence).collect::<Vec<_>>(), vec![2]);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(1, 0, Change::delete("a")));
        assert!(queue.enqueue(2, 0, Change::delete("b")));
        assert!(!queue.enqueue(3, 0, Change::delete("c")));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_submit_while_offline_is_queued() {
        let mut config = ClientConfig::new(unused_url().await, "Alice");
        config.reconnect = fast_policy(50);
        let (client, _events) = SyncClient::connect(config, Uuid::new_v4());

        assert_eq!(client.submit(Change::create("r1", named("a"))).await.unwrap(), 1);
        assert_eq!(client.submit(Change::delete("r1")).await.unwrap(), 2);
        assert_eq!(client.pending_len().await, 2);
        assert_eq!(client.last_acked().await, 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_closes_after_attempt_limit() {
        let mut config = ClientConfig::new(unused_url().await, "Alice");
        config.reconnect = fast_policy(2);
        let (client, mut events) = SyncClient::connect(config, Uuid::new_v4());

        let mut reconnects = 0;
        loop {
            match events.recv().await.unwrap() {
                SyncEvent::Reconnecting { attempt, .. } => {
                    reconnects += 1;
                    assert_eq!(attempt, reconnects);
                }
                SyncEvent::Closed { reason } => {
                    assert!(reason.contains("2"));
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(reconnects, 1);
        assert_eq!(client.state().await, SessionState::Closed);
        assert_eq!(
            client.submit(Change::delete("r1")).await,
            Err(ClientError::Closed)
        );
    }

    #[tokio::test]
    async fn test_resume_starts_from_projection() {
        let doc = Uuid::new_v4();
        let mut projection = Projection::new(doc);
        projection.apply(&Operation {
            doc_id: doc,
            sequence: 1,
            session_id: Uuid::nil(),
            client_sequence: 0,
            change: Change::create("r1", named("a")),
            timestamp_ms: 0,
        });

        let mut config = ClientConfig::new(unused_url().await, "Alice");
        config.reconnect = fast_policy(50);
        let session = Uuid::new_v4();
        let (client, _events) = SyncClient::resume(config, session, 5, projection);
        assert_eq!(client.session_id(), session);
        assert_eq!(client.doc_id(), doc);
        assert_eq!(client.last_acked().await, 1);
        assert_eq!(client.projection().await.len(), 1);
        assert_eq!(client.submit(Change::delete("r1")).await.unwrap(), 5);
        client.close().await;
    }
}
