//! # grid-collab: record synchronization core for collaborative tables
//!
//! Clients submit discrete record mutations; the server orders them into a
//! per-document change log and streams committed operations back to every
//! live session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket / HTTP   ┌──────────────────┐
//! │ SyncClient  │ ───── Submit ──────► │ MutationGateway  │
//! │ (per user)  │                      │ validate, rebase │
//! │ Projection  │                      └────────┬─────────┘
//! │ (cached)    │                               │ append(head + 1)
//! └──────▲──────┘                               ▼
//!        │                             ┌──────────────────┐
//!        │                             │ ChangeLog        │
//!        └──── Operation (in order) ── │ per-document     │
//!                                      │ RocksDB / memory │
//!                                      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: documents, records, changes, operations
//! - [`schema`]: table schemas and change validation
//! - [`projection`]: record state folded from operations
//! - [`transform`]: last-writer-wins rebase of stale changes
//! - [`change_log`]: ordered append, cursors, subscriptions, snapshots
//! - [`gateway`]: the single mutation entry point
//! - [`storage`]: RocksDB and in-memory operation stores
//! - [`protocol`]: binary wire protocol (bincode-encoded SyncMessage)
//! - [`session`]: client session state machine and reconnect policy
//! - [`presence`], [`broadcast`]: ephemeral "who is editing what"
//! - [`server`], [`api`], [`client`], [`config`]: the network surfaces

pub mod api;
pub mod broadcast;
pub mod change_log;
pub mod client;
pub mod config;
pub mod gateway;
pub mod model;
pub mod presence;
pub mod projection;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod session;
pub mod storage;
pub mod transform;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use change_log::{
    ChangeLog, ChangeLogConfig, ChangeLogError, DocumentLog, OperationCursor, Subscription,
};
pub use client::{ClientConfig, ClientError, OfflineQueue, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use gateway::{MutationGateway, SubmitError, SubmitRequest};
pub use model::{Change, ChangeKind, DocumentId, FieldMap, FieldValue, Operation, RecordId, SessionId};
pub use presence::{PeerPresence, PresenceRoom, PresenceState, PresenceUpdate};
pub use projection::{Projection, Record};
pub use protocol::{MessageType, ProtocolError, RejectBody, RejectCode, SyncMessage};
pub use schema::{FieldDef, FieldType, SchemaViolation, TableSchema};
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::{ReconnectPolicy, Session, SessionError, SessionState};
pub use storage::{
    DocumentMetadata, MemoryStore, OperationStore, RocksStore, StoreConfig, StoreError,
};
pub use transform::{Resolution, TransformEngine, Unresolvable};
