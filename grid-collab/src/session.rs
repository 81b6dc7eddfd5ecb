//! Client-side live session state machine.
//!
//! ```text
//!  Connecting ──connected──► Synced ──transport failure──► Reconnecting
//!      ▲                       ▲                               │
//!      │                       └──────────connected────────────┘
//!      └─ new()         close / attempts exhausted ──► Closed (terminal)
//! ```
//!
//! `last_acked` survives every transition except `Closed`; reconnecting
//! resumes from it so the client sees each operation at least once and applies
//! it exactly once (projections are idempotent by sequence).

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{DocumentId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Synced,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("invalid transition from {from:?} on {event}")]
    InvalidTransition { from: SessionState, event: &'static str },
    #[error("session closed")]
    Closed,
    #[error("gave up after {0} reconnect attempts")]
    Exhausted(u32),
}

/// Exponential backoff with a cap and a bounded attempt count.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    doc_id: DocumentId,
    state: SessionState,
    last_acked: u64,
    failed_attempts: u32,
    policy: ReconnectPolicy,
}

impl Session {
    pub fn new(doc_id: DocumentId, policy: ReconnectPolicy) -> Self {
        Self::resume(Uuid::new_v4(), doc_id, 0, policy)
    }

    /// A session that already holds state up to `last_acked`.
    pub fn resume(
        id: SessionId,
        doc_id: DocumentId,
        last_acked: u64,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            id,
            doc_id,
            state: SessionState::Connecting,
            last_acked,
            failed_attempts: 0,
            policy,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Transport is up. Returns the sequence to resume reading after.
    pub fn on_connected(&mut self) -> Result<u64, SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Reconnecting => {
                self.state = SessionState::Synced;
                self.failed_attempts = 0;
                Ok(self.last_acked)
            }
            SessionState::Closed => Err(SessionError::Closed),
            from => Err(SessionError::InvalidTransition {
                from,
                event: "connected",
            }),
        }
    }

    /// The transport broke or a connect attempt failed.
    ///
    /// Returns the delay before the next attempt, or `Exhausted` once the
    /// policy's attempt budget is spent (the session is then `Closed`).
    pub fn on_transport_failure(&mut self, reason: &str) -> Result<Duration, SessionError> {
        match self.state {
            SessionState::Closed => return Err(SessionError::Closed),
            // Losing a live connection is not itself a failed attempt
            SessionState::Synced => {}
            SessionState::Connecting | SessionState::Reconnecting => {
                self.failed_attempts += 1;
            }
        }

        if self.failed_attempts >= self.policy.max_attempts {
            log::warn!(
                "Session {} on {} closing after {} failed attempts: {}",
                self.id,
                self.doc_id,
                self.failed_attempts,
                reason
            );
            self.state = SessionState::Closed;
            return Err(SessionError::Exhausted(self.failed_attempts));
        }

        self.state = SessionState::Reconnecting;
        let delay = self.policy.backoff(self.failed_attempts + 1);
        log::debug!(
            "Session {} reconnecting in {:?} ({})",
            self.id,
            delay,
            reason
        );
        Ok(delay)
    }

    /// Record a delivered operation. Returns `false` for duplicates and
    /// anything received while not synced.
    pub fn acknowledge(&mut self, sequence: u64) -> bool {
        if self.state != SessionState::Synced || sequence <= self.last_acked {
            return false;
        }
        self.last_acked = sequence;
        true
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}
