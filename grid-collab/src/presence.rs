//! Ephemeral "who is editing what" awareness.
//!
//! Presence never touches the change log. The server fans updates out to the
//! other sessions of the same document; each client tracks its peers in a
//! [`PresenceRoom`].
//!
//! ```text
//! local focus change ──► PresenceRoom::update_local() ──► Presence frame
//!                          (repeats throttled)                 │
//!                                                              ▼ server fan-out
//! remote PresenceRoom::handle_update() ◄───────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::model::{RecordId, SessionId};

/// What a session is looking at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceState {
    /// Connected, nothing focused
    Viewing,
    /// Focused on a record, optionally on one of its fields
    Editing {
        record_id: RecordId,
        field: Option<String>,
    },
    /// Clean disconnect
    Left,
}

/// Payload of a `Presence` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub session_id: SessionId,
    pub user_name: String,
    pub state: PresenceState,
}

impl PresenceUpdate {
    pub fn left(session_id: SessionId) -> Self {
        Self {
            session_id,
            user_name: String::new(),
            state: PresenceState::Left,
        }
    }
}

/// A remote session as seen locally.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub session_id: SessionId,
    pub user_name: String,
    pub state: PresenceState,
    last_update: Instant,
}

impl PeerPresence {
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Presence of every remote session in one document.
pub struct PresenceRoom {
    local_session: SessionId,
    local_name: String,
    local_state: PresenceState,
    peers: HashMap<SessionId, PeerPresence>,
    last_broadcast: Option<Instant>,
    /// Minimum interval between repeats of an unchanged local state
    repeat_interval: Duration,
}

impl PresenceRoom {
    pub fn new(local_session: SessionId, local_name: impl Into<String>) -> Self {
        Self::with_interval(local_session, local_name, Duration::from_secs(5))
    }

    pub fn with_interval(
        local_session: SessionId,
        local_name: impl Into<String>,
        repeat_interval: Duration,
    ) -> Self {
        Self {
            local_session,
            local_name: local_name.into(),
            local_state: PresenceState::Viewing,
            peers: HashMap::new(),
            last_broadcast: None,
            repeat_interval,
        }
    }

    /// Apply an update received from the network. Own updates are ignored.
    pub fn handle_update(&mut self, update: &PresenceUpdate) {
        if update.session_id == self.local_session {
            return;
        }
        match &update.state {
            PresenceState::Left => {
                self.peers.remove(&update.session_id);
            }
            state => {
                self.peers.insert(
                    update.session_id,
                    PeerPresence {
                        session_id: update.session_id,
                        user_name: update.user_name.clone(),
                        state: state.clone(),
                        last_update: Instant::now(),
                    },
                );
            }
        }
    }

    /// Change the local state. Returns the update to send, or `None` when the
    /// state is unchanged and was sent recently.
    pub fn update_local(&mut self, state: PresenceState) -> Option<PresenceUpdate> {
        let recent = self
            .last_broadcast
            .is_some_and(|at| at.elapsed() < self.repeat_interval);
        if state == self.local_state && recent {
            return None;
        }
        self.local_state = state;
        self.last_broadcast = Some(Instant::now());
        Some(self.local_update())
    }

    /// Current local state, regardless of throttling.
    pub fn local_update(&self) -> PresenceUpdate {
        PresenceUpdate {
            session_id: self.local_session,
            user_name: self.local_name.clone(),
            state: self.local_state.clone(),
        }
    }

    pub fn leave_update(&self) -> PresenceUpdate {
        PresenceUpdate::left(self.local_session)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerPresence> {
        self.peers.values()
    }

    pub fn peer(&self, session_id: &SessionId) -> Option<&PeerPresence> {
        self.peers.get(session_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Sessions currently editing `record_id`.
    pub fn editors_of(&self, record_id: &str) -> Vec<SessionId> {
        let mut editors: Vec<SessionId> = self
            .peers
            .values()
            .filter(|p| matches!(&p.state, PresenceState::Editing { record_id: r, .. } if r == record_id))
            .map(|p| p.session_id)
            .collect();
        editors.sort();
        editors
    }

    /// Drop peers that have not sent anything for `timeout`.
    pub fn prune_idle(&mut self, timeout: Duration) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, p| !p.is_idle(timeout));
        before - self.peers.len()
    }
}
