//! Presence fan-out between the live sessions of a document.
//!
//! Committed operations do not travel through here: sessions follow the
//! change log directly. Rooms only carry ephemeral presence frames, which may
//! be dropped under backpressure without affecting correctness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::model::{DocumentId, SessionId};
use crate::protocol::{ProtocolError, SyncMessage};

/// Presence traffic, per room or summed over all rooms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub rooms: usize,
    pub messages_sent: u64,
    pub active_sessions: usize,
}

/// An encoded frame tagged with the session it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: SessionId,
    pub bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
struct Member {
    /// Latest presence frame, replayed to sessions that join later
    last_presence: Option<Arc<Vec<u8>>>,
}

/// Presence room of a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    members: RwLock<HashMap<SessionId, Member>>,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Join the room. Returns the receiver and the current presence of the
    /// other members.
    pub async fn join(
        &self,
        session_id: SessionId,
    ) -> (broadcast::Receiver<Envelope>, Vec<Arc<Vec<u8>>>) {
        let mut members = self.members.write().await;
        let current = members
            .iter()
            .filter(|(id, _)| **id != session_id)
            .filter_map(|(_, m)| m.last_presence.clone())
            .collect();
        members.insert(session_id, Member::default());
        (self.sender.subscribe(), current)
    }

    /// Leave the room. Returns whether the session was a member.
    pub async fn leave(&self, session_id: &SessionId) -> bool {
        self.members.write().await.remove(session_id).is_some()
    }

    /// Fan a presence frame out to every member; receivers skip their own.
    pub async fn publish(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        if let Some(member) = self.members.write().await.get_mut(&msg.session_id) {
            member.last_presence = Some(bytes.clone());
        }
        Ok(self.publish_raw(msg.session_id, bytes))
    }

    /// Fan out pre-encoded bytes without recording them.
    pub fn publish_raw(&self, from: SessionId, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { from, bytes }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            rooms: 1,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_sessions: self.members.read().await.len(),
        }
    }
}

/// Maps document ids to presence rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, doc_id: DocumentId) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(doc_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    /// Drop the room of `doc_id` once nobody is in it.
    pub async fn remove_if_empty(&self, doc_id: &DocumentId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.member_count().await == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Totals over the rooms that are currently open.
    pub async fn stats(&self) -> BroadcastStats {
        let rooms: Vec<Arc<BroadcastGroup>> = self.rooms.read().await.values().cloned().collect();
        let mut total = BroadcastStats::default();
        for room in rooms {
            let stats = room.stats().await;
            total.rooms += stats.rooms;
            total.messages_sent += stats.messages_sent;
            total.active_sessions += stats.active_sessions;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{PresenceState, PresenceUpdate};
    use uuid::Uuid;

    fn presence(session: SessionId, doc: DocumentId, record: &str) -> SyncMessage {
        let update = PresenceUpdate {
            session_id: session,
            user_name: "Alice".into(),
            state: PresenceState::Editing {
                record_id: record.into(),
                field: None,
            },
        };
        SyncMessage::presence(session, doc, &update).unwrap()
    }

    #[tokio::test]
    async fn test_join_leave() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();

        let _rx = group.join(alice).await;
        assert_eq!(group.member_count().await, 1);

        assert!(group.leave(&alice).await);
        assert!(!group.leave(&alice).await);
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_all_receivers() {
        let group = BroadcastGroup::new(16);
        let doc = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (mut rx_a, _) = group.join(alice).await;
        let (mut rx_b, _) = group.join(bob).await;

        let count = group.publish(&presence(alice, doc, "rec1")).await.unwrap();
        // Sender filtering is done by the receiving side
        assert_eq!(count, 2);
        assert_eq!(rx_a.recv().await.unwrap().from, alice);
        let received = rx_b.recv().await.unwrap();
        let decoded = SyncMessage::decode(&received.bytes).unwrap();
        assert_eq!(decoded.presence_body().unwrap().session_id, alice);
    }

    #[tokio::test]
    async fn test_late_joiner_sees_current_presence() {
        let group = BroadcastGroup::new(16);
        let doc = Uuid::new_v4();
        let alice = Uuid::new_v4();

        let _rx = group.join(alice).await;
        group.publish(&presence(alice, doc, "rec7")).await.unwrap();

        let (_rx_b, current) = group.join(Uuid::new_v4()).await;
        assert_eq!(current.len(), 1);
        let msg = SyncMessage::decode(&current[0]).unwrap();
        assert_eq!(msg.session_id, alice);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let _rx = group.join(alice).await;

        group.publish_raw(alice, Arc::new(vec![1, 2, 3]));
        group.publish_raw(alice, Arc::new(vec![4]));

        let stats = group.stats().await;
        assert_eq!(
            stats,
            BroadcastStats {
                rooms: 1,
                messages_sent: 2,
                active_sessions: 1
            }
        );
    }

    #[tokio::test]
    async fn test_room_manager() {
        let manager = RoomManager::new(16);
        let doc = Uuid::new_v4();

        let room1 = manager.get_or_create(doc).await;
        let room2 = manager.get_or_create(doc).await;
        assert!(Arc::ptr_eq(&room1, &room2));

        let session = Uuid::new_v4();
        let _rx = room1.join(session).await;
        room1.publish_raw(session, Arc::new(vec![0]));
        let _other = manager.get_or_create(Uuid::new_v4()).await;
        assert_eq!(
            manager.stats().await,
            BroadcastStats {
                rooms: 2,
                messages_sent: 1,
                active_sessions: 1
            }
        );
        assert!(!manager.remove_if_empty(&doc).await);

        room1.leave(&session).await;
        assert!(manager.remove_if_empty(&doc).await);
        assert_eq!(manager.room_count().await, 1);
    }
}
