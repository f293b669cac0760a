use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::{ConnectionId, OutboundSender, Room};
use crate::metrics;
use crate::replica::ReplicaFactory;

/// Process-wide table of live rooms.
///
/// A room is present exactly while at least one connection has joined it and
/// not yet released it. The registry lock is never held while waiting on a
/// room lock, so a busy room cannot stall joins or releases elsewhere.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<String, RoomEntry>>>,
    factory: ReplicaFactory,
}

struct RoomEntry {
    room: Arc<Room>,
    /// Connections that joined and have not released yet.
    joined: usize,
}

impl RoomRegistry {
    pub fn new(factory: ReplicaFactory) -> Self {
        Self { rooms: Arc::new(Mutex::new(HashMap::new())), factory }
    }

    /// Look up or create `room_id`, count the connection in, then attach it.
    ///
    /// The count is taken under the registry lock, so a concurrent release
    /// cannot drop the room before the attach lands.
    pub async fn join(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        outbound: OutboundSender,
    ) -> Arc<Room> {
        let room = {
            let mut rooms = self.rooms.lock().await;
            let entry = rooms.entry(room_id.to_string()).or_insert_with(|| {
                metrics::room_created();
                info!(room = %room_id, "room created");
                RoomEntry { room: Arc::new(Room::new(room_id, (self.factory)())), joined: 0 }
            });
            entry.joined += 1;
            Arc::clone(&entry.room)
        };

        room.attach(connection_id, outbound).await;
        room
    }

    /// Count a detached connection out of `room`, dropping the room when it
    /// was the last one. Returns whether the room was removed.
    pub async fn release_room(&self, room: &Arc<Room>) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(entry) = rooms.get_mut(room.id()) else {
            return false;
        };
        // A released room may already have been replaced by a fresh one.
        if !Arc::ptr_eq(&entry.room, room) {
            return false;
        }

        entry.joined = entry.joined.saturating_sub(1);
        if entry.joined > 0 {
            return false;
        }

        rooms.remove(room.id());
        metrics::room_released();
        info!(room = %room.id(), "room released");
        true
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(room_id).map(|entry| Arc::clone(&entry.room))
    }

    pub async fn contains(&self, room_id: &str) -> bool {
        self.rooms.lock().await.contains_key(room_id)
    }

    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        let mut rooms: Vec<Arc<Room>> =
            self.rooms.lock().await.values().map(|entry| Arc::clone(&entry.room)).collect();
        rooms.sort_by(|left, right| left.id().cmp(right.id()));
        rooms
    }

    pub async fn len(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::RoomRegistry;
    use crate::replica::testing::memory_factory;

    #[tokio::test]
    async fn join_reuses_live_room() {
        let registry = RoomRegistry::new(memory_factory());
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        let first = registry.join("r1", 1, tx_a).await;
        let second = registry.join("r1", 2, tx_b).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
        assert_eq!(first.connection_count().await, 2);
    }

    #[tokio::test]
    async fn room_is_released_only_when_empty() {
        let registry = RoomRegistry::new(memory_factory());
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let room = registry.join("r1", 1, tx_a).await;
        registry.join("r1", 2, tx_b).await;

        room.detach(1).await;
        assert!(!registry.release_room(&room).await);
        assert!(registry.contains("r1").await);

        room.detach(2).await;
        assert!(registry.release_room(&room).await);
        assert!(!registry.contains("r1").await);
        assert!(!registry.release_room(&room).await);
    }

    #[tokio::test]
    async fn rejoining_a_released_room_starts_fresh() {
        let registry = RoomRegistry::new(memory_factory());
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let room = registry.join("r2", 1, tx_a).await;
        room.apply_sync(1, &[2, 9]).await.expect("update should apply");
        room.apply_awareness(1, &[7, 1]).await.expect("presence should apply");
        room.detach(1).await;
        registry.release_room(&room).await;

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let fresh = registry.join("r2", 2, tx_b).await;

        assert!(!Arc::ptr_eq(&room, &fresh));
        assert!(fresh.awareness_clients().await.is_empty());
        assert!(fresh.snapshot().await.cells.is_empty());
        // Only the handshake; no awareness snapshot from the previous room.
        assert_eq!(rx_b.try_recv().expect("handshake").to_vec(), vec![0, 0]);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let registry = RoomRegistry::new(memory_factory());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        let room_a = registry.join("a", 1, tx_a).await;
        registry.join("a", 2, tx_b).await;
        let room_b = registry.join("b", 3, tx_c).await;
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}
        while rx_c.try_recv().is_ok() {}

        room_a.apply_sync(1, &[2, 1]).await.expect("update should apply");
        room_a.apply_awareness(1, &[7, 1]).await.expect("presence should apply");

        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
        assert!(room_b.awareness_clients().await.is_empty());
        assert!(room_b.snapshot().await.cells.is_empty());
        assert_eq!(room_b.connection_count().await, 1);
    }

    #[tokio::test]
    async fn rooms_are_listed_by_name() {
        let registry = RoomRegistry::new(memory_factory());
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        registry.join("zeta", 1, tx_a).await;
        registry.join("alpha", 2, tx_b).await;

        let names: Vec<String> =
            registry.rooms().await.iter().map(|room| room.id().to_string()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(registry.get("alpha").await.is_some());
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn stale_room_handle_does_not_release_its_replacement() {
        let registry = RoomRegistry::new(memory_factory());
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let old = registry.join("r3", 1, tx_a).await;
        old.detach(1).await;
        assert!(registry.release_room(&old).await);

        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let fresh = registry.join("r3", 2, tx_b).await;

        assert!(!registry.release_room(&old).await);
        assert!(registry.contains("r3").await);
        assert_eq!(fresh.connection_count().await, 1);
    }

    #[tokio::test]
    async fn busy_room_does_not_stall_other_rooms() {
        let registry = RoomRegistry::new(memory_factory());
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let room_a = registry.join("a", 1, tx_a).await;
        let (tx_c, _rx_c) = mpsc::unbounded_channel();
        let room_c = registry.join("c", 4, tx_c).await;
        room_c.detach(4).await;

        let busy = room_a.state.lock().await;
        let queued = tokio::spawn({
            let registry = registry.clone();
            let (tx, _rx) = mpsc::unbounded_channel();
            async move { registry.join("a", 2, tx).await }
        });
        // Let the queued join take its registry slot and park on room a.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        timeout(Duration::from_millis(300), registry.join("b", 3, tx_b))
            .await
            .expect("join to room b should not wait for room a");
        let released = timeout(Duration::from_millis(300), registry.release_room(&room_c))
            .await
            .expect("release of room c should not wait for room a");
        assert!(released);
        assert!(registry.contains("a").await);

        drop(busy);
        let joined = queued.await.expect("queued join should finish");
        assert!(Arc::ptr_eq(&joined, &room_a));
        assert_eq!(room_a.connection_count().await, 2);
    }
}
