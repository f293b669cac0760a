// Connection lifecycle: Connecting -> Active -> Closed.
//
// The socket tasks never touch room state directly. They turn transport
// activity into `ConnectionEvent`s, and the driver applies those to a
// `Connection` one at a time, in arrival order.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use axum::body::Bytes;
use tracing::{debug, info, warn};

use super::router::route_frame;
use crate::metrics;
use crate::room::{ConnectionId, OutboundSender, Room, RoomRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A binary frame from the peer.
    Frame(Bytes),
    /// The peer closed the transport or the stream ended.
    Closed,
    TransportError(String),
    /// Writing to the peer failed.
    SendFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    TransportError(String),
    SendFailed(String),
    /// The relay dropped the connection before the peer did (e.g. shutdown).
    Server,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::TransportError(error) => write!(f, "transport error: {error}"),
            Self::SendFailed(error) => write!(f, "send failed: {error}"),
            Self::Server => f.write_str("closed by relay"),
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    room_id: String,
    registry: RoomRegistry,
    room: Option<Arc<Room>>,
    state: ConnectionState,
}

impl Connection {
    pub fn new(id: ConnectionId, room_id: impl Into<String>, registry: RoomRegistry) -> Self {
        Self { id, room_id: room_id.into(), registry, room: None, state: ConnectionState::Connecting }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Join the room and queue the handshake on `outbound`.
    ///
    /// Only valid from `Connecting`; a second call is a no-op.
    pub async fn activate(&mut self, outbound: OutboundSender) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        let room = self.registry.join(&self.room_id, self.id, outbound).await;
        self.room = Some(room);
        self.state = ConnectionState::Active;
        metrics::connection_opened();
        info!(room = %self.room_id, connection_id = self.id, "connection active");
    }

    pub async fn handle_event(&mut self, event: ConnectionEvent) -> ControlFlow<CloseReason> {
        match event {
            ConnectionEvent::Frame(frame) => {
                self.on_frame(&frame).await;
                ControlFlow::Continue(())
            }
            ConnectionEvent::Closed => self.break_with(CloseReason::PeerClosed).await,
            ConnectionEvent::TransportError(error) => {
                warn!(room = %self.room_id, connection_id = self.id, %error, "transport error");
                self.break_with(CloseReason::TransportError(error)).await
            }
            ConnectionEvent::SendFailed(error) => {
                metrics::increment_send_failures();
                warn!(room = %self.room_id, connection_id = self.id, %error, "send to peer failed");
                self.break_with(CloseReason::SendFailed(error)).await
            }
        }
    }

    async fn break_with(&mut self, reason: CloseReason) -> ControlFlow<CloseReason> {
        self.close(&reason).await;
        ControlFlow::Break(reason)
    }

    async fn on_frame(&self, frame: &[u8]) {
        let (ConnectionState::Active, Some(room)) = (self.state, self.room.as_ref()) else {
            debug!(connection_id = self.id, state = ?self.state, "dropping frame outside active state");
            return;
        };

        if let Err(error) = route_frame(room, self.id, frame).await {
            metrics::increment_decode_errors();
            warn!(room = %self.room_id, connection_id = self.id, %error, "dropping undecodable frame");
        }
    }

    /// Tear the connection down. Runs at most once; returns whether this call did the work.
    pub async fn close(&mut self, reason: &CloseReason) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }

        let was_active = self.state == ConnectionState::Active;
        self.state = ConnectionState::Closed;

        if let Some(room) = self.room.take() {
            if let Some(detached) = room.detach(self.id).await {
                debug!(
                    room = %self.room_id,
                    connection_id = self.id,
                    retracted = ?detached.retracted,
                    remaining = detached.remaining,
                    "connection detached"
                );
            }
            self.registry.release_room(&room).await;
        }

        if was_active {
            metrics::connection_closed();
        }
        info!(room = %self.room_id, connection_id = self.id, %reason, "connection closed");
        true
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use axum::body::Bytes;
    use tokio::sync::mpsc;

    use super::{CloseReason, Connection, ConnectionEvent, ConnectionState};
    use crate::replica::testing::memory_factory;
    use crate::room::RoomRegistry;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame.to_vec());
        }
        frames
    }

    async fn active(
        registry: &RoomRegistry,
        id: u64,
        room: &str,
    ) -> (Connection, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut connection = Connection::new(id, room, registry.clone());
        connection.activate(tx).await;
        (connection, rx)
    }

    #[tokio::test]
    async fn activation_joins_room_and_queues_handshake() {
        let registry = RoomRegistry::new(memory_factory());
        let (connection, mut rx) = active(&registry, 1, "r1").await;

        assert_eq!(connection.state(), ConnectionState::Active);
        assert!(registry.contains("r1").await);
        assert_eq!(drain(&mut rx), vec![vec![0, 0]]);
    }

    #[tokio::test]
    async fn error_then_close_tears_down_once() {
        let registry = RoomRegistry::new(memory_factory());
        let (mut a, _rx_a) = active(&registry, 1, "r1").await;
        let (_b, mut rx_b) = active(&registry, 2, "r1").await;
        a.handle_event(ConnectionEvent::Frame(Bytes::from_static(&[1, 7, 1]))).await;
        drain(&mut rx_b);

        let first = a.handle_event(ConnectionEvent::TransportError("reset".into())).await;
        let second = a.handle_event(ConnectionEvent::Closed).await;

        assert_eq!(first, ControlFlow::Break(CloseReason::TransportError("reset".into())));
        assert_eq!(second, ControlFlow::Break(CloseReason::PeerClosed));
        assert_eq!(a.state(), ConnectionState::Closed);
        // Exactly one retraction reached the remaining peer.
        assert_eq!(drain(&mut rx_b), vec![vec![1, 7, 0]]);
        assert!(!a.close(&CloseReason::Server).await);
    }

    #[tokio::test]
    async fn updates_are_not_echoed_to_sender() {
        let registry = RoomRegistry::new(memory_factory());
        let (mut a, mut rx_a) = active(&registry, 1, "r1").await;
        let (_b, mut rx_b) = active(&registry, 2, "r1").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let flow = a.handle_event(ConnectionEvent::Frame(Bytes::from_static(&[0, 2, 11]))).await;

        assert_eq!(flow, ControlFlow::Continue(()));
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![vec![0, 2, 11]]);
    }

    #[tokio::test]
    async fn bad_frames_keep_connection_open() {
        let registry = RoomRegistry::new(memory_factory());
        let (mut a, _rx_a) = active(&registry, 1, "r1").await;
        let (_b, mut rx_b) = active(&registry, 2, "r1").await;
        drain(&mut rx_b);

        for frame in [&[][..], &[0x80][..], &[0, 9][..], &[1, 7][..], &[42, 1][..]] {
            let flow = a.handle_event(ConnectionEvent::Frame(Bytes::copy_from_slice(frame))).await;
            assert_eq!(flow, ControlFlow::Continue(()));
        }

        assert_eq!(a.state(), ConnectionState::Active);
        a.handle_event(ConnectionEvent::Frame(Bytes::from_static(&[0, 2, 3]))).await;
        assert_eq!(drain(&mut rx_b), vec![vec![0, 2, 3]]);
    }

    #[tokio::test]
    async fn send_failure_closes_only_that_connection() {
        let registry = RoomRegistry::new(memory_factory());
        let (mut a, _rx_a) = active(&registry, 1, "r1").await;
        let (mut b, _rx_b) = active(&registry, 2, "r1").await;

        let flow = b.handle_event(ConnectionEvent::SendFailed("broken pipe".into())).await;

        assert!(flow.is_break());
        assert_eq!(b.state(), ConnectionState::Closed);
        assert_eq!(a.state(), ConnectionState::Active);
        let room = registry.get("r1").await.expect("room stays while a is attached");
        assert_eq!(room.connection_count().await, 1);

        a.handle_event(ConnectionEvent::Closed).await;
        assert!(!registry.contains("r1").await);
    }

    #[tokio::test]
    async fn closing_before_activation_leaves_registry_untouched() {
        let registry = RoomRegistry::new(memory_factory());
        let mut connection = Connection::new(1, "r1", registry.clone());

        assert!(connection.close(&CloseReason::Server).await);
        assert!(!registry.contains("r1").await);

        let (tx, _rx) = mpsc::unbounded_channel();
        connection.activate(tx).await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!registry.contains("r1").await);
    }
}
