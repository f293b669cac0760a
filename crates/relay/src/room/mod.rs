// A room owns one replica and the set of connections attached to it.
//
// All mutation of the replica and the member set happens under the room's
// mutex, so every handler for a room runs to completion before the next one.

mod broadcast;
mod registry;

use std::collections::{BTreeMap, HashMap, HashSet};

use axum::body::Bytes;
use gridsync_common::protocol::{encode_frame, MessageType};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::metrics;
use crate::replica::{ClientId, Replica, ReplicaError};

pub use broadcast::{broadcast, BroadcastReport};
pub use registry::RoomRegistry;

pub type ConnectionId = u64;
pub type OutboundSender = mpsc::UnboundedSender<Bytes>;

/// Room-side record of an attached connection.
#[derive(Debug)]
pub struct Member {
    outbound: OutboundSender,
    /// Awareness ids this connection published and must retract on close.
    owned_awareness: HashSet<ClientId>,
}

impl Member {
    pub fn new(outbound: OutboundSender) -> Self {
        Self { outbound, owned_awareness: HashSet::new() }
    }
}

/// Frames produced by one routed message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub relayed: BroadcastReport,
    pub replied: bool,
}

/// Result of removing a connection from its room.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Detached {
    pub retracted: Vec<ClientId>,
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoomSummary {
    pub room: String,
    pub connections: usize,
    pub awareness_clients: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room: String,
    pub connections: usize,
    pub presence: Vec<(ClientId, String)>,
    pub cells: BTreeMap<String, String>,
}

pub struct Room {
    id: String,
    state: Mutex<RoomState>,
}

struct RoomState {
    replica: Box<dyn Replica>,
    members: HashMap<ConnectionId, Member>,
}

impl RoomState {
    fn relay(&self, message_type: MessageType, payload: &[u8], origin: Option<ConnectionId>) -> BroadcastReport {
        let frame = Bytes::from(encode_frame(message_type, payload));
        let report = broadcast(&self.members, &frame, origin);
        metrics::add_frames_relayed(report.delivered);
        if !report.failed.is_empty() {
            debug!(failed = ?report.failed, "skipped members with closed send queues");
        }
        report
    }

    fn send_to(&self, connection_id: ConnectionId, message_type: MessageType, payload: &[u8]) -> bool {
        let Some(member) = self.members.get(&connection_id) else {
            return false;
        };
        member.outbound.send(Bytes::from(encode_frame(message_type, payload))).is_ok()
    }
}

impl Room {
    pub(crate) fn new(id: impl Into<String>, replica: Box<dyn Replica>) -> Self {
        Self { id: id.into(), state: Mutex::new(RoomState { replica, members: HashMap::new() }) }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn contains(&self, connection_id: ConnectionId) -> bool {
        self.state.lock().await.members.contains_key(&connection_id)
    }

    pub async fn awareness_clients(&self) -> Vec<ClientId> {
        self.state.lock().await.replica.awareness_clients()
    }

    pub async fn owned_awareness(&self, connection_id: ConnectionId) -> Vec<ClientId> {
        let state = self.state.lock().await;
        let mut owned: Vec<ClientId> = state
            .members
            .get(&connection_id)
            .map(|member| member.owned_awareness.iter().copied().collect())
            .unwrap_or_default();
        owned.sort_unstable();
        owned
    }

    pub async fn summary(&self) -> RoomSummary {
        let state = self.state.lock().await;
        RoomSummary {
            room: self.id.clone(),
            connections: state.members.len(),
            awareness_clients: state.replica.awareness_clients().len(),
        }
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock().await;
        RoomSnapshot {
            room: self.id.clone(),
            connections: state.members.len(),
            presence: state.replica.presence(),
            cells: state.replica.cells(),
        }
    }

    /// Register a connection and queue its handshake: a sync-step-1 frame,
    /// then the full awareness table when anyone is present.
    ///
    /// Both frames are queued before the member becomes visible to broadcasts.
    pub(crate) async fn attach(&self, connection_id: ConnectionId, outbound: OutboundSender) {
        let mut state = self.state.lock().await;

        let handshake = state.replica.handshake();
        let mut frames = vec![encode_frame(MessageType::Sync, &handshake)];

        let present = state.replica.awareness_clients();
        if !present.is_empty() {
            match state.replica.encode_awareness(&present) {
                Ok(payload) => frames.push(encode_frame(MessageType::Awareness, &payload)),
                Err(error) => {
                    warn!(room = %self.id, connection_id, ?error, "failed to encode awareness snapshot")
                }
            }
        }

        for frame in frames {
            if outbound.send(Bytes::from(frame)).is_err() {
                debug!(room = %self.id, connection_id, "send queue closed before handshake");
                break;
            }
        }

        state.members.insert(connection_id, Member::new(outbound));
    }

    /// Apply a SYNC payload from `origin`. A document change is relayed to
    /// every other member; a direct response goes only to `origin`.
    pub async fn apply_sync(
        &self,
        origin: ConnectionId,
        payload: &[u8],
    ) -> Result<Delivery, ReplicaError> {
        let mut state = self.state.lock().await;
        let outcome = state.replica.apply_sync(payload)?;

        let mut delivery = Delivery::default();
        if let Some(update) = outcome.update {
            delivery.relayed = state.relay(MessageType::Sync, &update, Some(origin));
        }
        if let Some(reply) = outcome.reply {
            delivery.replied = state.send_to(origin, MessageType::Sync, &reply);
        }

        Ok(delivery)
    }

    /// Apply an AWARENESS payload from `origin`, record which ids it now owns,
    /// and relay the changed entries to every other member.
    pub async fn apply_awareness(
        &self,
        origin: ConnectionId,
        payload: &[u8],
    ) -> Result<Delivery, ReplicaError> {
        let mut state = self.state.lock().await;
        let change = state.replica.apply_awareness(payload)?;
        if change.is_empty() {
            return Ok(Delivery::default());
        }

        for (connection_id, member) in state.members.iter_mut() {
            for client_id in change.removed.iter() {
                member.owned_awareness.remove(client_id);
            }
            if *connection_id == origin {
                member.owned_awareness.extend(change.present());
            } else {
                for client_id in change.present() {
                    member.owned_awareness.remove(&client_id);
                }
            }
        }

        let encoded = state.replica.encode_awareness(&change.all_changes())?;
        Ok(Delivery {
            relayed: state.relay(MessageType::Awareness, &encoded, Some(origin)),
            replied: false,
        })
    }

    /// Remove a connection, retract the awareness entries it owned and relay
    /// the retraction to the members left behind.
    pub(crate) async fn detach(&self, connection_id: ConnectionId) -> Option<Detached> {
        let mut state = self.state.lock().await;
        let member = state.members.remove(&connection_id)?;

        let mut owned: Vec<ClientId> = member.owned_awareness.into_iter().collect();
        owned.sort_unstable();
        let retracted = state.replica.remove_awareness(&owned);

        if !retracted.is_empty() {
            match state.replica.encode_awareness(&retracted) {
                Ok(payload) => {
                    state.relay(MessageType::Awareness, &payload, None);
                }
                Err(error) => {
                    warn!(room = %self.id, connection_id, ?error, "failed to encode awareness retraction")
                }
            }
        }

        Some(Detached { retracted, remaining: state.members.len() })
    }
}
