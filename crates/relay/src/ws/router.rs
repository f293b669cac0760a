// Inbound frame dispatch: decode the type tag, hand the payload to the room.

use gridsync_common::protocol::{decode_frame, FrameError, MessageType};
use thiserror::Error;
use tracing::warn;

use crate::metrics;
use crate::replica::ReplicaError;
use crate::room::{ConnectionId, Delivery, Room};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("{message_type} payload rejected: {source}")]
    Replica {
        message_type: &'static str,
        #[source]
        source: ReplicaError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Sync(Delivery),
    Awareness(Delivery),
    /// Tag outside the protocol; the frame was dropped.
    Ignored { tag: u64 },
}

pub async fn route_frame(
    room: &Room,
    origin: ConnectionId,
    raw: &[u8],
) -> Result<Routed, RouteError> {
    let frame = decode_frame(raw)?;

    let Some(message_type) = frame.message_type() else {
        metrics::record_frame_received("unknown");
        metrics::increment_unknown_message_types();
        warn!(room = %room.id(), connection_id = origin, tag = frame.tag, "ignoring unknown message type");
        return Ok(Routed::Ignored { tag: frame.tag });
    };
    metrics::record_frame_received(message_type.as_str());

    let rejected = |source| RouteError::Replica { message_type: message_type.as_str(), source };
    match message_type {
        MessageType::Sync => {
            room.apply_sync(origin, frame.payload).await.map(Routed::Sync).map_err(rejected)
        }
        MessageType::Awareness => room
            .apply_awareness(origin, frame.payload)
            .await
            .map(Routed::Awareness)
            .map_err(rejected),
    }
}
