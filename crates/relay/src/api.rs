// Read-only HTTP introspection of live rooms.

use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::Uri,
    routing::get,
    Json, Router,
};
use gridsync_common::presence::CellPresence;
use gridsync_common::protocol::MessageType;
use gridsync_common::room::resolve_room_name;
use serde::Serialize;
use serde_json::json;

use crate::error::{ErrorCode, RelayError};
use crate::replica::ClientId;
use crate::room::RoomSummary;
use crate::ws::RelayState;

const ROOMS_PREFIX: &str = "/v1/rooms";

pub fn router() -> Router<RelayState> {
    Router::new()
        .route("/v1/relay", get(relay_info))
        .route("/v1/rooms", get(list_rooms))
        .route("/v1/rooms/{*room}", get(get_room))
}

#[derive(Debug, Serialize)]
struct RelayInfo {
    ws_url: String,
    default_room: String,
    message_types: MessageTypes,
}

#[derive(Debug, Serialize)]
struct MessageTypes {
    sync: u64,
    awareness: u64,
}

#[derive(Debug, Serialize)]
struct RoomList {
    rooms: Vec<RoomSummary>,
}

#[derive(Debug, Serialize)]
struct RoomDetail {
    room: String,
    connections: usize,
    presence: Vec<PresenceEntry>,
    cells: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct PresenceEntry {
    client_id: ClientId,
    name: Option<String>,
    color: Option<String>,
    cell_key: Option<String>,
}

impl PresenceEntry {
    fn from_raw(client_id: ClientId, raw: &str) -> Self {
        // Payloads that are not grid presence still count as present.
        match CellPresence::from_json(raw) {
            Some(presence) => Self {
                client_id,
                name: Some(presence.name),
                color: presence.color,
                cell_key: presence.cell_key,
            },
            None => Self { client_id, name: None, color: None, cell_key: None },
        }
    }
}

async fn relay_info(State(state): State<RelayState>) -> Json<RelayInfo> {
    Json(RelayInfo {
        ws_url: state.ws_url().to_string(),
        default_room: state.default_room().to_string(),
        message_types: MessageTypes {
            sync: MessageType::Sync.tag(),
            awareness: MessageType::Awareness.tag(),
        },
    })
}

async fn list_rooms(State(state): State<RelayState>) -> Json<RoomList> {
    let mut rooms = Vec::new();
    for room in state.registry().rooms().await {
        rooms.push(room.summary().await);
    }
    Json(RoomList { rooms })
}

async fn get_room(
    State(state): State<RelayState>,
    uri: Uri,
) -> Result<Json<RoomDetail>, RelayError> {
    // Same raw, undecoded naming as the websocket endpoint.
    let rest = uri.path().strip_prefix(ROOMS_PREFIX).unwrap_or_default();
    let room_id = resolve_room_name(rest, state.default_room()).map_err(|error| {
        RelayError::new(ErrorCode::ValidationFailed, error.to_string())
            .with_details(json!({ "field": "room" }))
    })?;

    let Some(room) = state.registry().get(&room_id).await else {
        return Err(RelayError::from_code(ErrorCode::RoomNotFound)
            .with_details(json!({ "room": room_id })));
    };

    let snapshot = room.snapshot().await;
    Ok(Json(RoomDetail {
        room: snapshot.room,
        connections: snapshot.connections,
        presence: snapshot
            .presence
            .iter()
            .map(|(client_id, raw)| PresenceEntry::from_raw(*client_id, raw))
            .collect(),
        cells: snapshot.cells,
    }))
}
