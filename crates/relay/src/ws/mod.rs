// WebSocket transport: room selection from the request path, then one
// reader task, one writer task and a driver loop per connection.

pub mod connection;
pub mod router;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use gridsync_common::room::resolve_room_name;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::RelayConfig;
use crate::error::{
    request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, RelayError,
};
use crate::room::{ConnectionId, RoomRegistry};
use connection::{CloseReason, Connection, ConnectionEvent};

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayStateInner>,
}

struct RelayStateInner {
    registry: RoomRegistry,
    ws_url: String,
    default_room: String,
    max_frame_bytes: usize,
    next_connection_id: AtomicU64,
}

impl RelayState {
    pub fn new(registry: RoomRegistry, config: &RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayStateInner {
                registry,
                ws_url: config.ws_url.clone(),
                default_room: config.default_room.clone(),
                max_frame_bytes: config.max_frame_bytes,
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.inner.registry
    }

    pub fn ws_url(&self) -> &str {
        &self.inner.ws_url
    }

    pub fn default_room(&self) -> &str {
        &self.inner.default_room
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.inner.max_frame_bytes
    }

    fn next_connection_id(&self) -> ConnectionId {
        self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Fallback handler: every unrouted path is a room.
pub async fn ws_upgrade(
    State(state): State<RelayState>,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            return RelayError::from_code(ErrorCode::UpgradeRequired)
                .with_details(json!({ "reason": rejection.body_text() }))
                .into_response();
        }
    };

    let path_and_query = uri.path_and_query().map(|value| value.as_str()).unwrap_or("/");
    let room_id = match resolve_room_name(path_and_query, state.default_room()) {
        Ok(room_id) => room_id,
        Err(error) => {
            return RelayError::new(ErrorCode::ValidationFailed, error.to_string())
                .with_details(json!({ "field": "room" }))
                .into_response();
        }
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_message_size(state.max_frame_bytes())
        .max_frame_size(state.max_frame_bytes())
        .on_upgrade(move |socket| with_request_id_scope(request_id, handle_socket(socket, state, room_id)))
}

async fn handle_socket(socket: WebSocket, state: RelayState, room_id: String) {
    let connection_id = state.next_connection_id();
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ConnectionEvent>();

    let mut connection = Connection::new(connection_id, room_id, state.registry().clone());
    // The handshake is queued before the writer starts so it is the first thing sent.
    connection.activate(outbound_tx).await;

    let mut writer = tokio::spawn(write_outbound(sink, outbound_rx, events_tx.clone()));
    let reader = tokio::spawn(read_inbound(stream, events_tx));

    while let Some(event) = events_rx.recv().await {
        if connection.handle_event(event).await.is_break() {
            break;
        }
    }
    connection.close(&CloseReason::Server).await;

    reader.abort();
    // Detaching dropped the room's sender, so the writer ends once its queue drains.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!(connection_id, "writer did not drain in time");
        writer.abort();
    }
}

async fn read_inbound(
    mut stream: SplitStream<WebSocket>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    while let Some(message) = stream.next().await {
        let event = match message {
            Ok(Message::Binary(payload)) => ConnectionEvent::Frame(payload),
            Ok(Message::Close(_)) => break,
            // Pings are answered by the websocket layer.
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Text(_)) => {
                debug!("ignoring text frame");
                continue;
            }
            Err(error) => ConnectionEvent::TransportError(error.to_string()),
        };

        let fatal = matches!(event, ConnectionEvent::TransportError(_));
        if events.send(event).is_err() || fatal {
            return;
        }
    }

    let _ = events.send(ConnectionEvent::Closed);
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(error) = sink.send(Message::Binary(frame)).await {
            let _ = events.send(ConnectionEvent::SendFailed(error.to_string()));
            return;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}
