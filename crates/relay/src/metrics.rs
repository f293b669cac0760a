use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    frames_received_total: Mutex<HashMap<String, u64>>,
    frames_relayed_total: AtomicU64,
    decode_errors_total: AtomicU64,
    unknown_message_types_total: AtomicU64,
    send_failures_total: AtomicU64,
    rooms_created_total: AtomicU64,
    rooms_released_total: AtomicU64,
    connections_opened_total: AtomicU64,
    connections_closed_total: AtomicU64,
    live_rooms: AtomicI64,
    live_connections: AtomicI64,
}

const FRAME_TYPES: [&str; 3] = ["sync", "awareness", "unknown"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        let mut frames_received_total = HashMap::new();
        for frame_type in FRAME_TYPES {
            frames_received_total.insert(frame_type.to_string(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            frames_received_total: Mutex::new(frames_received_total),
            frames_relayed_total: AtomicU64::new(0),
            decode_errors_total: AtomicU64::new(0),
            unknown_message_types_total: AtomicU64::new(0),
            send_failures_total: AtomicU64::new(0),
            rooms_created_total: AtomicU64::new(0),
            rooms_released_total: AtomicU64::new(0),
            connections_opened_total: AtomicU64::new(0),
            connections_closed_total: AtomicU64::new(0),
            live_rooms: AtomicI64::new(0),
            live_connections: AtomicI64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_frame_received(frame_type: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_frame_received(frame_type);
    }
}

pub fn add_frames_relayed(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.frames_relayed_total.fetch_add(count as u64, Ordering::SeqCst);
    }
}

pub fn increment_decode_errors() {
    if let Some(metrics) = global_metrics() {
        metrics.decode_errors_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_unknown_message_types() {
    if let Some(metrics) = global_metrics() {
        metrics.unknown_message_types_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_send_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.send_failures_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn room_created() {
    if let Some(metrics) = global_metrics() {
        metrics.rooms_created_total.fetch_add(1, Ordering::SeqCst);
        metrics.live_rooms.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn room_released() {
    if let Some(metrics) = global_metrics() {
        metrics.rooms_released_total.fetch_add(1, Ordering::SeqCst);
        metrics.live_rooms.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_opened_total.fetch_add(1, Ordering::SeqCst);
        metrics.live_connections.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_closed_total.fetch_add(1, Ordering::SeqCst);
        metrics.live_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_frame_received(&self, frame_type: &str) {
        let mut guard = self.frames_received_total.lock().expect("metrics map lock poisoned");
        let label = normalize_frame_type(frame_type);
        let value = guard.entry(label).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_frames_received_total Inbound websocket frames by type.\n");
        output.push_str("# TYPE relay_frames_received_total counter\n");
        append_frame_type_lines(&mut output, &self.frames_received_total);

        let counters: [(&str, &str, &AtomicU64); 8] = [
            (
                "relay_frames_relayed_total",
                "Frames delivered to room members by broadcast.",
                &self.frames_relayed_total,
            ),
            (
                "relay_decode_errors_total",
                "Inbound frames dropped because they failed to decode or apply.",
                &self.decode_errors_total,
            ),
            (
                "relay_unknown_message_types_total",
                "Inbound frames ignored because of an unknown message type.",
                &self.unknown_message_types_total,
            ),
            (
                "relay_send_failures_total",
                "Outbound writes that failed and closed their connection.",
                &self.send_failures_total,
            ),
            ("relay_rooms_created_total", "Rooms created on first join.", &self.rooms_created_total),
            (
                "relay_rooms_released_total",
                "Rooms released after their last connection left.",
                &self.rooms_released_total,
            ),
            (
                "relay_connections_opened_total",
                "Websocket connections attached to a room.",
                &self.connections_opened_total,
            ),
            (
                "relay_connections_closed_total",
                "Websocket connections torn down.",
                &self.connections_closed_total,
            ),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {}\n", counter.load(Ordering::SeqCst)));
        }

        output.push_str("# HELP relay_live_rooms Rooms currently held in the registry.\n");
        output.push_str("# TYPE relay_live_rooms gauge\n");
        output.push_str(&format!("relay_live_rooms {}\n", self.live_rooms.load(Ordering::SeqCst)));

        output.push_str("# HELP relay_live_connections Connections currently attached to rooms.\n");
        output.push_str("# TYPE relay_live_connections gauge\n");
        output.push_str(&format!(
            "relay_live_connections {}\n",
            self.live_connections.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    // Room names are unbounded; collapse them so label cardinality stays fixed.
    let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    match segments.as_slice() {
        [] => "/".to_string(),
        ["v1", "rooms", _, ..] => "/v1/rooms/{room}".to_string(),
        ["healthz"] | ["metrics"] | ["v1", "relay"] | ["v1", "rooms"] => format!("/{}", segments.join("/")),
        _ => "/{room}".to_string(),
    }
}

fn normalize_frame_type(frame_type: &str) -> String {
    let normalized = frame_type.trim().to_ascii_lowercase();
    if FRAME_TYPES.contains(&normalized.as_str()) {
        normalized
    } else {
        "unknown".to_string()
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_frame_type_lines(output: &mut String, map: &Mutex<HashMap<String, u64>>) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (frame_type, value) in entries {
        output.push_str(&format!(
            "relay_frames_received_total{{type=\"{}\"}} {value}\n",
            escape_label_value(frame_type),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
