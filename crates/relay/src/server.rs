use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::{error, info};

use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode, RelayError,
};
use crate::{api, metrics, ws};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// HTTP routes plus the room fallback. WebSocket upgrades always go to a
/// room, so room names may shadow HTTP paths such as `/healthz`.
pub fn build_router(state: ws::RelayState) -> Router {
    let rooms = Router::new().fallback(ws::ws_upgrade).with_state(state.clone());

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_text))
            .merge(api::router())
            .fallback(ws::ws_upgrade)
            .with_state(state)
            .layer(middleware::from_fn_with_state(rooms, dispatch_upgrades)),
    )
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server exited unexpectedly")
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_text() -> Response {
    match metrics::global_metrics() {
        Some(metrics) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.render_prometheus(),
        )
            .into_response(),
        None => RelayError::new(ErrorCode::InternalError, "metrics are not initialised")
            .into_response(),
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(?error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(?error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn dispatch_upgrades(
    State(rooms): State<Router>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !is_websocket_upgrade(request.headers()) {
        return next.run(request).await;
    }

    match rooms.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"))
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, MAX_REQUEST_BODY_BYTES};
    use crate::config::RelayConfig;
    use crate::metrics::{set_global_metrics, RelayMetrics};
    use crate::replica::testing::memory_factory;
    use crate::room::RoomRegistry;
    use crate::ws::RelayState;

    fn test_router() -> Router {
        let registry = RoomRegistry::new(memory_factory());
        build_router(RelayState::new(registry, &RelayConfig::default()))
    }

    async fn send(app: Router, request: Request<Body>) -> axum::response::Response {
        app.oneshot(request).await.expect("request should return a response")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let response = send(test_router(), get_request("/healthz")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn client_request_id_is_echoed() {
        let request = Request::builder()
            .uri("/healthz")
            .header("x-request-id", "req-abc")
            .body(Body::empty())
            .expect("request should build");

        let response = send(test_router(), request).await;

        assert_eq!(response.headers()["x-request-id"], "req-abc");
    }

    #[tokio::test]
    async fn plain_request_to_room_path_requires_upgrade() {
        let response = send(test_router(), get_request("/r1")).await;

        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should be readable");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(parsed["error"]["code"], "UPGRADE_REQUIRED");
    }

    #[tokio::test]
    async fn upgrade_request_to_http_path_is_routed_to_a_room() {
        let request = Request::builder()
            .uri("/healthz")
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .expect("request should build");

        // The room handler answers; without a live connection the upgrade
        // itself cannot complete.
        let response = send(test_router(), request).await;
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        assert!(response.headers().contains_key("x-request-id"));

        let plain = send(test_router(), get_request("/healthz")).await;
        assert_eq!(plain.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        set_global_metrics(Arc::new(RelayMetrics::default()));

        let response = send(test_router(), get_request("/metrics")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .expect("content type should be ascii")
            .starts_with("text/plain"));
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should be readable");
        let text = String::from_utf8(body.to_vec()).expect("metrics should be utf-8");
        assert!(text.contains("relay_frames_relayed_total"));
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));
        let response = send(app, get_request("/panic")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let oversized_body = "a".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let app = apply_middleware(Router::new().route("/echo", post(echo)));

        let response = send(
            app,
            Request::builder()
                .method(Method::POST)
                .uri("/echo")
                .header("content-type", "text/plain")
                .body(Body::from(oversized_body))
                .expect("echo request should build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
