// gridsync-relay: standalone relay server entry point.

use std::sync::Arc;

use anyhow::Context;
use gridsync_relay::{
    config::{LogFormat, RelayConfig},
    metrics::{set_global_metrics, RelayMetrics},
    replica::yrs_factory,
    room::RoomRegistry,
    server,
    ws::RelayState,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);
    install_panic_hook();
    set_global_metrics(Arc::new(RelayMetrics::default()));

    let state = RelayState::new(RoomRegistry::new(yrs_factory()), &config);
    let app = server::build_router(state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        ws_url = %config.ws_url,
        default_room = %config.default_room,
        "starting relay server"
    );

    server::serve(listener, app, server::shutdown_signal()).await?;
    info!("relay server stopped");
    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Log panics through tracing. A panicking connection task only ends that task.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!(location = ?panic_info.location(), payload = %panic_message(panic_info), "panic");
        default_hook(panic_info);
    }));
}

fn panic_message(panic_info: &std::panic::PanicHookInfo<'_>) -> String {
    if let Some(message) = panic_info.payload().downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic_info.payload().downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
