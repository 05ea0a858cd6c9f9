//! # Gateway Entry Point
//!
//! Boots one tunnox node: logging, config, component wiring, the native
//! listeners, the cluster bridge, and finally the HTTP surface (HLP
//! endpoints, WebSocket upgrade, agents listing).

use tracing::info;

use tunnox_server::config::GatewayConfig;
use tunnox_server::state::AppState;
use tunnox_server::transport;

#[tokio::main]
async fn main() {
    // Structured logging with env-filter support. Default level is
    // `info` for this crate; override with `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnox_server=info".into()),
        )
        .init();

    // Optional JSON config file as the first argument; env overrides on
    // top, defaults underneath.
    let config_path = std::env::args().nth(1);
    let config = match GatewayConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    info!(node_id = %config.node_id, "starting tunnox node");

    let state = AppState::build(config);

    // Fragment-TTL and idle-connection sweeps.
    state.spawn_maintenance();

    // Native TCP / QUIC intake.
    if let Err(e) = transport::spawn_native_listeners(&state).await {
        eprintln!("transport startup failed: {e}");
        std::process::exit(1);
    }

    // Cluster listener, broker subscriptions, pool health loop.
    if let Err(e) = state.cluster.start().await {
        eprintln!("cluster startup failed: {e}");
        std::process::exit(1);
    }

    // HTTP surface: HLP push/poll, WebSocket transport, agents listing.
    let app = state.router();
    let addr = state.config.http_listen.clone();
    info!(addr = %addr, "tunnox gateway listening");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
