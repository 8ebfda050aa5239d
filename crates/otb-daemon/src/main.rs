//! otb-daemon entry point.
//!
//! Sets up tracing and config, opens the order store, starts the bridge
//! dispatcher against the device over Modbus/TCP and serves the HTTP API.
//! Handlers live in `routes.rs`, shared state in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use otb_bridge::{BridgeDispatcher, BridgeEvent};
use otb_daemon::{routes, state, wiring};
use otb_link::TcpConnector;
use tokio::sync::{broadcast, watch};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let (loaded, cfg) = wiring::load_config(&wiring::config_paths_from_env())?;
    let key = wiring::auth_key(&cfg)?;
    let store = wiring::open_store(&cfg.store).await?;

    let connector = TcpConnector::new(cfg.bridge.device_addr(), cfg.bridge.request_timeout());
    let (events_tx, events_rx) = broadcast::channel::<BridgeEvent>(256);
    let dispatcher = BridgeDispatcher::new(
        wiring::bridge_settings(&cfg.bridge, &key),
        Arc::clone(&store),
        connector,
    )
    .with_events(events_tx);

    let shared = Arc::new(state::AppState::new(store, dispatcher.status_handle()));
    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_event_relay(shared.bus.clone(), events_rx);

    let (stop_tx, stop_rx) = watch::channel(false);
    let bridge_task = tokio::spawn(dispatcher.run(stop_rx));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr: SocketAddr = cfg
        .daemon
        .bind
        .parse()
        .with_context(|| format!("invalid daemon.bind '{}'", cfg.daemon.bind))?;
    info!(
        device = %cfg.bridge.device_addr(),
        listen = %addr,
        config_hash = %loaded.config_hash,
        "otb-daemon started"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr} failed"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(stop_tx))
        .await
        .context("server crashed")?;

    bridge_task.await.context("bridge task panicked")?;
    info!("otb-daemon stopped");
    Ok(())
}

/// Resolves on ctrl-c and tells the dispatcher to stop.
async fn shutdown_signal(stop: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "ctrl-c handler failed; shutting down");
    }
    info!("shutdown requested");
    let _ = stop.send(true);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
