//! `otb device run`: the simulated device behind a Modbus/TCP listener.

use std::sync::Arc;

use anyhow::{Context, Result};
use otb_config::secrets::{resolve_auth_key, KeySource};
use otb_config::ConfigRole;
use otb_device::{DeviceController, DeviceSettings};
use otb_surface::ControlSurface;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::load_config;

pub async fn run(config_paths: &[String], bind: Option<String>) -> Result<()> {
    let cfg = load_config(ConfigRole::Device, config_paths)?;
    let key = resolve_auth_key(&cfg.auth)?;
    if key.source() == KeySource::Default {
        warn!(env = %cfg.auth.key_env, "device key env var not set; using the built-in default key");
    }

    let bind = bind.unwrap_or_else(|| cfg.device.bind.clone());
    let listener = TcpListener::bind(bind.as_str())
        .await
        .with_context(|| format!("bind {bind} failed"))?;

    let surface = Arc::new(ControlSurface::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let controller = DeviceController::new(
        Arc::clone(&surface),
        DeviceSettings {
            key: key.value(),
            tick: cfg.device.tick(),
            addressing: cfg.device.addressing,
            replay_window: cfg.device.replay_window,
        },
    );
    let controller_task = tokio::spawn(controller.run(events_rx));

    info!(
        bind = %bind,
        addressing = ?cfg.device.addressing,
        tick_ms = cfg.device.tick_ms,
        "device simulator started"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler failed; shutting down");
        }
        let _ = stop_tx.send(true);
    });

    otb_link::server::serve(listener, surface, events_tx, stop_rx)
        .await
        .context("modbus server failed")?;
    // The controller exits once every connection has dropped its sender.
    controller_task.await.context("device controller panicked")?;
    info!("device simulator stopped");
    Ok(())
}
