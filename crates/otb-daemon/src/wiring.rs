//! Startup wiring: config sections to runtime objects.

use std::sync::Arc;

use anyhow::{Context, Result};
use otb_bridge::BridgeSettings;
use otb_config::secrets::{resolve_auth_key, resolve_database_url, AuthKey, KeySource};
use otb_config::{
    load_or_default, report_unused_keys, BridgeConfig, ConfigRole, LoadedConfig, OtbConfig,
    StoreConfig, StoreKind, UnusedKeyPolicy,
};
use otb_db::{MemoryOrderStore, OrderStore, PgOrderStore};
use tracing::{info, warn};

/// Env var listing config layers, comma separated, lowest precedence first.
pub const ENV_CONFIG_PATHS: &str = "OTB_CONFIG";

/// Layer paths from [`ENV_CONFIG_PATHS`]; empty when unset.
pub fn config_paths_from_env() -> Vec<String> {
    std::env::var(ENV_CONFIG_PATHS)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Load, hash and type the config. Keys the daemon never reads are logged.
pub fn load_config(paths: &[String]) -> Result<(LoadedConfig, OtbConfig)> {
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = load_or_default(&refs)?;
    let report = report_unused_keys(ConfigRole::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        warn!(keys = ?report.unused_leaf_pointers, "config keys unused by the daemon");
    }
    let typed = loaded.typed()?;
    info!(config_hash = %loaded.config_hash, layers = paths.len(), "config loaded");
    Ok((loaded, typed))
}

/// Resolve the device key, warning when the built-in default is in use.
pub fn auth_key(cfg: &OtbConfig) -> Result<AuthKey> {
    let key = resolve_auth_key(&cfg.auth)?;
    if key.source() == KeySource::Default {
        warn!(
            env = %cfg.auth.key_env,
            "device key env var not set; using the built-in default key"
        );
    }
    Ok(key)
}

pub fn bridge_settings(cfg: &BridgeConfig, key: &AuthKey) -> BridgeSettings {
    BridgeSettings {
        key: key.value(),
        addressing: cfg.addressing,
        idle_interval: cfg.idle_interval(),
        poll_interval: cfg.poll_interval(),
        stall_timeout: cfg.stall_timeout(),
        failure_backoff: cfg.failure_backoff(),
    }
}

/// Open the configured order store. Postgres is migrated on open.
pub async fn open_store(cfg: &StoreConfig) -> Result<Arc<dyn OrderStore>> {
    match cfg.kind {
        StoreKind::Memory => {
            warn!("using the in-memory order store; orders are lost on exit");
            Ok(Arc::new(MemoryOrderStore::new()))
        }
        StoreKind::Postgres => {
            let url = resolve_database_url(cfg)?;
            let pool = otb_db::connect(url.as_str()).await?;
            otb_db::migrate(&pool).await.context("order store migration failed")?;
            Ok(Arc::new(PgOrderStore::new(pool)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_settings_follow_config() {
        let cfg = BridgeConfig {
            poll_interval_ms: 250,
            stall_timeout_ms: 5_000,
            ..BridgeConfig::default()
        };
        let s = bridge_settings(&cfg, &AuthKey::new(0x1234));
        assert_eq!(s.key, 0x1234);
        assert_eq!(s.poll_interval, std::time::Duration::from_millis(250));
        assert_eq!(s.stall_timeout, std::time::Duration::from_secs(5));
        assert_eq!(s.idle_interval, std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn memory_store_opens_without_env() {
        let cfg = StoreConfig {
            kind: StoreKind::Memory,
            ..StoreConfig::default()
        };
        let store = open_store(&cfg).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
