//! Command implementations. `main.rs` only parses arguments.

pub mod device;
pub mod orders;

use anyhow::{bail, Result};
use otb_config::secrets::resolve_database_url;
use otb_config::{
    load_or_default, report_unused_keys, ConfigRole, OtbConfig, StoreConfig, StoreKind,
    UnusedKeyPolicy,
};
use otb_db::PgOrderStore;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Layered config for `role`; built-in defaults when `paths` is empty.
pub fn load_config(role: ConfigRole, paths: &[String]) -> Result<OtbConfig> {
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = load_or_default(&refs)?;
    let report = report_unused_keys(role, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        tracing::warn!(
            role = role.as_str(),
            keys = ?report.unused_leaf_pointers,
            "config keys unused by this command"
        );
    }
    loaded.typed()
}

/// Order commands need a store that outlives the process.
pub async fn open_store(cfg: &StoreConfig) -> Result<PgOrderStore> {
    if cfg.kind == StoreKind::Memory {
        bail!("order commands need a persistent store; set store.kind to postgres");
    }
    let url = resolve_database_url(cfg)?;
    let pool = otb_db::connect(url.as_str()).await?;
    otb_db::migrate(&pool).await?;
    Ok(PgOrderStore::new(pool))
}
