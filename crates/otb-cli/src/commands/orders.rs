use anyhow::{anyhow, Context, Result};
use otb_config::ConfigRole;
use otb_db::OrderStore;
use otb_schemas::{NewOrder, Order, ProductionLog};

use super::{load_config, open_store};

pub async fn create(config_paths: &[String], item: &str, qty: i32) -> Result<()> {
    // Validate before touching the store.
    let new = NewOrder::new(item, qty).map_err(|e| anyhow!("invalid order: {e}"))?;
    let cfg = load_config(ConfigRole::Cli, config_paths)?;
    let store = open_store(&cfg.store).await?;
    let order = store.create(new).await?;
    println!("created {}", format_order_line(&order));
    Ok(())
}

pub async fn list(config_paths: &[String], json: bool) -> Result<()> {
    let cfg = load_config(ConfigRole::Cli, config_paths)?;
    let store = open_store(&cfg.store).await?;
    let orders = store.list().await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&orders).context("serialize orders failed")?
        );
        return Ok(());
    }
    if orders.is_empty() {
        println!("no orders");
    }
    for o in &orders {
        println!("{}", format_order_line(o));
    }
    Ok(())
}

pub async fn logs(config_paths: &[String], id: i64) -> Result<()> {
    let cfg = load_config(ConfigRole::Cli, config_paths)?;
    let store = open_store(&cfg.store).await?;
    let order = store
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("order {id} not found"))?;
    println!("{}", format_order_line(&order));
    if let Some(err) = &order.last_error {
        println!("  last_error={err}");
    }
    for row in store.production_logs(id).await? {
        println!("  {}", format_log_line(&row));
    }
    Ok(())
}

/// `#id item xqty [STATUS] yyyy-mm-dd HH:MM`
pub fn format_order_line(o: &Order) -> String {
    format!(
        "#{} {} x{} [{}] {}",
        o.id,
        o.item,
        o.quantity,
        o.status.as_str(),
        o.created_at.format("%Y-%m-%d %H:%M")
    )
}

fn format_log_line(l: &ProductionLog) -> String {
    format!(
        "{} produced={} {}",
        l.timestamp.format("%Y-%m-%d %H:%M:%S"),
        l.produced_count,
        l.message.as_deref().unwrap_or("")
    )
    .trim_end()
    .to_string()
}
