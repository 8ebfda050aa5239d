use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use otb_schemas::{NewOrder, NewProductionLog, Order, OrderStatus, ProductionLog};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::OrderStore;

pub const ENV_DB_URL: &str = "OTB_DATABASE_URL";

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Connect using `OTB_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_orders_table: bool,
}

/// Connectivity and schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'orders'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_orders_table: exists,
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const ORDER_COLUMNS: &str = "id, item, quantity, created_at, status, last_error";

fn order_from_row(row: &PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: row.try_get("id")?,
        item: row.try_get("item")?,
        quantity: row.try_get("quantity")?,
        created_at: row.try_get("created_at")?,
        status: OrderStatus::parse(&status).map_err(|e| anyhow!(e))?,
        last_error: row.try_get("last_error")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<ProductionLog> {
    Ok(ProductionLog {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        timestamp: row.try_get("ts_utc")?,
        produced_count: row.try_get("produced_count")?,
        message: row.try_get("message")?,
    })
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create(&self, order: NewOrder) -> Result<Order> {
        let row = sqlx::query(&format!(
            "insert into orders (item, quantity) values ($1, $2) returning {ORDER_COLUMNS}"
        ))
        .bind(&order.item)
        .bind(order.quantity)
        .fetch_one(&self.pool)
        .await
        .context("create order failed")?;
        order_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "select {ORDER_COLUMNS} from orders order by created_at desc, id desc"
        ))
        .fetch_all(&self.pool)
        .await
        .context("list orders failed")?;
        rows.iter().map(order_from_row).collect()
    }

    async fn next_pending(&self) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "select {ORDER_COLUMNS} from orders where status = 'NEW' \
             order by created_at asc, id asc limit 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .context("next_pending failed")?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn get(&self, id: i64) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("select {ORDER_COLUMNS} from orders where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get order failed")?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn update(&self, order: &Order) -> Result<()> {
        let from: Vec<&str> = order
            .status
            .predecessors()
            .iter()
            .map(OrderStatus::as_str)
            .collect();
        let res = sqlx::query(
            "update orders set status = $2, last_error = $3 where id = $1 and status = any($4)",
        )
        .bind(order.id)
        .bind(order.status.as_str())
        .bind(&order.last_error)
        .bind(&from)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update order {} failed", order.id))?;
        if res.rows_affected() != 1 {
            bail!(
                "update order {} refused: no such order, or its status cannot move to {}",
                order.id,
                order.status
            );
        }
        Ok(())
    }

    async fn append_production_log(&self, log: NewProductionLog) -> Result<ProductionLog> {
        let row = sqlx::query(
            r#"
            insert into production_logs (order_id, ts_utc, produced_count, message)
            values ($1, $2, $3, $4)
            returning id, order_id, ts_utc, produced_count, message
            "#,
        )
        .bind(log.order_id)
        .bind(log.timestamp)
        .bind(log.produced_count)
        .bind(&log.message)
        .fetch_one(&self.pool)
        .await
        .context("append_production_log failed")?;
        log_from_row(&row)
    }

    async fn production_logs(&self, order_id: i64) -> Result<Vec<ProductionLog>> {
        let rows = sqlx::query(
            r#"
            select id, order_id, ts_utc, produced_count, message
            from production_logs
            where order_id = $1
            order by id asc
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .context("production_logs failed")?;
        rows.iter().map(log_from_row).collect()
    }
}
