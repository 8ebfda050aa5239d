//! otb-db
//!
//! Order persistence.
//!
//! [`OrderStore`] is the only interface the bridge, daemon and CLI use. Two
//! implementations:
//!
//! - [`PgOrderStore`]: Postgres via sqlx, embedded migrations.
//! - [`MemoryOrderStore`]: process-local, for tests and `store.kind: memory`.
//!
//! # Invariants
//!
//! - `next_pending` returns the oldest `NEW` order by `(created_at, id)`.
//! - `list` is newest first.
//! - At most one order is `IN_PROGRESS`. An `update` that would create a
//!   second one fails and changes nothing.
//! - `update` only applies legal lifecycle edges from the stored status.
//! - Production logs are append-only.

use anyhow::Result;
use async_trait::async_trait;
use otb_schemas::{NewOrder, NewProductionLog, Order, ProductionLog};

mod memory;
mod pg;

pub use memory::MemoryOrderStore;
pub use pg::{connect, connect_from_env, migrate, status, DbStatus, PgOrderStore, ENV_DB_URL};

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a `NEW` order stamped with the current time.
    async fn create(&self, order: NewOrder) -> Result<Order>;

    /// All orders, newest first.
    async fn list(&self) -> Result<Vec<Order>>;

    /// Oldest `NEW` order, if any.
    async fn next_pending(&self) -> Result<Option<Order>>;

    async fn get(&self, id: i64) -> Result<Option<Order>>;

    /// Persist `status` and `last_error` of an existing order.
    ///
    /// Compare-and-set: refused unless the stored status is one of
    /// `order.status.predecessors()`, so two holders of the same order
    /// cannot both claim or both finish it.
    async fn update(&self, order: &Order) -> Result<()>;

    async fn append_production_log(&self, log: NewProductionLog) -> Result<ProductionLog>;

    /// Rows for one order in insertion order.
    async fn production_logs(&self, order_id: i64) -> Result<Vec<ProductionLog>>;
}
