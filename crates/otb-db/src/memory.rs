use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use otb_schemas::{NewOrder, NewProductionLog, Order, OrderStatus, ProductionLog};
use tokio::sync::Mutex;

use crate::OrderStore;

#[derive(Default)]
struct Inner {
    orders: BTreeMap<i64, Order>,
    logs: Vec<ProductionLog>,
    last_order_id: i64,
    last_log_id: i64,
}

/// In-memory [`OrderStore`]. Ids start at 1, like a fresh `bigserial`.
#[derive(Default)]
pub struct MemoryOrderStore {
    inner: Mutex<Inner>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn create(&self, order: NewOrder) -> Result<Order> {
        let mut inner = self.inner.lock().await;
        inner.last_order_id += 1;
        let row = Order {
            id: inner.last_order_id,
            item: order.item,
            quantity: order.quantity,
            created_at: Utc::now(),
            status: OrderStatus::New,
            last_error: None,
        };
        inner.orders.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list(&self) -> Result<Vec<Order>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Order> = inner.orders.values().cloned().collect();
        out.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(out)
    }

    async fn next_pending(&self) -> Result<Option<Order>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::New)
            .min_by_key(|o| (o.created_at, o.id))
            .cloned())
    }

    async fn get(&self, id: i64) -> Result<Option<Order>> {
        Ok(self.inner.lock().await.orders.get(&id).cloned())
    }

    async fn update(&self, order: &Order) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if order.status == OrderStatus::InProgress {
            if let Some(other) = inner
                .orders
                .values()
                .find(|o| o.status == OrderStatus::InProgress && o.id != order.id)
            {
                bail!(
                    "update order {} refused: order {} is already IN_PROGRESS",
                    order.id,
                    other.id
                );
            }
        }
        let Some(row) = inner.orders.get_mut(&order.id) else {
            bail!("update order {} failed: no such order", order.id);
        };
        if !order.status.predecessors().contains(&row.status) {
            bail!(
                "update order {} refused: stored status {} cannot move to {}",
                order.id,
                row.status,
                order.status
            );
        }
        row.status = order.status;
        row.last_error = order.last_error.clone();
        Ok(())
    }

    async fn append_production_log(&self, log: NewProductionLog) -> Result<ProductionLog> {
        let mut inner = self.inner.lock().await;
        if !inner.orders.contains_key(&log.order_id) {
            bail!("append_production_log failed: no order {}", log.order_id);
        }
        inner.last_log_id += 1;
        let row = ProductionLog {
            id: inner.last_log_id,
            order_id: log.order_id,
            timestamp: log.timestamp,
            produced_count: log.produced_count,
            message: log.message,
        };
        inner.logs.push(row.clone());
        Ok(row)
    }

    async fn production_logs(&self, order_id: i64) -> Result<Vec<ProductionLog>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .iter()
            .filter(|l| l.order_id == order_id)
            .cloned()
            .collect())
    }
}
