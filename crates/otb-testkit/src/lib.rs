//! otb-testkit
//!
//! In-process plant: a [`DeviceController`] on its own surface, a
//! [`BridgeDispatcher`] reaching it through a [`LocalConnector`], and a
//! [`MemoryOrderStore`]. Scenario tests under `tests/` drive it under paused
//! tokio time.
//!
//! ```text
//!  MemoryOrderStore ◄── BridgeDispatcher ──LocalLink──► ControlSurface
//!                                                          │ SurfaceEvent
//!                                                          ▼
//!                                                   DeviceController
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use otb_bridge::{BridgeDispatcher, BridgeSettings};
use otb_db::{MemoryOrderStore, OrderStore};
use otb_device::{DeviceController, DeviceSettings, ExecutorState};
use otb_link::{Connector, DeviceTransport, LocalConnector, LocalLink};
use otb_schemas::{NewOrder, NewProductionLog, Order, OrderStatus, ProductionLog};
use otb_surface::map::COIL_START;
use otb_surface::{AddressingMode, ControlSurface, StartTransaction};
use tokio::sync::{mpsc, watch, Mutex};

pub const KEY: i16 = 0xBEEFu16 as i16;

/// Knobs for one plant.
#[derive(Debug, Clone, Copy)]
pub struct PlantConfig {
    pub bridge_key: i16,
    pub device_key: i16,
    pub addressing: AddressingMode,
    pub tick: Duration,
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            bridge_key: KEY,
            device_key: KEY,
            addressing: AddressingMode::Explicit,
            tick: Duration::from_secs(1),
            // Off the tick grid: a poll never coincides with a unit.
            poll_interval: Duration::from_millis(350),
            stall_timeout: Duration::from_secs(20),
        }
    }
}

/// A device plus everything needed to reach it.
pub struct Device {
    pub surface: Arc<ControlSurface>,
    pub connector: LocalConnector,
    pub state: watch::Receiver<ExecutorState>,
}

impl Device {
    pub fn spawn(key: i16, tick: Duration, addressing: AddressingMode) -> Self {
        let surface = Arc::new(ControlSurface::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = DeviceController::new(
            Arc::clone(&surface),
            DeviceSettings {
                key,
                tick,
                addressing,
                replay_window: 1,
            },
        );
        let state = controller.subscribe_state();
        tokio::spawn(controller.run(rx));
        Self {
            connector: LocalConnector::new(Arc::clone(&surface), tx),
            surface,
            state,
        }
    }

    /// A connected link, as a second client on the device would have.
    pub async fn client(&self) -> Result<LocalLink> {
        let mut link = self.connector.link();
        link.connect().await?;
        Ok(link)
    }
}

/// Write a start transaction the way the bridge does, registers first.
pub async fn raw_start(
    link: &mut LocalLink,
    order_id: i64,
    quantity: i32,
    key: i16,
    nonce: i16,
) -> Result<()> {
    let tx = StartTransaction::new(order_id, quantity, key, nonce)?;
    for (address, value) in tx.register_writes() {
        link.write_register(address, value).await?;
    }
    link.write_coil(COIL_START, true).await?;
    Ok(())
}

pub struct Plant {
    pub device: Device,
    pub store: Arc<MemoryOrderStore>,
    pub settings: BridgeSettings,
}

impl Plant {
    pub fn new(cfg: PlantConfig) -> Self {
        let device = Device::spawn(cfg.device_key, cfg.tick, cfg.addressing);
        let settings = BridgeSettings {
            key: cfg.bridge_key,
            addressing: cfg.addressing,
            poll_interval: cfg.poll_interval,
            stall_timeout: cfg.stall_timeout,
            ..BridgeSettings::default()
        };
        Self {
            device,
            store: Arc::new(MemoryOrderStore::new()),
            settings,
        }
    }

    /// A fresh dispatcher on this plant's store and device.
    pub fn dispatcher(&self) -> BridgeDispatcher<LocalConnector> {
        BridgeDispatcher::new(
            self.settings,
            self.store.clone(),
            self.device.connector.clone(),
        )
    }

    /// Create an order without order-entry validation, so edge quantities
    /// can reach the bridge.
    pub async fn order(&self, item: &str, quantity: i32) -> Result<Order> {
        self.store
            .create(NewOrder {
                item: item.to_string(),
                quantity,
            })
            .await
    }

    pub async fn status(&self, id: i64) -> Result<OrderStatus> {
        self.store
            .get(id)
            .await?
            .map(|o| o.status)
            .ok_or_else(|| anyhow!("order {id} not found"))
    }

    pub async fn produced_counts(&self, id: i64) -> Result<Vec<i32>> {
        Ok(self
            .store
            .production_logs(id)
            .await?
            .iter()
            .map(|l| l.produced_count)
            .collect())
    }
}

/// Records every status an order is seen in, sampling every `every`.
///
/// Used to check the lifecycle from outside the dispatcher.
pub fn watch_statuses(
    store: Arc<MemoryOrderStore>,
    every: Duration,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<Vec<Vec<Order>>>) {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut samples = Vec::new();
        loop {
            if let Ok(orders) = store.list().await {
                samples.push(orders);
            }
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                _ = stop_rx.changed() => break,
            }
        }
        samples
    });
    (stop_tx, handle)
}

/// [`OrderStore`] wrapper that records every accepted status write.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryOrderStore,
    updates: Mutex<Vec<(i64, OrderStatus)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses persisted for `order_id`, in write order.
    pub async fn history(&self, order_id: i64) -> Vec<OrderStatus> {
        self.updates
            .lock()
            .await
            .iter()
            .filter(|(id, _)| *id == order_id)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl OrderStore for RecordingStore {
    async fn create(&self, order: NewOrder) -> Result<Order> {
        self.inner.create(order).await
    }

    async fn list(&self) -> Result<Vec<Order>> {
        self.inner.list().await
    }

    async fn next_pending(&self) -> Result<Option<Order>> {
        self.inner.next_pending().await
    }

    async fn get(&self, id: i64) -> Result<Option<Order>> {
        self.inner.get(id).await
    }

    async fn update(&self, order: &Order) -> Result<()> {
        self.inner.update(order).await?;
        self.updates.lock().await.push((order.id, order.status));
        Ok(())
    }

    async fn append_production_log(&self, log: NewProductionLog) -> Result<ProductionLog> {
        self.inner.append_production_log(log).await
    }

    async fn production_logs(&self, order_id: i64) -> Result<Vec<ProductionLog>> {
        self.inner.production_logs(order_id).await
    }
}
