//! The bridge loop.
//!
//! # Invariants
//!
//! - An order only moves `NEW → IN_PROGRESS → {COMPLETED, FAILED}`; every
//!   move goes through [`Order::advance`] and is persisted before the next
//!   device request.
//! - A connection failure before the start transaction leaves the order
//!   `NEW`.
//! - Progress and completion are accepted only while the device echoes this
//!   transaction's order id and nonce in `input[2..4]`, in both addressing
//!   modes. The echo is read before the counters, so a value left over from
//!   an earlier job or an earlier attempt at the same order is never taken.
//! - An abort names its transaction's nonce in `holding[14]`; a job started
//!   by anyone else is left alone.
//! - Production log rows per order are strictly increasing in count.
//! - The link is disconnected on every path out of an iteration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use otb_db::OrderStore;
use otb_link::{Connector, DeviceTransport, TransportError};
use otb_schemas::{NewProductionLog, Order, OrderStatus};
use otb_surface::map::{
    COIL_ABORT, COIL_START, DI_DONE, HR_ABORT_NONCE, HR_PRESENCE, IR_ACTIVE_ORDER, IR_PRODUCED,
};
use otb_surface::{AddressingMode, RangeError, StartTransaction};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    BridgeEvent, DispatchError, DispatchPhase, DispatcherStatus, JobOutcome, NonceSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub key: i16,
    pub addressing: AddressingMode,
    pub idle_interval: Duration,
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
    pub failure_backoff: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            key: 0xBEEFu16 as i16,
            addressing: AddressingMode::Explicit,
            idle_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(20),
            failure_backoff: Duration::from_secs(1),
        }
    }
}

/// What one call to [`BridgeDispatcher::tick`] did.
#[derive(Debug)]
pub enum Iteration {
    /// No pending order.
    Idle,
    Dispatched(JobOutcome),
    /// Something failed; the caller should back off before the next tick.
    Failed(DispatchError),
}

pub struct BridgeDispatcher<C: Connector> {
    settings: BridgeSettings,
    store: Arc<dyn OrderStore>,
    connector: C,
    nonces: NonceSource,
    status: Arc<RwLock<DispatcherStatus>>,
    events: Option<broadcast::Sender<BridgeEvent>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<C: Connector> BridgeDispatcher<C> {
    pub fn new(settings: BridgeSettings, store: Arc<dyn OrderStore>, connector: C) -> Self {
        let status = DispatcherStatus::new(connector.endpoint());
        Self {
            settings,
            store,
            connector,
            nonces: NonceSource::new(),
            status: Arc::new(RwLock::new(status)),
            events: None,
            shutdown: None,
        }
    }

    /// Publish lifecycle events on `tx`.
    pub fn with_events(mut self, tx: broadcast::Sender<BridgeEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn status_handle(&self) -> Arc<RwLock<DispatcherStatus>> {
        Arc::clone(&self.status)
    }

    /// Loop until `shutdown` is `true`. A job in flight at shutdown is
    /// aborted on the device and its order marked `FAILED`.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        info!(endpoint = %self.connector.endpoint(), "bridge dispatcher started");
        let mut stop = shutdown.clone();
        self.shutdown = Some(shutdown);

        while !*stop.borrow() {
            let pause = match self.tick().await {
                Iteration::Idle => self.settings.idle_interval,
                Iteration::Dispatched(_) => continue,
                Iteration::Failed(_) => self.settings.failure_backoff,
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.status.write().await.phase = DispatchPhase::Stopped;
        info!("bridge dispatcher stopped");
    }

    /// One loop iteration: pick, dispatch, poll to a terminal state.
    ///
    /// Never returns an error; failures come back as [`Iteration::Failed`]
    /// after they have been logged and the in-flight order settled.
    pub async fn tick(&mut self) -> Iteration {
        let order = match self.store.next_pending().await {
            Ok(Some(o)) => o,
            Ok(None) => {
                self.set_phase(DispatchPhase::Idle, None).await;
                return Iteration::Idle;
            }
            Err(e) => {
                let err = DispatchError::Persistence(e);
                error!(error = %err, "next_pending failed");
                self.record_failure(&err, false).await;
                return Iteration::Failed(err);
            }
        };

        let order_id = order.id;
        self.set_phase(DispatchPhase::Starting, Some(order_id)).await;

        let nonce = self.nonces.next_nonce();
        let tx = match StartTransaction::new(order.id, order.quantity, self.settings.key, nonce) {
            Ok(tx) => tx,
            Err(range) => return self.reject_out_of_range(order, range).await,
        };

        let mut link = self.connector.link();
        if let Err(e) = link.connect().await {
            let err = DispatchError::from(e);
            error!(
                order_id,
                endpoint = %self.connector.endpoint(),
                error = %err,
                "device connection failed; order left NEW"
            );
            self.record_failure(&err, true).await;
            return Iteration::Failed(err);
        }

        let mut in_flight: Option<Order> = None;
        let result = self.dispatch(&mut link, order, tx, &mut in_flight).await;

        let iteration = match result {
            Ok(outcome) => Iteration::Dispatched(outcome),
            Err(err) => {
                error!(order_id, kind = err.kind(), error = %err, "dispatch failed");
                if let Some(order) = in_flight.take() {
                    if link.is_connected() {
                        abort_job(&mut link, order.id, tx.nonce).await;
                    }
                    self.settle_failed(order, &err.to_string()).await;
                }
                self.record_failure(&err, matches!(err, DispatchError::Connection(_)))
                    .await;
                Iteration::Failed(err)
            }
        };

        if let Err(e) = link.disconnect().await {
            debug!(error = %e, "disconnect failed");
        }
        iteration
    }

    async fn dispatch(
        &mut self,
        link: &mut C::Link,
        mut order: Order,
        tx: StartTransaction,
        in_flight: &mut Option<Order>,
    ) -> Result<JobOutcome, DispatchError> {
        for (address, value) in tx.register_writes() {
            if address == HR_PRESENCE && self.settings.addressing == AddressingMode::Legacy {
                continue;
            }
            link.write_register(address, value).await?;
        }
        link.write_coil(COIL_START, true).await?;

        order.advance(OrderStatus::InProgress)?;
        if let Err(e) = self.persist(&order).await {
            // The device may already be running; do not leave it orphaned.
            abort_job(link, order.id, tx.nonce).await;
            return Err(e);
        }
        *in_flight = Some(order.clone());
        info!(
            order_id = order.id,
            item = %order.item,
            quantity = order.quantity,
            nonce = tx.nonce,
            "order dispatched"
        );
        self.emit(BridgeEvent::OrderStarted {
            order_id: order.id,
            quantity: order.quantity,
        });
        self.set_phase(DispatchPhase::Polling, Some(order.id)).await;

        self.poll(link, order, tx, in_flight).await
    }

    /// Id or quantity does not fit a register word. The order still passes
    /// through `IN_PROGRESS` so the status machine never skips a step, but
    /// the device is never contacted.
    async fn reject_out_of_range(&mut self, mut order: Order, range: RangeError) -> Iteration {
        let err = DispatchError::ProtocolRange(range);
        error!(order_id = order.id, error = %err, "order cannot be encoded");
        let claimed = match order.advance(OrderStatus::InProgress) {
            Ok(()) => self.persist(&order).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match claimed {
            Ok(()) => self.settle_failed(order, &err.to_string()).await,
            Err(e) => error!(order_id = order.id, error = %e, "could not claim order"),
        }
        self.record_failure(&err, false).await;
        Iteration::Failed(err)
    }

    async fn poll(
        &mut self,
        link: &mut C::Link,
        mut order: Order,
        tx: StartTransaction,
        in_flight: &mut Option<Order>,
    ) -> Result<JobOutcome, DispatchError> {
        let mut last_count: i32 = 0;
        let mut last_progress = Instant::now();

        loop {
            if let Some(produced) = read_progress(link, &tx).await? {
                if self.record_progress(&order, produced, &mut last_count).await? {
                    last_progress = Instant::now();
                }

                let done = link.read_discrete_inputs(DI_DONE, 1).await?;
                if done.first().copied().unwrap_or(false) {
                    // The last unit can land between the two reads.
                    if let Some(produced) = read_progress(link, &tx).await? {
                        self.record_progress(&order, produced, &mut last_count).await?;
                    }
                    order.advance(OrderStatus::Completed)?;
                    self.persist(&order).await?;
                    *in_flight = None;
                    info!(order_id = order.id, produced = last_count, "order completed");
                    self.finish(&order).await;
                    return Ok(JobOutcome::Completed {
                        order_id: order.id,
                        produced: last_count,
                    });
                }
            }

            if last_progress.elapsed() >= self.settings.stall_timeout {
                let reason = format!(
                    "timeout: no progress for {}s (produced {}/{})",
                    self.settings.stall_timeout.as_secs(),
                    last_count,
                    order.quantity
                );
                abort_job(link, order.id, tx.nonce).await;
                order.fail(reason.clone())?;
                self.persist(&order).await?;
                *in_flight = None;
                warn!(order_id = order.id, %reason, "order timed out");
                self.finish(&order).await;
                return Ok(JobOutcome::TimedOut {
                    order_id: order.id,
                    produced: last_count,
                });
            }

            if self.sleep_or_shutdown(self.settings.poll_interval).await {
                return Err(DispatchError::Shutdown);
            }
        }
    }

    /// Append a log row if `produced` moved forward. Returns whether it did.
    async fn record_progress(
        &self,
        order: &Order,
        produced: i32,
        last_count: &mut i32,
    ) -> Result<bool, DispatchError> {
        if produced < *last_count {
            warn!(
                order_id = order.id,
                produced,
                last_count = *last_count,
                "produced count went backwards; ignored"
            );
            return Ok(false);
        }
        if produced == *last_count {
            return Ok(false);
        }
        self.store
            .append_production_log(NewProductionLog {
                order_id: order.id,
                timestamp: Utc::now(),
                produced_count: produced,
                message: Some(format!("produced {produced}/{}", order.quantity)),
            })
            .await
            .map_err(DispatchError::Persistence)?;
        *last_count = produced;
        debug!(order_id = order.id, produced, "progress");
        self.status.write().await.last_produced = Some(produced);
        self.emit(BridgeEvent::Progress {
            order_id: order.id,
            produced,
        });
        Ok(true)
    }

    /// `true` if shutdown was requested before `d` elapsed.
    async fn sleep_or_shutdown(&mut self, d: Duration) -> bool {
        let Some(rx) = self.shutdown.as_mut() else {
            tokio::time::sleep(d).await;
            return false;
        };
        if *rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => false,
            changed = rx.changed() => changed.is_err() || *rx.borrow(),
        }
    }

    async fn persist(&self, order: &Order) -> Result<(), DispatchError> {
        self.store
            .update(order)
            .await
            .map_err(DispatchError::Persistence)
    }

    /// Best effort: the boundary has already logged the cause.
    async fn settle_failed(&mut self, mut order: Order, reason: &str) {
        if order.status != OrderStatus::InProgress {
            return;
        }
        if let Err(e) = order.fail(reason) {
            error!(order_id = order.id, error = %e, "could not mark order failed");
            return;
        }
        match self.store.update(&order).await {
            Ok(()) => {
                warn!(order_id = order.id, reason, "in-flight order marked FAILED");
                self.finish(&order).await;
            }
            Err(e) => error!(order_id = order.id, error = %e, "could not persist FAILED order"),
        }
    }

    async fn finish(&self, order: &Order) {
        {
            let mut st = self.status.write().await;
            match order.status {
                OrderStatus::Completed => st.completed += 1,
                OrderStatus::Failed => st.failed += 1,
                _ => {}
            }
            st.current_order = None;
        }
        self.emit(BridgeEvent::OrderFinished {
            order_id: order.id,
            status: order.status,
            error: order.last_error.clone(),
        });
    }

    async fn set_phase(&self, phase: DispatchPhase, order_id: Option<i64>) {
        let mut st = self.status.write().await;
        st.phase = phase;
        if order_id != st.current_order {
            st.last_produced = None;
        }
        st.current_order = order_id;
    }

    async fn record_failure(&self, err: &DispatchError, connection: bool) {
        let mut st = self.status.write().await;
        st.phase = DispatchPhase::Backoff;
        st.current_order = None;
        st.last_error = Some(err.to_string());
        if connection {
            st.connection_failures += 1;
        }
    }

    fn emit(&self, event: BridgeEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }
}

/// Produced count, or `None` until the device echoes `tx`.
async fn read_progress<L: DeviceTransport>(
    link: &mut L,
    tx: &StartTransaction,
) -> Result<Option<i32>, DispatchError> {
    let echo = link.read_input_registers(IR_ACTIVE_ORDER, 2).await?;
    let [order_id, nonce] = echo[..] else {
        return Err(TransportError::Protocol(format!(
            "expected 2 input registers, got {}",
            echo.len()
        ))
        .into());
    };
    if order_id != tx.order_id || nonce != tx.nonce {
        return Ok(None);
    }
    let produced = link.read_input_registers(IR_PRODUCED, 1).await?;
    match produced.first() {
        Some(&count) => Ok(Some(i32::from(count))),
        None => Err(TransportError::Protocol("empty input register read".to_string()).into()),
    }
}

/// Ask the device to abort the job started by `nonce`.
async fn abort_job<L: DeviceTransport>(link: &mut L, order_id: i64, nonce: i16) {
    let sent = match link.write_register(HR_ABORT_NONCE, nonce).await {
        Ok(()) => link.write_coil(COIL_ABORT, true).await,
        Err(e) => Err(e),
    };
    match sent {
        Ok(()) => debug!(order_id, nonce, "abort requested on device"),
        Err(e) => warn!(order_id, nonce, error = %e, "abort request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otb_db::MemoryOrderStore;
    use otb_link::LocalConnector;
    use otb_schemas::NewOrder;
    use otb_surface::map::{HR_NONCE, HR_QUANTITY};
    use otb_surface::{ControlSurface, SurfaceEvent};
    use tokio::sync::mpsc;

    struct Rig {
        dispatcher: BridgeDispatcher<LocalConnector>,
        store: Arc<MemoryOrderStore>,
        surface: Arc<ControlSurface>,
        connector: LocalConnector,
        // Keeps the event channel open; no device consumes it here.
        _events: mpsc::UnboundedReceiver<SurfaceEvent>,
    }

    fn rig() -> Rig {
        let surface = Arc::new(ControlSurface::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = LocalConnector::new(Arc::clone(&surface), tx);
        let store = Arc::new(MemoryOrderStore::new());
        let dispatcher =
            BridgeDispatcher::new(BridgeSettings::default(), store.clone(), connector.clone());
        Rig {
            dispatcher,
            store,
            surface,
            connector,
            _events: rx,
        }
    }

    async fn order(store: &MemoryOrderStore, item: &str, quantity: i32) -> Order {
        store
            .create(NewOrder {
                item: item.to_string(),
                quantity,
            })
            .await
            .unwrap()
    }

    async fn status_of(store: &MemoryOrderStore, id: i64) -> Order {
        store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn empty_store_is_idle() {
        let mut r = rig();
        assert!(matches!(r.dispatcher.tick().await, Iteration::Idle));
        assert_eq!(
            r.dispatcher.status_handle().read().await.phase,
            DispatchPhase::Idle
        );
    }

    #[tokio::test]
    async fn unreachable_device_leaves_order_new() {
        let mut r = rig();
        let o = order(&r.store, "WidgetA", 3).await;
        r.connector.set_reachable(false);

        let it = r.dispatcher.tick().await;
        assert!(matches!(it, Iteration::Failed(DispatchError::Connection(_))));
        assert_eq!(status_of(&r.store, o.id).await.status, OrderStatus::New);
        assert!(!r.surface.start_requested());

        let st = r.dispatcher.status_handle().read().await.clone();
        assert_eq!(st.connection_failures, 1);
        assert_eq!(st.phase, DispatchPhase::Backoff);
    }

    #[tokio::test]
    async fn out_of_range_quantity_fails_without_touching_device() {
        let mut r = rig();
        let o = order(&r.store, "Huge", 40_000).await;

        let it = r.dispatcher.tick().await;
        assert!(matches!(
            it,
            Iteration::Failed(DispatchError::ProtocolRange(_))
        ));
        let stored = status_of(&r.store, o.id).await;
        assert_eq!(stored.status, OrderStatus::Failed);
        assert!(stored
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("quantity")));
        assert_eq!(r.surface.holding(HR_QUANTITY), 0);
        assert!(!r.surface.start_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_and_requests_abort() {
        let mut r = rig();
        let o = order(&r.store, "WidgetA", 3).await;
        // A completion flag from some earlier job must not complete this one.
        r.surface.mark_done();

        let started = Instant::now();
        let it = r.dispatcher.tick().await;
        assert!(matches!(
            it,
            Iteration::Dispatched(JobOutcome::TimedOut { produced: 0, .. })
        ));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(20), "{waited:?}");
        assert!(waited <= Duration::from_secs(21), "{waited:?}");

        let stored = status_of(&r.store, o.id).await;
        assert_eq!(stored.status, OrderStatus::Failed);
        assert!(stored.last_error.unwrap().starts_with("timeout"));
        assert!(r.surface.abort_requested());
        assert!(r.store.production_logs(o.id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn echoed_progress_is_logged_and_completes() {
        let mut r = rig();
        let o = order(&r.store, "WidgetA", 2).await;

        // Stand-in device: admit as soon as the start coil is set.
        let surface = Arc::clone(&r.surface);
        let id = o.id as i16;
        tokio::spawn(async move {
            while !surface.start_requested() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            surface.reset_progress();
            surface.set_active_job(id, surface.holding(HR_NONCE));
            for n in 1..=2 {
                tokio::time::sleep(Duration::from_millis(1_500)).await;
                surface.publish_produced(n);
            }
            surface.mark_done();
        });

        let it = r.dispatcher.tick().await;
        assert!(matches!(
            it,
            Iteration::Dispatched(JobOutcome::Completed { produced: 2, .. })
        ));
        assert_eq!(status_of(&r.store, o.id).await.status, OrderStatus::Completed);
        let counts: Vec<i32> = r
            .store
            .production_logs(o.id)
            .await
            .unwrap()
            .iter()
            .map(|l| l.produced_count)
            .collect();
        assert_eq!(counts, vec![1, 2]);
        assert_eq!(r.dispatcher.status_handle().read().await.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_attempt_at_same_order_is_not_read_as_progress() {
        let mut r = rig();
        let o = order(&r.store, "WidgetA", 3).await;
        // Left behind by an aborted attempt at this very order.
        r.dispatcher.nonces = NonceSource::after(1234);
        r.surface.set_active_job(o.id as i16, 1234);
        r.surface.publish_produced(2);
        r.surface.mark_done();

        let it = r.dispatcher.tick().await;
        assert!(matches!(
            it,
            Iteration::Dispatched(JobOutcome::TimedOut { produced: 0, .. })
        ));
        assert!(r.store.production_logs(o.id).await.unwrap().is_empty());
        assert_eq!(
            r.surface.holding(HR_ABORT_NONCE),
            r.surface.holding(HR_NONCE),
            "abort names this attempt's nonce"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_job_fails_the_order() {
        let r = rig();
        let o = order(&r.store, "WidgetA", 3).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (events_tx, mut events) = broadcast::channel(16);
        let dispatcher = r.dispatcher.with_events(events_tx);
        let status = dispatcher.status_handle();

        let handle = tokio::spawn(dispatcher.run(stop_rx));
        tokio::time::sleep(Duration::from_secs(3)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let stored = status_of(&r.store, o.id).await;
        assert_eq!(stored.status, OrderStatus::Failed);
        assert!(r.surface.abort_requested());
        assert_eq!(status.read().await.phase, DispatchPhase::Stopped);

        assert!(matches!(
            events.recv().await.unwrap(),
            BridgeEvent::OrderStarted { quantity: 3, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            BridgeEvent::OrderFinished {
                status: OrderStatus::Failed,
                ..
            }
        ));
    }
}
