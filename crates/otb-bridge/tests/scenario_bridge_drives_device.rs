//! Scenario: the bridge dispatches stored orders to a real device controller
//! over an in-process link, one after another.

use std::sync::Arc;
use std::time::Duration;

use otb_bridge::{BridgeDispatcher, BridgeSettings, Iteration, JobOutcome};
use otb_db::{MemoryOrderStore, OrderStore};
use otb_device::{DeviceController, DeviceSettings};
use otb_link::LocalConnector;
use otb_schemas::{NewOrder, OrderStatus};
use otb_surface::{AddressingMode, ControlSurface};
use tokio::sync::mpsc;

const KEY: i16 = 0xBEEFu16 as i16;

fn boot(addressing: AddressingMode) -> (BridgeDispatcher<LocalConnector>, Arc<MemoryOrderStore>) {
    let surface = Arc::new(ControlSurface::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = DeviceController::new(
        Arc::clone(&surface),
        DeviceSettings {
            key: KEY,
            tick: Duration::from_secs(1),
            addressing,
            replay_window: 1,
        },
    );
    tokio::spawn(controller.run(rx));

    let store = Arc::new(MemoryOrderStore::new());
    // Off the device tick so a poll never lands on the same instant as a unit.
    let settings = BridgeSettings {
        key: KEY,
        addressing,
        poll_interval: Duration::from_millis(350),
        ..BridgeSettings::default()
    };
    let dispatcher = BridgeDispatcher::new(
        settings,
        store.clone(),
        LocalConnector::new(surface, tx),
    );
    (dispatcher, store)
}

async fn counts(store: &MemoryOrderStore, id: i64) -> Vec<i32> {
    store
        .production_logs(id)
        .await
        .unwrap()
        .iter()
        .map(|l| l.produced_count)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn orders_run_back_to_back_in_creation_order() {
    let (mut bridge, store) = boot(AddressingMode::Explicit);
    let a = store.create(NewOrder::new("WidgetA", 3).unwrap()).await.unwrap();
    let b = store.create(NewOrder::new("WidgetB", 2).unwrap()).await.unwrap();

    match bridge.tick().await {
        Iteration::Dispatched(JobOutcome::Completed { order_id, produced }) => {
            assert_eq!((order_id, produced), (a.id, 3));
        }
        other => panic!("unexpected {other:?}"),
    }
    match bridge.tick().await {
        Iteration::Dispatched(JobOutcome::Completed { order_id, produced }) => {
            assert_eq!((order_id, produced), (b.id, 2));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(bridge.tick().await, Iteration::Idle));

    assert_eq!(counts(&store, a.id).await, vec![1, 2, 3]);
    assert_eq!(counts(&store, b.id).await, vec![1, 2]);
    for o in store.list().await.unwrap() {
        assert_eq!(o.status, OrderStatus::Completed);
        assert_eq!(o.last_error, None);
    }
}

#[tokio::test(start_paused = true)]
async fn legacy_addressing_still_completes() {
    let (mut bridge, store) = boot(AddressingMode::Legacy);
    let a = store.create(NewOrder::new("WidgetA", 2).unwrap()).await.unwrap();

    assert!(matches!(
        bridge.tick().await,
        Iteration::Dispatched(JobOutcome::Completed { produced: 2, .. })
    ));
    assert_eq!(counts(&store, a.id).await, vec![1, 2]);
}
