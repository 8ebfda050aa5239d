//! Every persisted status sequence is NEW → IN_PROGRESS → terminal, for
//! completed, timed-out and unencodable orders alike.

use std::sync::Arc;
use std::time::Duration;

use otb_bridge::{BridgeDispatcher, BridgeSettings};
use otb_db::OrderStore;
use otb_schemas::{NewOrder, OrderStatus};
use otb_testkit::{Device, RecordingStore, KEY};
use otb_surface::AddressingMode;
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn every_order_passes_through_in_progress_once() {
    let device = Device::spawn(KEY, Duration::from_secs(1), AddressingMode::Explicit);
    let store = Arc::new(RecordingStore::new());

    let mut ids = Vec::new();
    for (item, quantity) in [("Ok", 2), ("TooMany", 40_000), ("Zero", 0), ("Ok2", 1)] {
        let o = store
            .create(NewOrder {
                item: item.to_string(),
                quantity,
            })
            .await
            .unwrap();
        ids.push(o.id);
    }

    let settings = BridgeSettings {
        key: KEY,
        poll_interval: Duration::from_millis(350),
        ..BridgeSettings::default()
    };
    let bridge = BridgeDispatcher::new(settings, store.clone(), device.connector.clone());
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(bridge.run(stop_rx));
    tokio::time::sleep(Duration::from_secs(20)).await;
    stop_tx.send(true).unwrap();
    task.await.unwrap();

    use OrderStatus::*;
    let expected = [
        vec![InProgress, Completed],
        vec![InProgress, Failed],
        vec![InProgress, Completed],
        vec![InProgress, Completed],
    ];
    for (id, want) in ids.iter().zip(expected) {
        assert_eq!(store.history(*id).await, want, "order {id}");
    }
    let too_many = store.get(ids[1]).await.unwrap().unwrap();
    assert!(too_many
        .last_error
        .unwrap()
        .contains("protocol range error"));
}
