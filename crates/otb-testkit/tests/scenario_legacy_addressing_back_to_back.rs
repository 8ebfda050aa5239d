//! Legacy addressing has no presence mask, but the bridge still waits for the
//! device to echo the transaction before it trusts the counters, so orders
//! run back to back each log their own units.

use std::time::Duration;

use otb_bridge::{Iteration, JobOutcome};
use otb_schemas::OrderStatus;
use otb_surface::AddressingMode;
use otb_testkit::{Plant, PlantConfig};

fn legacy_plant() -> Plant {
    Plant::new(PlantConfig {
        addressing: AddressingMode::Legacy,
        ..PlantConfig::default()
    })
}

#[tokio::test(start_paused = true)]
async fn second_order_is_not_completed_by_first_orders_flag() {
    let plant = legacy_plant();
    let mut bridge = plant.dispatcher();
    let first = plant.order("WidgetA", 1).await.unwrap();
    let second = plant.order("WidgetB", 3).await.unwrap();

    let it = bridge.tick().await;
    assert!(
        matches!(it, Iteration::Dispatched(JobOutcome::Completed { produced: 1, .. })),
        "{it:?}"
    );
    assert!(plant.device.surface.done(), "first job leaves its flag set");

    let started = tokio::time::Instant::now();
    let it = bridge.tick().await;
    assert!(
        matches!(
            it,
            Iteration::Dispatched(JobOutcome::Completed { order_id, produced: 3 }) if order_id == second.id
        ),
        "{it:?}"
    );
    assert!(
        started.elapsed() >= Duration::from_secs(3),
        "waited for the real job: {:?}",
        started.elapsed()
    );

    assert_eq!(plant.produced_counts(first.id).await.unwrap(), vec![1]);
    assert_eq!(plant.produced_counts(second.id).await.unwrap(), vec![1, 2, 3]);
    assert_eq!(plant.status(second.id).await.unwrap(), OrderStatus::Completed);
    assert_eq!(plant.device.surface.produced(), 3);
}
