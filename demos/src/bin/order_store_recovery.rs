// demos/src/bin/order_store_recovery.rs
//
// Assigns a few broker orders to a DurableOrderStore, including a replace
// chain, snapshots it, tears the last frame the way a crash mid-write would,
// and recovers the store from disk.
//
// Run this demo with:
//   cargo run --bin order_store_recovery
//   (from the demos directory)

use order_runtime::prelude::*;
use std::fs::OpenOptions;
use std::time::Duration;
use tracing::{error, info};

fn main() {
    tracing_subscriber::fmt::init();
    info!("Order store recovery demo");

    let directory = std::env::temp_dir().join(format!("order-store-demo-{}", std::process::id()));
    let config = StoreConfig::new(&directory, "orders")
        .with_snapshot_interval(Duration::from_millis(10))
        .with_snapshot_rollover_size(64 * 1024);

    if let Err(err) = run(config) {
        error!(%err, "demo failed");
    }
    let _ = std::fs::remove_dir_all(&directory);
}

fn run(config: StoreConfig) -> Result<(), StoreError> {
    {
        let store = DurableOrderStore::new(config.clone());
        store.open_file()?;

        let working = OrderRecord::new("BRK-1", 1, "ES", Side::Buy, 4_500, 2)
            .with_state(OrderState::Active)
            .into_ref();
        store.assign_by_id(working, 100, 1)?;
        store.force_snapshot()?;
        store.wait_for_snapshot()?;

        // A replace keeps the logical serial and gets a new broker id.
        let replacement = OrderRecord::new("BRK-2", 1, "ES", Side::Buy, 4_501, 2)
            .with_state(OrderState::Active)
            .into_ref();
        store.assign_by_id(replacement, 101, 2)?;
        store.assign_by_id(
            OrderRecord::new("BRK-3", 2, "NQ", Side::Sell, 15_000, 1).into_ref(),
            102,
            3,
        )?;
        store.force_snapshot()?;
        store.wait_for_snapshot()?;

        info!(orders = store.count(), "orders persisted");
        for order in store.get_orders(|_| true) {
            info!(%order, "stored");
        }
    }

    // Simulate a crash halfway through the last frame.
    let path = config.file_path();
    let len = std::fs::metadata(&path)?.len();
    OpenOptions::new().write(true).open(&path)?.set_len(len - 7)?;
    info!(path = %path.display(), "tore the trailing frame");

    let store = DurableOrderStore::new(config);
    let recovered = store.recover()?;
    info!(
        recovered,
        orders = store.count(),
        remote_sequence = store.remote_sequence(),
        local_sequence = store.local_sequence(),
        "store reopened"
    );

    let latest = store.get_order_by_serial(1)?;
    info!(%latest, "newest order for serial 1");
    match store.get_order_by_id("BRK-3") {
        Ok(order) => info!(%order, "found"),
        Err(err) if err.is_not_found() => info!(%err, "lost with the torn frame"),
        Err(err) => return Err(err),
    }
    for order in store.get_active_orders("ES") {
        info!(%order, "active");
    }
    Ok(())
}
