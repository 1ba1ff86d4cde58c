#[cfg(test)]
mod tests_durable_store {
    use order_runtime::store::{
        DurableOrderStore, OrderRecord, OrderRef, OrderState, Side, StoreConfig, StoreError,
    };
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StoreConfig {
        StoreConfig::new(dir.path(), "orders")
    }

    fn order(id: &str, serial: i64, price: u64, size: u64) -> OrderRef {
        OrderRecord::new(id, serial, "ES", Side::Buy, price, size)
            .with_state(OrderState::Active)
            .into_ref()
    }

    fn snapshot(store: &DurableOrderStore) {
        store.force_snapshot().expect("schedule snapshot");
        store.wait_for_snapshot().expect("snapshot written");
    }

    fn reopen(config: StoreConfig) -> DurableOrderStore {
        let store = DurableOrderStore::new(config);
        assert!(store.recover().expect("recover"), "no snapshot recovered");
        store
    }

    fn ids(store: &DurableOrderStore) -> Vec<String> {
        store
            .get_orders(|_| true)
            .iter()
            .map(|o| o.broker_order_id().to_string())
            .collect()
    }

    #[test]
    fn round_trip_restores_order_fields() {
        let dir = TempDir::new().expect("temp dir");
        {
            let store = DurableOrderStore::new(config(&dir));
            store.open_file().expect("open");
            store
                .assign_by_id(order("A", 11, 4_525, 3), 1, 1)
                .expect("assign");
            snapshot(&store);
        }

        let store = reopen(config(&dir));
        let a = store.get_order_by_id("A").expect("order A");
        assert_eq!(a.broker_order_id(), "A");
        assert_eq!(a.logical_serial(), 11);
        assert_eq!(a.price(), 4_525);
        assert_eq!(a.size(), 3);
        assert_eq!(a.state(), OrderState::Active);
        assert_eq!((store.remote_sequence(), store.local_sequence()), (1, 1));
    }

    #[test]
    fn replace_chain_identity_survives_recovery() {
        let dir = TempDir::new().expect("temp dir");
        {
            let store = DurableOrderStore::new(config(&dir));
            store.open_file().expect("open");
            let first = order("A", 7, 100, 1);
            let second = order("B", 7, 101, 1);
            store.assign_by_id(Arc::clone(&first), 1, 1).expect("assign");
            first.set_replace(&second).expect("link replacement");
            store.set_order(second).expect("assign replacement");
            snapshot(&store);
        }

        let store = reopen(config(&dir));
        let by_serial = store.get_order_by_serial(7).expect("serial 7");
        assert_eq!(by_serial.broker_order_id(), "B");

        let first = store.get_order_by_id("A").expect("order A");
        let second = store.get_order_by_id("B").expect("order B");
        let link = first.replace().expect("replace link restored");
        assert!(Arc::ptr_eq(&link, &second));
        assert!(Arc::ptr_eq(&link, &by_serial));
    }

    #[test]
    fn superseded_order_only_reachable_through_chain_is_restored() {
        let dir = TempDir::new().expect("temp dir");
        {
            let store = DurableOrderStore::new(config(&dir));
            store.open_file().expect("open");
            store.set_order(order("A", 3, 100, 1)).expect("assign");
            store.set_order(order("B", 3, 100, 1)).expect("assign");
            store.set_order(order("C", 3, 100, 1)).expect("assign");
            assert!(store.remove_order("B").is_some());
            snapshot(&store);
        }

        let store = reopen(config(&dir));
        assert_eq!(ids(&store), vec!["A", "C"]);
        let a = store.get_order_by_id("A").expect("order A");
        let b = a.replace().expect("B still linked");
        assert_eq!(b.broker_order_id(), "B");
        assert!(Arc::ptr_eq(&a.latest(), &store.get_order_by_id("C").expect("order C")));
    }

    #[test]
    fn corrupted_trailing_frame_falls_back_to_previous() {
        let dir = TempDir::new().expect("temp dir");
        let path = config(&dir).file_path();
        let mut valid_len = 0;
        {
            let store = DurableOrderStore::new(config(&dir));
            store.open_file().expect("open");
            for (i, id) in ["A", "B", "C"].into_iter().enumerate() {
                if i == 2 {
                    valid_len = fs::metadata(&path).expect("metadata").len();
                }
                store
                    .assign_by_id(order(id, i as i64, 100, 1), i as u64 + 1, i as u64 + 1)
                    .expect("assign");
                snapshot(&store);
            }
        }

        let full_len = fs::metadata(&path).expect("metadata").len();
        let file = OpenOptions::new().write(true).open(&path).expect("open file");
        file.set_len(full_len - 5).expect("truncate");
        drop(file);

        let store = reopen(config(&dir));
        assert_eq!(ids(&store), vec!["A", "B"]);
        assert_eq!(store.remote_sequence(), 2);
        assert_eq!(fs::metadata(&path).expect("metadata").len(), valid_len);
    }

    #[test]
    fn flipped_byte_in_last_frame_is_discarded() {
        let dir = TempDir::new().expect("temp dir");
        let path = config(&dir).file_path();
        {
            let store = DurableOrderStore::new(config(&dir));
            store.open_file().expect("open");
            store.set_order(order("A", 1, 100, 1)).expect("assign");
            snapshot(&store);
            store.set_order(order("B", 2, 100, 1)).expect("assign");
            snapshot(&store);
        }

        let mut bytes = fs::read(&path).expect("read");
        let last = bytes.len() - 10;
        bytes[last] ^= 0x5A;
        fs::write(&path, bytes).expect("write");

        let store = reopen(config(&dir));
        assert_eq!(ids(&store), vec!["A"]);
    }

    #[test]
    fn frames_after_a_torn_append_stay_recoverable() {
        let dir = TempDir::new().expect("temp dir");
        let path = config(&dir).file_path();
        {
            let store = DurableOrderStore::new(config(&dir));
            store.open_file().expect("open");
            store.assign_by_id(order("A", 1, 100, 1), 1, 1).expect("assign");
            snapshot(&store);

            // Half a frame left behind by an interrupted append.
            let mut file = OpenOptions::new().append(true).open(&path).expect("open file");
            file.write_all(b"OSNP\x01\x00partial").expect("append garbage");
            drop(file);

            store.assign_by_id(order("B", 2, 100, 1), 2, 2).expect("assign");
            snapshot(&store);
        }

        let store = reopen(config(&dir));
        assert_eq!(ids(&store), vec!["A", "B"]);
        assert_eq!(store.remote_sequence(), 2);
    }

    #[test]
    fn rollover_restarts_from_fresh_base_frame() {
        let dir = TempDir::new().expect("temp dir");
        let rollover = 2_048;
        let config = config(&dir).with_snapshot_rollover_size(rollover);
        let path = config.file_path();
        {
            let store = DurableOrderStore::new(config.clone());
            store.open_file().expect("open");
            store.set_order(order("A", 1, 100, 1)).expect("assign");
            snapshot(&store);
            let single_frame = fs::metadata(&path).expect("metadata").len();

            for seq in 2..=40 {
                store.set_sequences(seq, seq * 10);
                snapshot(&store);
                let len = fs::metadata(&path).expect("metadata").len();
                assert!(len <= rollover, "store file grew to {len} bytes");
            }
            let len = fs::metadata(&path).expect("metadata").len();
            assert!(len < single_frame * 40);
        }
        assert!(!dir.path().join("orders.store.tmp").exists());

        let store = reopen(config);
        assert_eq!(ids(&store), vec!["A"]);
        assert_eq!((store.remote_sequence(), store.local_sequence()), (40, 400));
    }

    #[test]
    fn write_failure_is_surfaced_to_waiter() {
        let dir = TempDir::new().expect("temp dir");
        let store_dir = dir.path().join("store");
        let store = DurableOrderStore::new(StoreConfig::new(&store_dir, "orders"));
        store.open_file().expect("open");
        store.set_order(order("A", 1, 100, 1)).expect("assign");

        fs::remove_dir_all(&store_dir).expect("remove store dir");
        store.force_snapshot().expect("schedule snapshot");
        let err = store.wait_for_snapshot().expect_err("write must fail");
        assert!(matches!(err, StoreError::Io { .. }), "unexpected error: {err}");

        // The store keeps serving reads after a failed write.
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn auto_snapshot_persists_mutations() {
        let dir = TempDir::new().expect("temp dir");
        let config = config(&dir)
            .with_auto_snapshot(true)
            .with_snapshot_interval(Duration::ZERO);
        {
            let store = DurableOrderStore::new(config.clone());
            store.open_file().expect("open");
            store.assign_by_id(order("A", 1, 100, 1), 5, 6).expect("assign");
            store.wait_for_snapshot().expect("auto snapshot written");
        }

        let store = reopen(config);
        assert_eq!(ids(&store), vec!["A"]);
        assert_eq!(store.remote_sequence(), 5);
    }

    #[test]
    fn recover_without_snapshot_returns_false() {
        let dir = TempDir::new().expect("temp dir");
        let store = DurableOrderStore::new(config(&dir));
        assert_eq!(store.recover(), Ok(false));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn wait_after_close_observes_terminal_state() {
        let dir = TempDir::new().expect("temp dir");
        let store = DurableOrderStore::new(config(&dir));
        store.open_file().expect("open");
        store.set_order(order("A", 1, 100, 1)).expect("assign");
        store.force_snapshot().expect("schedule snapshot");
        store.close();

        // Queued snapshots drain before the writer stops.
        assert_eq!(store.wait_for_snapshot(), Ok(()));
        assert_eq!(store.force_snapshot(), Err(StoreError::Closed));
    }
}
