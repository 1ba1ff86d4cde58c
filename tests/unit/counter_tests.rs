#[cfg(test)]
mod tests_sync_counters {
    use order_runtime::counters::{
        Counter, CounterError, PendingWork, SyncCounterRegistry, SyncCounterSet,
    };
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn capture_then_balanced_ticks_completes() {
        let set = SyncCounterSet::new("ES");
        set.capture_state();
        set.add_tick();
        set.add_tick();
        set.remove_tick();
        set.remove_tick();
        assert!(set.is_completed());
        assert!(set.clear().is_ok());
    }

    #[test]
    fn new_ticks_cancel_against_captured_baseline() {
        let set = SyncCounterSet::new("ES");
        set.add_tick();
        set.capture_state();
        assert_eq!(set.baseline().ticks, 1);

        // The first tick after the capture cancels the captured one.
        assert_eq!(set.add_tick(), 1);
        assert_eq!(set.baseline().ticks, 0);
        assert_eq!(set.add_tick(), 2);

        assert!(matches!(
            set.clear(),
            Err(CounterError::NotCompleted { ref symbol, .. }) if symbol == "ES"
        ));
        set.remove_tick();
        set.remove_tick();
        assert!(set.is_completed());
        assert!(set.clear().is_ok());
    }

    #[test]
    fn pending_flags_drive_predicates() {
        let set = SyncCounterSet::new("NQ");
        assert!(set.set_reprocess_physical_orders());
        assert!(!set.set_reprocess_physical_orders());
        assert!(set.only_reprocess_physical_orders());

        set.add_physical_fill();
        assert!(set.is_processing_orders());
        assert_eq!(
            set.pending(),
            PendingWork::REPROCESS_PHYSICAL_ORDERS | PendingWork::PHYSICAL_FILLS
        );

        set.force_clear_orders();
        assert!(set.is_completed());
    }

    #[test]
    fn concurrent_balanced_updates_complete() {
        let set = Arc::new(SyncCounterSet::new("CL"));
        let handles: Vec<_> = Counter::ALL
            .into_iter()
            .map(|counter| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        set.add(counter);
                    }
                    for _ in 0..1_000 {
                        set.remove(counter);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert!(set.is_completed());
        assert_eq!(set.underflow_warnings(), 0);
    }

    #[test]
    fn registry_reports_pending_symbols() {
        let registry = SyncCounterRegistry::new();
        registry.get_or_create("ES").add_tick();
        registry.get_or_create("NQ");
        assert_eq!(registry.len(), 2);
        assert!(!registry.all_completed());
        assert_eq!(registry.pending_symbols(), vec!["ES".to_string()]);

        registry.get("ES").expect("ES registered").remove_tick();
        assert!(registry.all_completed());
    }
}
