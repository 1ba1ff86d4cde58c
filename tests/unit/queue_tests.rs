#[cfg(test)]
mod tests_bounded_queue {
    use order_runtime::collections::NodePool;
    use order_runtime::queue::{
        BoundedPooledQueue, EarliestTimeTracker, QueueConfig, QueueError, TryEnqueueError,
    };
    use std::sync::Arc;
    use std::thread;

    fn queue(capacity: usize) -> BoundedPooledQueue<u64> {
        BoundedPooledQueue::new(QueueConfig::new(capacity))
    }

    #[test]
    fn enqueue_beyond_capacity_leaves_count_unchanged() {
        let q = queue(3);
        for ts in 0..3 {
            q.try_enqueue(ts, ts).expect("room");
        }
        let err = q.try_enqueue(99, 99).expect_err("queue is full");
        assert!(err.is_full());
        assert_eq!(err.into_inner(), Some(99));
        assert_eq!(q.len(), 3);
        assert!(q.is_full());
    }

    #[test]
    fn earliest_time_follows_commit_order() {
        let q = queue(8);
        for ts in [5, 2, 9] {
            q.try_enqueue(ts, ts).expect("room");
        }
        assert_eq!(q.earliest_pending_time(), Some(5));

        let reservation = q.try_dequeue().expect("dequeue").expect("entry");
        assert_eq!(q.earliest_pending_time(), Some(5));
        assert_eq!(reservation.commit(), Ok(5));
        assert_eq!(q.earliest_pending_time(), Some(2));
    }

    #[test]
    fn second_dequeue_without_commit_faults() {
        let q = queue(4);
        q.try_enqueue(1, 1).expect("room");
        q.try_enqueue(2, 2).expect("room");

        let first = q.try_dequeue().expect("dequeue").expect("entry");
        assert_eq!(
            q.try_dequeue().map(|r| r.is_some()),
            Err(QueueError::UncommittedDequeue)
        );
        assert_eq!(first.commit(), Ok(1));
        let second = q.try_dequeue().expect("dequeue").expect("entry");
        assert_eq!(second.value(), Some(2));
    }

    #[test]
    fn concurrent_producers_keep_per_producer_fifo() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 500;

        let q: BoundedPooledQueue<(u64, u64)> = BoundedPooledQueue::new(QueueConfig::new(32));
        let mut received: Vec<Vec<u64>> = vec![Vec::new(); PRODUCERS as usize];

        thread::scope(|scope| {
            for producer in 0..PRODUCERS {
                let q = &q;
                scope.spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        let mut item = (producer, seq);
                        loop {
                            match q.try_enqueue(item, seq) {
                                Ok(()) => break,
                                Err(TryEnqueueError::Full(back)) => {
                                    item = back;
                                    thread::yield_now();
                                }
                                Err(other) => panic!("unexpected enqueue error: {other}"),
                            }
                        }
                    }
                });
            }

            let mut total = 0;
            while total < PRODUCERS * PER_PRODUCER {
                match q.try_dequeue().expect("single consumer") {
                    Some(reservation) => {
                        let (producer, seq) = reservation.commit().expect("commit");
                        received[producer as usize].push(seq);
                        total += 1;
                    }
                    None => thread::yield_now(),
                }
            }
        });

        for seqs in received {
            assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
        }
        assert!(q.is_empty());
    }

    #[test]
    fn tracker_reports_minimum_across_queues() {
        let tracker = Arc::new(EarliestTimeTracker::new());
        let fast = queue(8);
        let slow = queue(8);
        let fast_id = fast.connect(tracker.clone());
        let slow_id = slow.connect(tracker.clone());

        fast.try_enqueue(1, 40).expect("room");
        slow.try_enqueue(2, 15).expect("room");
        assert_eq!(tracker.earliest_time(), Some(15));
        assert_eq!(tracker.activity(fast_id), 1);

        let r = slow.try_dequeue().expect("dequeue").expect("entry");
        assert_eq!(r.commit(), Ok(2));
        assert_eq!(tracker.earliest_for(slow_id), None);
        assert_eq!(tracker.activity(slow_id), 0);
        assert_eq!(tracker.earliest_time(), Some(40));
    }

    #[test]
    fn shared_pool_recycles_across_queues() {
        let pool = Arc::new(NodePool::new());
        let a: BoundedPooledQueue<u64> =
            BoundedPooledQueue::with_pool(QueueConfig::new(4), Arc::clone(&pool));
        let b: BoundedPooledQueue<u64> =
            BoundedPooledQueue::with_pool(QueueConfig::new(4), Arc::clone(&pool));

        a.try_enqueue(1, 1).expect("room");
        let r = a.try_dequeue().expect("dequeue").expect("entry");
        assert_eq!(r.commit(), Ok(1));
        assert_eq!(pool.available(), 1);

        b.try_enqueue(2, 2).expect("room");
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn flush_returns_once_consumer_drains() {
        let q = queue(4);
        for ts in 1..=3 {
            q.try_enqueue(ts, ts).expect("room");
        }

        thread::scope(|scope| {
            let flusher = scope.spawn(|| q.flush());

            for _ in 0..2 {
                let reservation = q.try_dequeue().expect("dequeue").expect("entry");
                reservation.commit().expect("commit");
            }
            let last = q.try_dequeue().expect("dequeue").expect("entry");
            thread::sleep(std::time::Duration::from_millis(20));
            assert!(!flusher.is_finished(), "flush returned with an entry reserved");

            assert_eq!(last.commit(), Ok(3));
            assert_eq!(flusher.join().expect("flusher panicked"), Ok(()));
        });
        assert!(q.is_empty());
        assert!(q.try_enqueue(4, 4).is_ok());
    }

    #[test]
    fn terminate_releases_flushing_thread() {
        let q = queue(4);
        q.try_enqueue(1, 1).expect("room");

        thread::scope(|scope| {
            let flusher = scope.spawn(|| q.flush());
            q.terminate();
            assert_eq!(flusher.join().expect("flusher panicked"), Err(QueueError::Terminated));
        });
        assert!(q.try_enqueue(2, 2).is_err_and(|e| e.is_terminated()));
        assert!(q.try_dequeue().is_err_and(|e| e.is_terminated()));
    }
}
