#[cfg(test)]
mod tests_concurrent_list {
    use order_runtime::collections::{ConcurrentList, NodeRef};
    use proptest::prelude::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn walk(list: &ConcurrentList<u32>) -> Vec<NodeRef<u32>> {
        list.iter().collect()
    }

    proptest! {
        #[test]
        fn count_matches_linked_nodes(ops in prop::collection::vec(any::<bool>(), 0..200)) {
            let list = ConcurrentList::new();
            let mut model = VecDeque::new();
            let mut next_value = 0u32;

            for add in ops {
                if add {
                    list.add_last(next_value).expect("add_last");
                    model.push_back(next_value);
                    next_value += 1;
                } else {
                    let removed = list.remove_first().expect("remove_first");
                    prop_assert_eq!(removed.and_then(|n| n.value()), model.pop_front());
                }

                prop_assert_eq!(list.len(), model.len());
                let nodes = walk(&list);
                prop_assert_eq!(nodes.len(), list.len());
                let distinct: HashSet<*const _> = nodes.iter().map(Arc::as_ptr).collect();
                prop_assert_eq!(distinct.len(), nodes.len());
                prop_assert!(nodes.iter().all(|n| list.contains(n)));

                if let (Some(first), Some(last)) = (list.first(), nodes.last()) {
                    // One more hop from the tail lands back on the head.
                    prop_assert!(list.next(last).is_none());
                    prop_assert!(Arc::ptr_eq(&first, &nodes[0]));
                }
                prop_assert!(list.check_invariants().is_ok());
            }
            prop_assert_eq!(list.to_vec(), model.into_iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn traversal_survives_concurrent_removal() {
        let list = Arc::new(ConcurrentList::new());
        let nodes: Vec<NodeRef<u32>> = (0..2_000)
            .map(|v| list.add_last(v).expect("add_last"))
            .collect();
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let list = Arc::clone(&list);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut passes = 0usize;
                    while !done.load(Ordering::Acquire) || passes == 0 {
                        let seen: Vec<u32> = list.iter().filter_map(|n| n.value()).collect();
                        assert!(seen.len() <= 2_000);
                        assert!(
                            seen.windows(2).all(|w| w[0] < w[1]),
                            "traversal went backwards or repeated a value"
                        );
                        passes += 1;
                    }
                    passes
                })
            })
            .collect();

        for node in nodes.iter().filter(|n| n.value().is_some_and(|v| v % 2 == 0)) {
            list.remove(node).expect("remove");
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            assert!(reader.join().expect("reader panicked") > 0);
        }
        let remaining = list.to_vec();
        assert_eq!(remaining.len(), 1_000);
        assert!(remaining.iter().all(|v| v % 2 == 1));
        assert!(list.check_invariants().is_ok());
    }

    #[test]
    fn cursor_on_removed_node_continues_forward() {
        let list = ConcurrentList::new();
        let a = list.add_last(1).expect("add");
        let b = list.add_last(2).expect("add");
        let c = list.add_last(3).expect("add");
        let d = list.add_last(4).expect("add");

        list.remove(&b).expect("remove b");
        list.remove(&c).expect("remove c");

        let next = list.next(&b).expect("walk continues past removed nodes");
        assert!(Arc::ptr_eq(&next, &d));
        assert!(list.next(&d).is_none());
        assert!(Arc::ptr_eq(&list.prev(&d).expect("prev"), &a));
        assert!(!b.is_linked());
    }

    #[test]
    fn concurrent_producers_and_removers_keep_count_consistent() {
        let list = Arc::new(ConcurrentList::new());
        thread::scope(|scope| {
            for t in 0..4u32 {
                let list = Arc::clone(&list);
                scope.spawn(move || {
                    for i in 0..500 {
                        list.add_last(t * 1_000 + i).expect("add_last");
                        if i % 3 == 0 {
                            let _ = list.remove_first().expect("remove_first");
                        }
                    }
                });
            }
        });
        assert_eq!(list.len(), walk(&list).len());
        assert!(list.check_invariants().is_ok());
    }
}
