//! Per-symbol synchronization counters.

use super::error::CounterError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::{error, trace, warn};

/// One of the six counters tracked per symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Counter {
    /// Market-data ticks not yet processed.
    Ticks,
    /// Position changes not yet applied.
    PositionChange,
    /// Requests to run the physical-order processing phase.
    ProcessPhysicalOrders,
    /// Requests to re-run the physical-order processing phase.
    ReprocessPhysicalOrders,
    /// Broker fills not yet applied.
    PhysicalFills,
    /// Broker order updates not yet applied.
    PhysicalOrders,
}

impl Counter {
    /// Every counter, in storage order.
    pub const ALL: [Counter; 6] = [
        Counter::Ticks,
        Counter::PositionChange,
        Counter::ProcessPhysicalOrders,
        Counter::ReprocessPhysicalOrders,
        Counter::PhysicalFills,
        Counter::PhysicalOrders,
    ];

    #[inline]
    const fn index(self) -> usize {
        match self {
            Counter::Ticks => 0,
            Counter::PositionChange => 1,
            Counter::ProcessPhysicalOrders => 2,
            Counter::ReprocessPhysicalOrders => 3,
            Counter::PhysicalFills => 4,
            Counter::PhysicalOrders => 5,
        }
    }

    /// The [`PendingWork`] flag for this counter.
    #[must_use]
    pub const fn flag(self) -> PendingWork {
        match self {
            Counter::Ticks => PendingWork::TICKS,
            Counter::PositionChange => PendingWork::POSITION_CHANGE,
            Counter::ProcessPhysicalOrders => PendingWork::PROCESS_PHYSICAL_ORDERS,
            Counter::ReprocessPhysicalOrders => PendingWork::REPROCESS_PHYSICAL_ORDERS,
            Counter::PhysicalFills => PendingWork::PHYSICAL_FILLS,
            Counter::PhysicalOrders => PendingWork::PHYSICAL_ORDERS,
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Counter::Ticks => "ticks",
            Counter::PositionChange => "position_change",
            Counter::ProcessPhysicalOrders => "process_physical_orders",
            Counter::ReprocessPhysicalOrders => "reprocess_physical_orders",
            Counter::PhysicalFills => "physical_fills",
            Counter::PhysicalOrders => "physical_orders",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Which kinds of work are outstanding for a symbol.
    ///
    /// # Examples
    /// ```
    /// use order_runtime::counters::{PendingWork, SyncCounterSet};
    ///
    /// let counters = SyncCounterSet::new("EURUSD");
    /// counters.add_tick();
    /// counters.add_physical_fill();
    /// assert_eq!(counters.pending(), PendingWork::TICKS | PendingWork::PHYSICAL_FILLS);
    /// assert!(counters.pending().intersects(PendingWork::ORDER_WORK));
    /// ```
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PendingWork: u8 {
        /// Unprocessed ticks
        const TICKS = 1 << 0;

        /// Unapplied position changes
        const POSITION_CHANGE = 1 << 1;

        /// Physical-order processing requested
        const PROCESS_PHYSICAL_ORDERS = 1 << 2;

        /// Physical-order reprocessing requested
        const REPROCESS_PHYSICAL_ORDERS = 1 << 3;

        /// Unapplied broker fills
        const PHYSICAL_FILLS = 1 << 4;

        /// Unapplied broker order updates
        const PHYSICAL_ORDERS = 1 << 5;

        /// Work that means orders are still being processed
        const ORDER_WORK = Self::POSITION_CHANGE.bits()
            | Self::PHYSICAL_FILLS.bits()
            | Self::PHYSICAL_ORDERS.bits();
    }
}

/// Point-in-time copy of a counter set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Unprocessed ticks
    pub ticks: i64,
    /// Unapplied position changes
    pub position_change: i64,
    /// Physical-order processing requests
    pub process_physical_orders: i64,
    /// Physical-order reprocessing requests
    pub reprocess_physical_orders: i64,
    /// Unapplied broker fills
    pub physical_fills: i64,
    /// Unapplied broker order updates
    pub physical_orders: i64,
}

impl CounterSnapshot {
    /// Value of one counter.
    #[must_use]
    pub fn get(&self, counter: Counter) -> i64 {
        match counter {
            Counter::Ticks => self.ticks,
            Counter::PositionChange => self.position_change,
            Counter::ProcessPhysicalOrders => self.process_physical_orders,
            Counter::ReprocessPhysicalOrders => self.reprocess_physical_orders,
            Counter::PhysicalFills => self.physical_fills,
            Counter::PhysicalOrders => self.physical_orders,
        }
    }

    /// Flags for every non-zero counter.
    #[must_use]
    pub fn pending(&self) -> PendingWork {
        Counter::ALL
            .into_iter()
            .filter(|c| self.get(*c) != 0)
            .fold(PendingWork::empty(), |acc, c| acc | c.flag())
    }

    fn from_values(values: [i64; 6]) -> Self {
        Self {
            ticks: values[Counter::Ticks.index()],
            position_change: values[Counter::PositionChange.index()],
            process_physical_orders: values[Counter::ProcessPhysicalOrders.index()],
            reprocess_physical_orders: values[Counter::ReprocessPhysicalOrders.index()],
            physical_fills: values[Counter::PhysicalFills.index()],
            physical_orders: values[Counter::PhysicalOrders.index()],
        }
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ticks={} position_change={} process={} reprocess={} fills={} orders={}",
            self.ticks,
            self.position_change,
            self.process_physical_orders,
            self.reprocess_physical_orders,
            self.physical_fills,
            self.physical_orders
        )
    }
}

/// Lock-free bookkeeping of outstanding work for one symbol.
///
/// Producers bump a counter when they hand work to the pipeline and the
/// pipeline decrements it when the work is done. The set is never a data
/// channel; it only answers "is it safe to advance this symbol".
///
/// # Rollback baseline
///
/// [`capture_state`](Self::capture_state) copies the live counters into a
/// baseline. Every `add_*` call then cancels the new unit of work against
/// the captured baseline: while both the baseline and the live counter are
/// positive, both are decremented together. Work captured at the last
/// checkpoint is thereby absorbed by fresh work of the same kind instead of
/// accumulating.
///
/// # Underflow
///
/// Counters never go negative. A `remove_*` on a zero counter is clamped,
/// logged at `warn!`, and counted in
/// [`underflow_warnings`](Self::underflow_warnings).
pub struct SyncCounterSet {
    symbol: String,
    current: [AtomicI64; 6],
    baseline: [AtomicI64; 6],
    underflows: AtomicU64,
}

impl SyncCounterSet {
    /// Creates a set with every counter at zero.
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            current: Default::default(),
            baseline: Default::default(),
            underflows: AtomicU64::new(0),
        }
    }

    /// The symbol this set tracks.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Current value of `counter`.
    #[must_use]
    #[inline]
    pub fn get(&self, counter: Counter) -> i64 {
        self.current[counter.index()].load(Ordering::Acquire)
    }

    /// Increments `counter`, then rolls it back against the baseline.
    ///
    /// Returns the counter's value after rollback.
    pub fn add(&self, counter: Counter) -> i64 {
        let slot = &self.current[counter.index()];
        slot.fetch_add(1, Ordering::AcqRel);
        self.rollback(counter);
        slot.load(Ordering::Acquire)
    }

    /// Decrements `counter`, clamping at zero.
    ///
    /// Returns the counter's new value.
    pub fn remove(&self, counter: Counter) -> i64 {
        let slot = &self.current[counter.index()];
        match slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            (v > 0).then(|| v - 1)
        }) {
            Ok(previous) => previous - 1,
            Err(_) => {
                self.underflows.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %self.symbol, %counter, "counter decremented below zero, clamped");
                0
            }
        }
    }

    /// Records a market-data tick.
    pub fn add_tick(&self) -> i64 {
        self.add(Counter::Ticks)
    }

    /// Marks a tick as processed.
    pub fn remove_tick(&self) -> i64 {
        self.remove(Counter::Ticks)
    }

    /// Records a broker fill.
    pub fn add_physical_fill(&self) -> i64 {
        self.add(Counter::PhysicalFills)
    }

    /// Marks a broker fill as applied.
    pub fn remove_physical_fill(&self) -> i64 {
        self.remove(Counter::PhysicalFills)
    }

    /// Records a broker order update.
    pub fn add_physical_order(&self) -> i64 {
        self.add(Counter::PhysicalOrders)
    }

    /// Marks a broker order update as applied.
    pub fn remove_physical_order(&self) -> i64 {
        self.remove(Counter::PhysicalOrders)
    }

    /// Records a position change.
    pub fn add_position_change(&self) -> i64 {
        self.add(Counter::PositionChange)
    }

    /// Marks a position change as applied.
    pub fn remove_position_change(&self) -> i64 {
        self.remove(Counter::PositionChange)
    }

    /// Requests a physical-order processing pass.
    pub fn add_process_physical_orders(&self) -> i64 {
        self.add(Counter::ProcessPhysicalOrders)
    }

    /// Completes a physical-order processing pass.
    pub fn remove_process_physical_orders(&self) -> i64 {
        self.remove(Counter::ProcessPhysicalOrders)
    }

    /// Requests a reprocessing pass.
    pub fn add_reprocess_physical_orders(&self) -> i64 {
        self.add(Counter::ReprocessPhysicalOrders)
    }

    /// Completes a reprocessing pass.
    pub fn remove_reprocess_physical_orders(&self) -> i64 {
        self.remove(Counter::ReprocessPhysicalOrders)
    }

    /// Requests a reprocessing pass unless one is already pending.
    ///
    /// Returns `true` if this call set the counter.
    pub fn set_reprocess_physical_orders(&self) -> bool {
        let set = self.current[Counter::ReprocessPhysicalOrders.index()]
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if set {
            trace!(symbol = %self.symbol, "reprocess requested");
        }
        set
    }

    /// Copies the live counters into the rollback baseline.
    pub fn capture_state(&self) {
        for counter in Counter::ALL {
            let i = counter.index();
            self.baseline[i].store(self.current[i].load(Ordering::Acquire), Ordering::Release);
        }
        trace!(symbol = %self.symbol, baseline = %self.baseline(), "counter state captured");
    }

    /// Live counter values.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot::from_values(Self::load_all(&self.current))
    }

    /// Baseline captured by the last [`capture_state`](Self::capture_state).
    #[must_use]
    pub fn baseline(&self) -> CounterSnapshot {
        CounterSnapshot::from_values(Self::load_all(&self.baseline))
    }

    /// Flags for every non-zero counter.
    #[must_use]
    pub fn pending(&self) -> PendingWork {
        self.snapshot().pending()
    }

    /// Returns `true` when all six counters are zero.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.current.iter().all(|c| c.load(Ordering::Acquire) == 0)
    }

    /// Returns `true` while position changes, broker fills or broker order
    /// updates are outstanding.
    #[must_use]
    pub fn is_processing_orders(&self) -> bool {
        self.pending().intersects(PendingWork::ORDER_WORK)
    }

    /// Returns `true` when a processing pass is the only pending work.
    #[must_use]
    pub fn only_process_physical_orders(&self) -> bool {
        self.pending() == PendingWork::PROCESS_PHYSICAL_ORDERS
    }

    /// Returns `true` when a reprocessing pass is the only pending work.
    #[must_use]
    pub fn only_reprocess_physical_orders(&self) -> bool {
        self.pending() == PendingWork::REPROCESS_PHYSICAL_ORDERS
    }

    /// Number of clamped decrements since creation.
    #[must_use]
    pub fn underflow_warnings(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    /// Resets every counter and the baseline regardless of pending work.
    pub fn force_clear(&self) {
        for counter in Counter::ALL {
            self.reset(counter);
        }
        trace!(symbol = %self.symbol, "counters force-cleared");
    }

    /// Resets every counter except ticks.
    pub fn force_clear_orders(&self) {
        for counter in Counter::ALL {
            if counter != Counter::Ticks {
                self.reset(counter);
            }
        }
        trace!(symbol = %self.symbol, "order counters force-cleared");
    }

    /// Resets the baseline of a completed set.
    ///
    /// # Errors
    ///
    /// [`CounterError::NotCompleted`] if any counter is non-zero. Clearing
    /// with work in flight is a caller bug and is logged at `error!`.
    pub fn clear(&self) -> Result<(), CounterError> {
        let pending = self.snapshot();
        if pending != CounterSnapshot::default() {
            error!(symbol = %self.symbol, %pending, "clear called with work pending");
            return Err(CounterError::NotCompleted {
                symbol: self.symbol.clone(),
                pending,
            });
        }
        for slot in &self.baseline {
            slot.store(0, Ordering::Release);
        }
        Ok(())
    }

    fn reset(&self, counter: Counter) {
        let i = counter.index();
        self.current[i].store(0, Ordering::Release);
        self.baseline[i].store(0, Ordering::Release);
    }

    /// Cancels `counter` against its baseline while both are positive.
    fn rollback(&self, counter: Counter) {
        let i = counter.index();
        let base = &self.baseline[i];
        let live = &self.current[i];
        loop {
            let captured = base.load(Ordering::Acquire);
            if captured <= 0 || live.load(Ordering::Acquire) <= 0 {
                return;
            }
            if base
                .compare_exchange(captured, captured - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let decremented = live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| (v > 0).then(|| v - 1))
                .is_ok();
            if !decremented {
                // A concurrent remove drained the counter; give the credit back.
                base.fetch_add(1, Ordering::AcqRel);
                return;
            }
        }
    }

    fn load_all(slots: &[AtomicI64; 6]) -> [i64; 6] {
        std::array::from_fn(|i| slots[i].load(Ordering::Acquire))
    }
}

impl fmt::Debug for SyncCounterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCounterSet")
            .field("symbol", &self.symbol)
            .field("current", &self.snapshot())
            .field("baseline", &self.baseline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_remove_each_counter() {
        let set = SyncCounterSet::new("ES");
        for counter in Counter::ALL {
            assert_eq!(set.add(counter), 1);
            assert_eq!(set.get(counter), 1);
            assert!(set.pending().contains(counter.flag()));
            assert_eq!(set.remove(counter), 0);
        }
        assert!(set.is_completed());
    }

    #[test]
    fn test_capture_then_add_remove_completes() {
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
    fn test_add_cancels_against_baseline() {
        let set = SyncCounterSet::new("ES");
        set.add_tick();
        set.add_tick();
        set.capture_state();
        assert_eq!(set.baseline().ticks, 2);

        // 3 live, 2 captured: both drop by two.
        assert_eq!(set.add_tick(), 1);
        assert_eq!(set.baseline().ticks, 0);

        assert_eq!(set.add_tick(), 2);
        set.remove_tick();
        set.remove_tick();
        assert!(set.is_completed());
        assert!(set.clear().is_ok());
    }

    #[test]
    fn test_remove_underflow_is_clamped() {
        let set = SyncCounterSet::new("ES");
        assert_eq!(set.remove_physical_fill(), 0);
        assert_eq!(set.get(Counter::PhysicalFills), 0);
        assert_eq!(set.underflow_warnings(), 1);
    }

    #[test]
    fn test_set_reprocess_only_from_zero() {
        let set = SyncCounterSet::new("ES");
        assert!(set.set_reprocess_physical_orders());
        assert!(!set.set_reprocess_physical_orders());
        assert_eq!(set.get(Counter::ReprocessPhysicalOrders), 1);
        assert!(set.only_reprocess_physical_orders());
    }

    #[test]
    fn test_predicates() {
        let set = SyncCounterSet::new("ES");
        assert!(set.is_completed());
        assert!(!set.is_processing_orders());

        set.add_process_physical_orders();
        assert!(set.only_process_physical_orders());
        assert!(!set.is_processing_orders());

        set.add_tick();
        assert!(!set.only_process_physical_orders());

        set.add_physical_order();
        assert!(set.is_processing_orders());
        assert!(!set.is_completed());
    }

    #[test]
    fn test_clear_with_pending_work_fails() {
        let set = SyncCounterSet::new("ES");
        set.add_position_change();
        let err = set.clear().unwrap_err();
        assert!(matches!(err, CounterError::NotCompleted { ref symbol, .. } if symbol == "ES"));
        assert_eq!(set.get(Counter::PositionChange), 1);
    }

    #[test]
    fn test_force_clear_orders_keeps_ticks() {
        let set = SyncCounterSet::new("ES");
        set.add_tick();
        set.add_physical_fill();
        set.add_reprocess_physical_orders();
        set.force_clear_orders();
        assert_eq!(set.pending(), PendingWork::TICKS);
        set.force_clear();
        assert!(set.is_completed());
    }

    #[test]
    fn test_snapshot_display() {
        let set = SyncCounterSet::new("ES");
        set.add_tick();
        assert_eq!(
            set.snapshot().to_string(),
            "ticks=1 position_change=0 process=0 reprocess=0 fills=0 orders=0"
        );
    }

    #[test]
    fn test_concurrent_add_remove_balances() {
        let set = Arc::new(SyncCounterSet::new("ES"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let set = Arc::clone(&set);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        set.add_physical_order();
                        set.remove_physical_order();
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().is_ok());
        }
        assert!(set.is_completed());
    }
}
