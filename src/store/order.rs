//! Broker order records.

use super::error::StoreError;
use crate::utils::current_time_millis;
use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Shared handle to an order record.
pub type OrderRef = Arc<OrderRecord>;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Lifecycle state of a broker order as the engine sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    /// Sent to the broker, not yet acknowledged.
    #[default]
    Pending,
    /// Working at the broker.
    Active,
    /// Working, with a replace request outstanding.
    PendingReplace,
    /// Working, with a cancel request outstanding.
    PendingCancel,
    /// Completely filled.
    Filled,
    /// Cancelled.
    Cancelled,
    /// Rejected by the broker.
    Rejected,
}

impl OrderState {
    /// Returns `true` while the order is working at the broker.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::PendingReplace | Self::PendingCancel)
    }

    /// Returns `true` while a request for this order awaits the broker.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::PendingReplace | Self::PendingCancel
        )
    }

    /// Returns `true` once the order can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

/// One broker order.
///
/// Identity fields are immutable. State, fill progress and the replace link
/// change in place so that every holder of the [`OrderRef`] sees them.
///
/// A replace chain runs forward only: `replace` points at the order that
/// superseded this one, which shares its logical serial.
pub struct OrderRecord {
    broker_order_id: String,
    logical_serial: i64,
    symbol: String,
    side: Side,
    price: u64,
    size: u64,
    created_at: u64,
    state: AtomicCell<OrderState>,
    filled_size: AtomicU64,
    modified_at: AtomicU64,
    replace: RwLock<Option<OrderRef>>,
}

impl OrderRecord {
    /// Creates a pending order stamped with the current time.
    #[must_use]
    pub fn new(
        broker_order_id: impl Into<String>,
        logical_serial: i64,
        symbol: impl Into<String>,
        side: Side,
        price: u64,
        size: u64,
    ) -> Self {
        let now = current_time_millis();
        Self {
            broker_order_id: broker_order_id.into(),
            logical_serial,
            symbol: symbol.into(),
            side,
            price,
            size,
            created_at: now,
            state: AtomicCell::new(OrderState::Pending),
            filled_size: AtomicU64::new(0),
            modified_at: AtomicU64::new(now),
            replace: RwLock::new(None),
        }
    }

    /// Sets the initial state.
    #[must_use]
    pub fn with_state(self, state: OrderState) -> Self {
        self.state.store(state);
        self
    }

    /// Overrides the creation and modification timestamps.
    #[must_use]
    pub fn with_timestamps(mut self, created_at: u64, modified_at: u64) -> Self {
        self.created_at = created_at;
        self.modified_at = AtomicU64::new(modified_at);
        self
    }

    /// Sets the filled quantity.
    #[must_use]
    pub fn with_filled_size(self, filled: u64) -> Self {
        self.filled_size.store(filled, Ordering::Release);
        self
    }

    /// Wraps the record in an [`OrderRef`].
    #[must_use]
    pub fn into_ref(self) -> OrderRef {
        Arc::new(self)
    }

    /// Identifier assigned by the broker.
    #[must_use]
    pub fn broker_order_id(&self) -> &str {
        &self.broker_order_id
    }

    /// Engine-side serial shared by every order in a replace chain.
    #[must_use]
    pub fn logical_serial(&self) -> i64 {
        self.logical_serial
    }

    /// Instrument symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Order side.
    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }

    /// Limit price in integer ticks.
    #[must_use]
    pub fn price(&self) -> u64 {
        self.price
    }

    /// Order quantity.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Creation time, milliseconds since the Unix epoch.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Time of the last state or fill change.
    #[must_use]
    pub fn modified_at(&self) -> u64 {
        self.modified_at.load(Ordering::Acquire)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> OrderState {
        self.state.load()
    }

    /// Replaces the state and bumps `modified_at`.
    pub fn set_state(&self, state: OrderState) {
        self.state.store(state);
        self.touch();
    }

    /// Quantity filled so far.
    #[must_use]
    pub fn filled_size(&self) -> u64 {
        self.filled_size.load(Ordering::Acquire)
    }

    /// Quantity still open.
    #[must_use]
    pub fn remaining_size(&self) -> u64 {
        self.size.saturating_sub(self.filled_size())
    }

    /// Adds a fill, marking the order filled once nothing remains.
    ///
    /// Returns the new filled quantity, capped at the order size.
    pub fn apply_fill(&self, quantity: u64) -> u64 {
        let size = self.size;
        let filled = match self
            .filled_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                Some(f.saturating_add(quantity).min(size))
            }) {
            Ok(previous) | Err(previous) => previous.saturating_add(quantity).min(size),
        };
        if filled >= size {
            self.state.store(OrderState::Filled);
        }
        self.touch();
        filled
    }

    /// The order that superseded this one, if any.
    #[must_use]
    pub fn replace(&self) -> Option<OrderRef> {
        self.replace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Links `next` as the order that superseded this one.
    ///
    /// # Errors
    ///
    /// [`StoreError::ReplaceCycle`] if `next` is this order or already leads
    /// back to it through its own replace chain.
    pub fn set_replace(&self, next: &OrderRef) -> Result<(), StoreError> {
        let mut cursor = Some(Arc::clone(next));
        while let Some(order) = cursor {
            if std::ptr::eq(Arc::as_ptr(&order), self) {
                return Err(StoreError::ReplaceCycle {
                    broker_order_id: self.broker_order_id.clone(),
                });
            }
            cursor = order.replace();
        }
        *self.replace.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(next));
        self.touch();
        Ok(())
    }

    /// Follows the replace chain to its newest order.
    #[must_use]
    pub fn latest(self: &Arc<Self>) -> OrderRef {
        let mut current = Arc::clone(self);
        while let Some(next) = current.replace() {
            current = next;
        }
        current
    }

    fn touch(&self) {
        self.modified_at
            .store(current_time_millis(), Ordering::Release);
    }
}

impl fmt::Debug for OrderRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderRecord")
            .field("broker_order_id", &self.broker_order_id)
            .field("logical_serial", &self.logical_serial)
            .field("symbol", &self.symbol)
            .field("side", &self.side)
            .field("price", &self.price)
            .field("size", &self.size)
            .field("filled_size", &self.filled_size())
            .field("state", &self.state())
            .field(
                "replace",
                &self.replace().map(|r| r.broker_order_id.clone()),
            )
            .finish()
    }
}

impl fmt::Display for OrderRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} {} {} {}@{} [{:?}]",
            self.broker_order_id,
            self.logical_serial,
            self.symbol,
            self.side,
            self.size,
            self.price,
            self.state()
        )
    }
}
