//! Durable, crash-recoverable order store.
//!
//! [`DurableOrderStore`] keeps the engine's view of outstanding broker
//! orders in memory and persists full images of it to a single framed file
//! from a background writer thread. [`DurableOrderStore::recover`] rebuilds
//! both indices and every replace chain from the newest valid frame.

mod config;
mod error;
mod frame;
mod order;
mod order_store;
mod snapshot;

pub use config::StoreConfig;
pub use error::StoreError;
pub use order::{OrderRecord, OrderRef, OrderState, Side};
pub use order_store::DurableOrderStore;
