/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 14/10/26
******************************************************************************/

//! Symbol-keyed registry of counter sets.

use super::sync_counter::SyncCounterSet;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Shares one [`SyncCounterSet`] per symbol across pipeline stages.
///
/// Lookups and inserts go through a [`DashMap`], so stages on different
/// threads can resolve their counter set without a global lock.
#[derive(Debug, Default)]
pub struct SyncCounterRegistry {
    sets: DashMap<String, Arc<SyncCounterSet>>,
}

impl SyncCounterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the set for `symbol`, creating it on first use.
    pub fn get_or_create(&self, symbol: &str) -> Arc<SyncCounterSet> {
        if let Some(existing) = self.sets.get(symbol) {
            return Arc::clone(existing.value());
        }
        let entry = self.sets.entry(symbol.to_string()).or_insert_with(|| {
            debug!(symbol, "counter set created");
            Arc::new(SyncCounterSet::new(symbol))
        });
        Arc::clone(entry.value())
    }

    /// Returns the set for `symbol` if one exists.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<Arc<SyncCounterSet>> {
        self.sets.get(symbol).map(|entry| Arc::clone(entry.value()))
    }

    /// Drops the set for `symbol`.
    pub fn remove(&self, symbol: &str) -> Option<Arc<SyncCounterSet>> {
        let removed = self.sets.remove(symbol).map(|(_, set)| set);
        if removed.is_some() {
            info!(symbol, "counter set removed");
        }
        removed
    }

    /// Returns `true` if every registered symbol has completed its work.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.sets.iter().all(|entry| entry.value().is_completed())
    }

    /// Symbols with outstanding work, sorted.
    #[must_use]
    pub fn pending_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .sets
            .iter()
            .filter(|entry| !entry.value().is_completed())
            .map(|entry| entry.key().clone())
            .collect();
        symbols.sort();
        symbols
    }

    /// Registered symbols, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.sets.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Number of registered symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Returns `true` if no symbol is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
