//! Borrower registry: keyed store, per-borrower advisory locks, statistics.
//!
//! Records live in a concurrent map; all mutation goes through short
//! critical sections on this type (no I/O under a shard lock). The advisory
//! locks are a separate set — they are the concurrency-control primitive the
//! prepare/execute pipeline observes, not the map's own locking.

use alloy::primitives::Address;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info};

use crate::borrower::{
    Balances, Bands, Borrower, BorrowerState, CachedTx, SkipReason,
};

/// Per-state population counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub safe: usize,
    pub watch: usize,
    pub critical: usize,
    pub liquidatable: usize,
    pub locked: usize,
    pub cached_txs: usize,
}

impl RegistryStats {
    pub fn total(&self) -> usize {
        self.safe + self.watch + self.critical + self.liquidatable
    }
}

/// RAII advisory lock on one borrower; released on drop.
pub struct BorrowerLock<'a> {
    registry: &'a BorrowerRegistry,
    address: Address,
}

impl Drop for BorrowerLock<'_> {
    fn drop(&mut self) {
        self.registry.locks.remove(&self.address);
    }
}

/// Shared borrower store.
pub struct BorrowerRegistry {
    records: DashMap<Address, Borrower>,
    /// Advisory per-borrower locks, separate from the record map. An entry
    /// may outlive its record only transiently during removal.
    locks: DashMap<Address, ()>,
    /// Reverse index: asset → borrowers holding it as collateral.
    collateral_holders: DashMap<Address, DashSet<Address>>,
    /// Reverse index: asset → borrowers owing it.
    debt_holders: DashMap<Address, DashSet<Address>>,
}

impl BorrowerRegistry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            locks: DashMap::new(),
            collateral_holders: DashMap::new(),
            debt_holders: DashMap::new(),
        }
    }

    /// Snapshot of one borrower; independent of the live record.
    pub fn get(&self, address: &Address) -> Option<Borrower> {
        self.records.get(address).map(|b| b.clone())
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.records.contains_key(address)
    }

    /// Insert-if-absent. Returns true when a new record was created.
    pub fn upsert(&self, address: Address, initial_state: BorrowerState) -> bool {
        match self.records.entry(address) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Borrower::new(address, initial_state));
                debug!(borrower = %address, state = %initial_state, "Borrower registered");
                true
            }
        }
    }

    /// Delete a record, logging its final state.
    pub fn remove(&self, address: &Address) -> Option<BorrowerState> {
        let (_, borrower) = self.records.remove(address)?;
        for holders in self.collateral_holders.iter() {
            holders.value().remove(address);
        }
        for holders in self.debt_holders.iter() {
            holders.value().remove(address);
        }
        self.locks.remove(address);
        info!(borrower = %address, last_state = %borrower.state, "Borrower removed");
        Some(borrower.state)
    }

    /// All records as independent snapshots.
    pub fn all(&self) -> Vec<Borrower> {
        self.records.iter().map(|b| b.clone()).collect()
    }

    pub fn by_state(&self, state: BorrowerState) -> Vec<Borrower> {
        self.by_states(&[state])
    }

    pub fn by_states(&self, states: &[BorrowerState]) -> Vec<Borrower> {
        self.records
            .iter()
            .filter(|b| states.contains(&b.state))
            .map(|b| b.clone())
            .collect()
    }

    /// Write new health factors and reclassify.
    ///
    /// Appends to the history and logs on a band change; a transition into
    /// SAFE or WATCH clears any cached transaction. Returns
    /// `(previous, current)` state when the borrower exists.
    pub fn update_hf(
        &self,
        address: &Address,
        bands: &Bands,
        predicted: f64,
        oracle: Option<f64>,
    ) -> Option<(BorrowerState, BorrowerState)> {
        let mut borrower = self.records.get_mut(address)?;

        borrower.predicted_hf = predicted;
        if let Some(oracle_hf) = oracle {
            borrower.oracle_hf = oracle_hf;
        }
        borrower.last_updated_at = std::time::Instant::now();

        let previous = borrower.state;
        let current = bands.classify(predicted);

        if current != previous {
            borrower.state = current;
            borrower.push_transition(current, predicted);

            if matches!(current, BorrowerState::Safe | BorrowerState::Watch)
                && borrower.cached_tx.is_some()
            {
                borrower.cached_tx = None;
                borrower.prepared_block = None;
                debug!(borrower = %address, "Cached transaction cleared on recovery");
            }

            info!(
                borrower = %address,
                from = %previous,
                to = %current,
                hf = predicted,
                "State transition"
            );
        }

        Some((previous, current))
    }

    /// Replace both balance sides and refresh the reverse indices.
    pub fn set_balances(&self, address: &Address, collateral: Balances, debt: Balances) {
        let Some(mut borrower) = self.records.get_mut(address) else {
            return;
        };

        for (asset, _) in borrower.collateral.iter() {
            if !collateral.iter().any(|(a, _)| a == asset) {
                if let Some(holders) = self.collateral_holders.get(asset) {
                    holders.remove(address);
                }
            }
        }
        for (asset, _) in borrower.debt.iter() {
            if !debt.iter().any(|(a, _)| a == asset) {
                if let Some(holders) = self.debt_holders.get(asset) {
                    holders.remove(address);
                }
            }
        }

        for (asset, _) in collateral.iter() {
            self.collateral_holders
                .entry(*asset)
                .or_default()
                .insert(*address);
        }
        for (asset, _) in debt.iter() {
            self.debt_holders.entry(*asset).or_default().insert(*address);
        }

        borrower.collateral = collateral;
        borrower.debt = debt;
        borrower.last_updated_at = std::time::Instant::now();
        borrower.last_event_at = Some(std::time::Instant::now());
    }

    /// Idempotent monotonic hydration flag.
    pub fn mark_hydrated(&self, address: &Address) {
        if let Some(mut borrower) = self.records.get_mut(address) {
            if !borrower.hydrated {
                borrower.hydrated = true;
                debug!(borrower = %address, "Borrower hydrated");
            }
        }
    }

    /// Store a freshly prepared transaction.
    pub fn store_cached_tx(&self, address: &Address, tx: CachedTx, prepared_block: u64) {
        if let Some(mut borrower) = self.records.get_mut(address) {
            borrower.cached_tx = Some(tx);
            borrower.prepared_block = Some(prepared_block);
        }
    }

    /// Clear the cached transaction. No-op when absent.
    pub fn invalidate_cache(&self, address: &Address, reason: &str) {
        if let Some(mut borrower) = self.records.get_mut(address) {
            if borrower.cached_tx.take().is_some() {
                borrower.prepared_block = None;
                debug!(borrower = %address, reason = reason, "Cached transaction invalidated");
            }
        }
    }

    /// True iff a cached transaction exists and has outlived its TTL.
    pub fn is_cache_stale(&self, address: &Address, current_block: u64, ttl_blocks: u64) -> bool {
        self.records
            .get(address)
            .map(|b| match (&b.cached_tx, b.prepared_block) {
                (Some(_), Some(prepared)) => current_block.saturating_sub(prepared) > ttl_blocks,
                _ => false,
            })
            .unwrap_or(false)
    }

    pub fn record_skip(&self, address: &Address, reason: SkipReason) {
        if let Some(mut borrower) = self.records.get_mut(address) {
            borrower.last_skip_reason = Some(reason);
        }
    }

    pub fn record_execution_attempt(&self, address: &Address) {
        if let Some(mut borrower) = self.records.get_mut(address) {
            borrower.last_execution_attempt_at = Some(std::time::Instant::now());
        }
    }

    /// Non-blocking advisory lock acquisition. `None` when already held.
    pub fn try_lock(&self, address: Address) -> Option<BorrowerLock<'_>> {
        match self.locks.entry(address) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(BorrowerLock {
                    registry: self,
                    address,
                })
            }
        }
    }

    pub fn is_locked(&self, address: &Address) -> bool {
        self.locks.contains_key(address)
    }

    /// Borrowers holding `asset` on either side, via the reverse indices.
    pub fn holders_of(&self, asset: &Address) -> Vec<Address> {
        let mut holders: Vec<Address> = Vec::new();
        if let Some(set) = self.collateral_holders.get(asset) {
            holders.extend(set.iter().map(|a| *a));
        }
        if let Some(set) = self.debt_holders.get(asset) {
            for address in set.iter() {
                if !holders.contains(&address) {
                    holders.push(*address);
                }
            }
        }
        holders
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            locked: self.locks.len(),
            ..Default::default()
        };
        for borrower in self.records.iter() {
            match borrower.state {
                BorrowerState::Safe => stats.safe += 1,
                BorrowerState::Watch => stats.watch += 1,
                BorrowerState::Critical => stats.critical += 1,
                BorrowerState::Liquidatable => stats.liquidatable += 1,
            }
            if borrower.cached_tx.is_some() {
                stats.cached_txs += 1;
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for BorrowerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
