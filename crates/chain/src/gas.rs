//! EIP-1559 fee snapshotting.
//!
//! The block loop refreshes the snapshot once per tick; prepare and execute
//! read the cached values so the hot path never waits on a fee RPC.

use std::sync::atomic::{AtomicU64, Ordering};

/// Fee parameters observed from the chain, in wei.
#[derive(Debug, Clone, Copy)]
pub struct FeeData {
    pub base_fee: u128,
    pub priority_fee: u128,
}

impl FeeData {
    /// max_fee = base_fee × multiplier + priority, capped.
    pub fn max_fee_per_gas(&self, multiplier: f64, cap: u128) -> u128 {
        let scaled = (self.base_fee as f64 * multiplier) as u128 + self.priority_fee;
        scaled.min(cap)
    }

    /// Effective price used for cost estimation.
    pub fn effective_gas_price(&self) -> u128 {
        self.base_fee + self.priority_fee
    }
}

/// Default fee cap: 500 gwei.
const MAX_FEE_CAP: u128 = 500_000_000_000;

/// Max-fee headroom over the observed base fee.
const MAX_FEE_MULTIPLIER: f64 = 2.0;

/// Atomically updated fee cache shared across tasks.
pub struct FeeSnapshot {
    base_fee: AtomicU64,
    priority_fee: AtomicU64,
}

impl FeeSnapshot {
    pub fn new() -> Self {
        Self {
            // 30 gwei base / 1 gwei tip until the first refresh lands.
            base_fee: AtomicU64::new(30_000_000_000),
            priority_fee: AtomicU64::new(1_000_000_000),
        }
    }

    pub fn update(&self, fees: FeeData) {
        self.base_fee.store(fees.base_fee as u64, Ordering::Relaxed);
        self.priority_fee
            .store(fees.priority_fee as u64, Ordering::Relaxed);
    }

    pub fn load(&self) -> FeeData {
        FeeData {
            base_fee: self.base_fee.load(Ordering::Relaxed) as u128,
            priority_fee: self.priority_fee.load(Ordering::Relaxed) as u128,
        }
    }

    /// Capped max fee for transaction construction.
    pub fn max_fee_per_gas(&self) -> u128 {
        self.load().max_fee_per_gas(MAX_FEE_MULTIPLIER, MAX_FEE_CAP)
    }
}

impl Default for FeeSnapshot {
    fn default() -> Self {
        Self::new()
    }
}
