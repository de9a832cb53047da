//! Core coordination engine for the liquidation agent.
//!
//! This crate owns the in-process pipeline from observation to settlement:
//! - Borrower registry with per-borrower advisory locks and statistics
//! - Health-factor state machine (SAFE / WATCH / CRITICAL / LIQUIDATABLE)
//! - Off-chain HF engine and liquidation profit estimation
//! - Price aggregator with debounce, staleness and the fail-closed policy gate
//! - Pool event router and the recompute fan-out
//! - Prepare / execute pipeline with cached transactions
//! - Block loop for periodic refresh over the watch set

mod assets;
mod blocks;
mod borrower;
pub mod config;
mod engine;
mod health;
pub mod math;
mod pipeline;
mod prices;
mod registry;
mod router;

#[cfg(test)]
pub(crate) mod testutil;

pub use assets::{AssetCatalog, AssetInfo, DEFAULT_LIQUIDATION_THRESHOLD};
pub use borrower::{
    Balances, Bands, Borrower, BorrowerState, CachedTx, SkipReason, StateTransition, TxMode,
    HISTORY_CAP,
};
pub use config::{AssetSettings, ConfigHandle, Settings, SIGNER_KEY_ENV};
pub use engine::{Engine, EngineContext, SeedBorrower};
pub use health::{
    best_liquidation, estimate_liquidation, health_factor, oracle_debt_usd, LiquidationPlan,
};
pub use pipeline::Outcome;
pub use prices::{PriceAggregator, PricePoint};
pub use registry::{BorrowerLock, BorrowerRegistry, RegistryStats};
pub use router::EventRouter;
