//! Engine orchestration.
//!
//! [`EngineContext`] is the single core context constructed at startup: it
//! carries the registry, the price aggregator, the asset catalog, the
//! external trait objects and the shared counters. All coordination logic
//! (recompute fan-out, prepare/execute, block loop) hangs off it.
//!
//! [`Engine`] wires the context to the input channels and spawns the loops;
//! prepare/execute tasks are scheduled here so every loop stays responsive
//! while a borrower's pipeline waits on RPC.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use anyhow::Result;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use sentinel_api::{AuditEvent, FeedEvent, Notifier, SwapQuoter};
use sentinel_chain::{ChainClient, FeeSnapshot, LiquidationExecutor, PoolEvent};

use crate::assets::AssetCatalog;
use crate::borrower::{Balances, Bands, BorrowerState};
use crate::config::ConfigHandle;
use crate::health;
use crate::prices::PriceAggregator;
use crate::registry::BorrowerRegistry;
use crate::router::EventRouter;

/// One seed-scan discovery: a borrower with its last known balances.
#[derive(Debug, Clone)]
pub struct SeedBorrower {
    pub address: Address,
    pub collateral: Vec<(Address, U256)>,
    pub debt: Vec<(Address, U256)>,
}

/// The core context shared by every loop and pipeline stage.
pub struct EngineContext {
    pub config: ConfigHandle,
    pub registry: BorrowerRegistry,
    pub prices: Arc<PriceAggregator>,
    pub catalog: AssetCatalog,
    pub chain: Arc<dyn ChainClient>,
    pub executor: Arc<dyn LiquidationExecutor>,
    pub quoter: Arc<dyn SwapQuoter>,
    pub notifier: Arc<dyn Notifier>,
    pub fees: FeeSnapshot,
    /// Latest observed block height, refreshed by the block loop.
    pub latest_block: AtomicU64,
    /// In-flight broadcast count, bounded by `max_concurrent_tx`.
    pub active_executions: AtomicUsize,
}

impl EngineContext {
    pub fn bands(&self) -> Bands {
        self.config.current().bands()
    }

    /// Configured debt-side assets resolved to addresses.
    pub fn debt_targets(&self) -> Vec<Address> {
        self.config
            .current()
            .target_debt_assets
            .iter()
            .filter_map(|symbol| self.catalog.address_of(symbol))
            .collect()
    }

    /// Configured collateral-side assets resolved to addresses.
    pub fn collateral_targets(&self) -> Vec<Address> {
        self.config
            .current()
            .target_collateral_assets
            .iter()
            .filter_map(|symbol| self.catalog.address_of(symbol))
            .collect()
    }

    /// The asset whose feed price converts gas to USD.
    pub fn native_asset(&self) -> Option<Address> {
        self.catalog.address_of(&self.config.current().native_asset)
    }

    /// Fire an audit event without blocking the caller.
    pub fn audit(&self, event: AuditEvent) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            notifier.notify(event).await;
        });
    }

    /// Recompute the predicted HF for one hydrated borrower. Returns true
    /// when the borrower now sits in CRITICAL without a cached transaction
    /// and a `prepare` should be scheduled.
    pub fn recompute(&self, address: Address) -> bool {
        let Some(borrower) = self.registry.get(&address) else {
            return false;
        };
        if !borrower.hydrated {
            debug!(borrower = %address, "Skipping recompute for unhydrated borrower");
            return false;
        }

        let hf = health::health_factor(&borrower, &self.prices, &self.catalog);
        let Some((_, state)) = self.registry.update_hf(&address, &self.bands(), hf, None) else {
            return false;
        };

        state == BorrowerState::Critical
            && self
                .registry
                .get(&address)
                .map(|b| b.cached_tx.is_none())
                .unwrap_or(false)
    }

    /// Price-driven fan-out: invalidate caches touched by the asset, then
    /// recompute every affected hydrated borrower. Returns the borrowers
    /// for which a `prepare` should be scheduled.
    pub fn on_price_tick(&self, asset: Address) -> Vec<Address> {
        let holders = self.registry.holders_of(&asset);
        debug!(asset = %asset, affected = holders.len(), "Price tick fan-out");

        let mut to_prepare = Vec::new();
        for address in holders {
            let Some(borrower) = self.registry.get(&address) else {
                continue;
            };

            if matches!(
                borrower.state,
                BorrowerState::Critical | BorrowerState::Liquidatable
            ) && borrower.cached_tx.is_some()
                && borrower.touches(&asset)
            {
                self.registry.invalidate_cache(&address, "price_update");
            }

            if !borrower.hydrated {
                continue;
            }
            if self.recompute(address) {
                to_prepare.push(address);
            }
        }
        to_prepare
    }

    /// Log periodic statistics; called by the block loop.
    pub(crate) fn log_stats(&self, block: u64) {
        let stats = self.registry.stats();
        info!(
            block = block,
            safe = stats.safe,
            watch = stats.watch,
            critical = stats.critical,
            liquidatable = stats.liquidatable,
            locked = stats.locked,
            cached_txs = stats.cached_txs,
            prices = self.prices.price_count(),
            active_executions = self.active_executions.load(Ordering::Relaxed),
            "Registry statistics"
        );
    }
}

/// Schedule a background `prepare` for one borrower. Duplicate schedules
/// bounce off the advisory lock inside `prepare` without queueing.
pub(crate) fn spawn_prepare(ctx: &Arc<EngineContext>, address: Address) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let outcome = ctx.prepare(address).await;
        debug!(borrower = %address, outcome = %outcome, "Prepare finished");
    });
}

/// Top-level engine: owns the shutdown signal and spawns the loops.
pub struct Engine {
    ctx: Arc<EngineContext>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { ctx, shutdown_tx }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Request cooperative shutdown of every loop.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// One-time ingestion of discovered borrowers. Inserted SAFE and
    /// unhydrated; the first authoritative chain event hydrates them.
    pub fn seed(&self, borrowers: Vec<SeedBorrower>) {
        let cap = self.ctx.config.current().max_candidates;
        let mut inserted = 0usize;

        for seed in borrowers.into_iter().take(cap) {
            if self.ctx.registry.upsert(seed.address, BorrowerState::Safe) {
                inserted += 1;
            }
            let collateral: Balances = seed.collateral.into_iter().collect();
            let debt: Balances = seed.debt.into_iter().collect();
            self.ctx.registry.set_balances(&seed.address, collateral, debt);
        }

        info!(
            inserted = inserted,
            total = self.ctx.registry.len(),
            "Seed scan ingested"
        );
    }

    /// Spawn all loops and run until shutdown.
    pub async fn run(
        &self,
        mut feed_rx: mpsc::Receiver<FeedEvent>,
        mut tick_rx: mpsc::Receiver<Address>,
        mut pool_events: impl Stream<Item = PoolEvent> + Send + Unpin + 'static,
    ) -> Result<()> {
        info!("Starting engine loops");

        let (updates_tx, mut updates_rx) = mpsc::channel::<Address>(1024);
        let router = Arc::new(EventRouter::new(self.ctx.clone(), updates_tx));

        // Feed pump: connector events into the aggregator.
        let ctx = self.ctx.clone();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = feed_rx.recv() => match event {
                        Some(FeedEvent::Price(update)) => ctx.prices.ingest(update),
                        Some(FeedEvent::Connected(source)) => ctx.prices.mark_connected(source, true),
                        Some(FeedEvent::Disconnected(source)) => ctx.prices.mark_connected(source, false),
                        None => break,
                    }
                }
            }
            debug!("Feed pump stopped");
        });

        // Price fan-out: debounced ticks into HF recomputation.
        let ctx = self.ctx.clone();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    tick = tick_rx.recv() => match tick {
                        Some(asset) => {
                            for address in ctx.on_price_tick(asset) {
                                spawn_prepare(&ctx, address);
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("Price fan-out stopped");
        });

        // Pool event pump: chain events through the router.
        let mut shutdown = self.shutdown_signal();
        let event_router = router.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = pool_events.next() => match event {
                        Some(event) => {
                            if let Err(e) = event_router.handle(event).await {
                                warn!(error = %e, "Pool event handling failed");
                            }
                        }
                        None => {
                            warn!("Pool event stream ended");
                            break;
                        }
                    }
                }
            }
            debug!("Pool event pump stopped");
        });

        // Borrower-updated fan-out from the router.
        let ctx = self.ctx.clone();
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    update = updates_rx.recv() => match update {
                        Some(address) => {
                            if ctx.recompute(address) {
                                spawn_prepare(&ctx, address);
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("Borrower update fan-out stopped");
        });

        // Block loop runs on this task until shutdown.
        let shutdown = self.shutdown_signal();
        let result = self.run_block_loop(shutdown).await;
        if let Err(e) = &result {
            error!(error = %e, "Block loop exited with error");
        }
        info!("Engine stopped");
        result
    }
}
