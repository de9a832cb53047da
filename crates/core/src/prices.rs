//! Price aggregator: multi-source fan-in, debounce, staleness, policy gate.
//!
//! Two feed connectors push updates in; the per-asset slot keeps the latest
//! value (last-writer-wins by arrival order). Emission of the aggregator-
//! level price tick is debounced per asset: rapid successive writes within
//! one window collapse into exactly one notification.
//!
//! The policy gate (`can_execute`) and the staleness predicate (`is_stale`)
//! are deliberately distinct: a single live source is sufficient to execute,
//! while any stale connected source is a warn-signal during preparation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sentinel_api::{FeedUpdate, PriceSource};

/// Millisecond sentinel for "no update received yet".
const NEVER: u64 = u64::MAX;

/// Latest observation for one asset.
#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub price_usd: f64,
    pub captured_at: Instant,
    pub source: PriceSource,
}

/// Per-source connection and freshness tracking.
struct SourceHealth {
    configured: bool,
    connected: AtomicBool,
    /// Milliseconds since the aggregator epoch; `NEVER` before first update.
    last_update_ms: AtomicU64,
}

impl SourceHealth {
    fn new(configured: bool) -> Self {
        Self {
            configured,
            connected: AtomicBool::new(false),
            last_update_ms: AtomicU64::new(NEVER),
        }
    }
}

/// Shared price fan-in hub.
pub struct PriceAggregator {
    slots: DashMap<Address, PricePoint>,
    /// Debounce generation per asset; a pending emission fires only if its
    /// generation is still current when the window closes.
    generations: DashMap<Address, u64>,
    binance_map: HashMap<String, Address>,
    pyth_map: HashMap<String, Address>,
    sources: [SourceHealth; PriceSource::COUNT],
    /// Tokio clock so liveness follows the same timeline as the debounce.
    epoch: tokio::time::Instant,
    stale_after: Duration,
    debounce: Duration,
    tick_tx: mpsc::Sender<Address>,
    /// Self-handle for the spawned debounce timers.
    me: Weak<PriceAggregator>,
}

impl PriceAggregator {
    /// Build the aggregator and the receiving end of its tick channel.
    pub fn new(
        binance_map: HashMap<String, Address>,
        pyth_map: HashMap<String, Address>,
        stale_after: Duration,
        debounce: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Address>) {
        let (tick_tx, tick_rx) = mpsc::channel(1024);
        let sources = [
            SourceHealth::new(!binance_map.is_empty()),
            SourceHealth::new(!pyth_map.is_empty()),
        ];

        let aggregator = Arc::new_cyclic(|me| Self {
            slots: DashMap::new(),
            generations: DashMap::new(),
            binance_map,
            pyth_map,
            sources,
            epoch: tokio::time::Instant::now(),
            stale_after,
            debounce,
            tick_tx,
            me: me.clone(),
        });

        (aggregator, tick_rx)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Map a feed symbol to the internal asset address.
    fn asset_for(&self, update: &FeedUpdate) -> Option<Address> {
        match update.source {
            PriceSource::Binance => self.binance_map.get(&update.symbol).copied(),
            PriceSource::Pyth => self.pyth_map.get(&update.symbol).copied(),
        }
    }

    /// Ingest one feed observation: overwrite the slot, refresh the source
    /// liveness, and (re)start the debounced emission for the asset.
    pub fn ingest(&self, update: FeedUpdate) {
        if update.price_usd <= 0.0 {
            warn!(source = %update.source, symbol = %update.symbol, "Non-positive price dropped");
            return;
        }
        let Some(asset) = self.asset_for(&update) else {
            debug!(source = %update.source, symbol = %update.symbol, "Unmapped feed symbol");
            return;
        };

        self.write_slot(
            asset,
            PricePoint {
                price_usd: update.price_usd,
                captured_at: Instant::now(),
                source: update.source,
            },
        );
        self.schedule_tick(asset);
    }

    /// Unconditional last-writer-wins slot write plus liveness refresh.
    pub(crate) fn write_slot(&self, asset: Address, point: PricePoint) {
        self.sources[point.source.index()]
            .last_update_ms
            .store(self.now_ms(), Ordering::Relaxed);
        self.slots.insert(asset, point);
    }

    /// Start (or restart) the debounce window for an asset. Any newer write
    /// bumps the generation, cancelling the pending emission.
    fn schedule_tick(&self, asset: Address) {
        let generation = {
            let mut entry = self.generations.entry(asset).or_insert(0);
            *entry += 1;
            *entry
        };

        let Some(aggregator) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(aggregator.debounce).await;
            let current = aggregator.generations.get(&asset).map(|g| *g);
            if current == Some(generation) {
                if aggregator.tick_tx.send(asset).await.is_err() {
                    debug!("Price tick channel closed");
                }
            }
        });
    }

    /// Record a connector's connection state change.
    pub fn mark_connected(&self, source: PriceSource, connected: bool) {
        self.sources[source.index()]
            .connected
            .store(connected, Ordering::Relaxed);
        if connected {
            info!(source = %source, "Price source connected");
        } else {
            warn!(source = %source, "Price source disconnected");
        }
    }

    /// Latest cached price for an asset.
    pub fn price(&self, asset: &Address) -> Option<f64> {
        self.slots.get(asset).map(|p| p.price_usd)
    }

    pub fn point(&self, asset: &Address) -> Option<PricePoint> {
        self.slots.get(asset).map(|p| *p)
    }

    fn source_live(&self, source: &SourceHealth) -> bool {
        if !source.connected.load(Ordering::Relaxed) {
            return false;
        }
        match source.last_update_ms.load(Ordering::Relaxed) {
            NEVER => false,
            last => self.now_ms().saturating_sub(last) <= self.stale_after.as_millis() as u64,
        }
    }

    /// Policy gate: execution is allowed iff at least one source is live.
    /// Total silence fails closed.
    pub fn can_execute(&self) -> bool {
        self.sources
            .iter()
            .filter(|s| s.configured)
            .any(|s| self.source_live(s))
    }

    /// Warn-signal used during preparation: true iff any configured and
    /// connected source has gone quiet past the staleness threshold.
    pub fn is_stale(&self) -> bool {
        self.sources
            .iter()
            .filter(|s| s.configured && s.connected.load(Ordering::Relaxed))
            .any(|s| !self.source_live(s))
    }

    /// Whether any configured source is currently connected.
    pub fn any_connected(&self) -> bool {
        self.sources
            .iter()
            .filter(|s| s.configured)
            .any(|s| s.connected.load(Ordering::Relaxed))
    }

    pub fn price_count(&self) -> usize {
        self.slots.len()
    }
}
