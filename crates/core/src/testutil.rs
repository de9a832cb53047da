//! Shared mocks and fixtures for the core test modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use sentinel_api::{
    AuditEvent, Notifier, PriceSource, QuoteRequest, SwapQuote, SwapQuoter,
};
use sentinel_chain::{
    AccountData, CallSpec, ChainClient, FeeData, FeeSnapshot, LiquidationExecutor,
};

use crate::assets::AssetCatalog;
use crate::config::{ConfigHandle, Settings};
use crate::engine::EngineContext;
use crate::prices::{PriceAggregator, PricePoint};
use crate::registry::BorrowerRegistry;

pub(crate) const WETH: Address = Address::repeat_byte(0xA1);
pub(crate) const USDC: Address = Address::repeat_byte(0xB2);

/// Configurable in-memory chain.
pub(crate) struct MockChain {
    supplied: DashMap<(Address, Address), U256>,
    borrowed: DashMap<(Address, Address), U256>,
    oracle_prices: DashMap<Address, f64>,
    decimals: DashMap<Address, u8>,
    account_hf: DashMap<Address, f64>,
    block_number: AtomicU64,
    fail_oracle: AtomicBool,
    fail_balances: AtomicBool,
}

impl MockChain {
    pub(crate) fn new() -> Self {
        let chain = Self {
            supplied: DashMap::new(),
            borrowed: DashMap::new(),
            oracle_prices: DashMap::new(),
            decimals: DashMap::new(),
            account_hf: DashMap::new(),
            block_number: AtomicU64::new(1_000),
            fail_oracle: AtomicBool::new(false),
            fail_balances: AtomicBool::new(false),
        };
        chain.oracle_prices.insert(WETH, 2_000.0);
        chain.oracle_prices.insert(USDC, 1.0);
        chain.decimals.insert(WETH, 18);
        chain.decimals.insert(USDC, 6);
        chain
    }

    pub(crate) fn set_supplied(&self, asset: Address, user: Address, amount: U256) {
        self.supplied.insert((asset, user), amount);
    }

    pub(crate) fn set_borrowed(&self, asset: Address, user: Address, amount: U256) {
        self.borrowed.insert((asset, user), amount);
    }

    pub(crate) fn set_account_hf(&self, user: Address, hf: f64) {
        self.account_hf.insert(user, hf);
    }

    pub(crate) fn set_block_number(&self, block: u64) {
        self.block_number.store(block, Ordering::Relaxed);
    }

    pub(crate) fn fail_oracle(&self, fail: bool) {
        self.fail_oracle.store(fail, Ordering::Relaxed);
    }

    pub(crate) fn fail_balances(&self, fail: bool) {
        self.fail_balances.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.block_number.load(Ordering::Relaxed))
    }

    async fn fee_data(&self) -> Result<FeeData> {
        Ok(FeeData {
            base_fee: 1_000_000_000,
            priority_fee: 100_000_000,
        })
    }

    async fn supplied_balance(&self, asset: Address, user: Address) -> Result<U256> {
        if self.fail_balances.load(Ordering::Relaxed) {
            anyhow::bail!("balance read failed")
        }
        Ok(self
            .supplied
            .get(&(asset, user))
            .map(|v| *v)
            .unwrap_or(U256::ZERO))
    }

    async fn borrowed_balance(&self, asset: Address, user: Address) -> Result<U256> {
        if self.fail_balances.load(Ordering::Relaxed) {
            anyhow::bail!("balance read failed")
        }
        Ok(self
            .borrowed
            .get(&(asset, user))
            .map(|v| *v)
            .unwrap_or(U256::ZERO))
    }

    async fn token_decimals(&self, asset: Address) -> Result<u8> {
        self.decimals
            .get(&asset)
            .map(|d| *d)
            .ok_or_else(|| anyhow::anyhow!("unknown token"))
    }

    async fn oracle_price_usd(&self, asset: Address) -> Result<f64> {
        if self.fail_oracle.load(Ordering::Relaxed) {
            anyhow::bail!("oracle read failed")
        }
        self.oracle_prices
            .get(&asset)
            .map(|p| *p)
            .ok_or_else(|| anyhow::anyhow!("no oracle price"))
    }

    async fn account_data(&self, user: Address) -> Result<AccountData> {
        let hf = self.account_hf.get(&user).map(|h| *h).unwrap_or(1.5);
        Ok(AccountData {
            total_collateral_usd: 0.0,
            total_debt_usd: 0.0,
            health_factor: hf,
        })
    }
}

/// Executor recording every interaction.
pub(crate) struct MockExecutor {
    simulations: AtomicUsize,
    dispatches: AtomicUsize,
    fail_simulation: AtomicBool,
    fail_dispatch: AtomicBool,
    simulation_delay_ms: AtomicU64,
    gas_estimate: AtomicU64,
}

impl MockExecutor {
    pub(crate) fn new() -> Self {
        Self {
            simulations: AtomicUsize::new(0),
            dispatches: AtomicUsize::new(0),
            fail_simulation: AtomicBool::new(false),
            fail_dispatch: AtomicBool::new(false),
            simulation_delay_ms: AtomicU64::new(0),
            gas_estimate: AtomicU64::new(500_000),
        }
    }

    pub(crate) fn simulations(&self) -> usize {
        self.simulations.load(Ordering::SeqCst)
    }

    pub(crate) fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_simulation(&self, fail: bool) {
        self.fail_simulation.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_dispatch(&self, fail: bool) {
        self.fail_dispatch.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn delay_simulation_ms(&self, ms: u64) {
        self.simulation_delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl LiquidationExecutor for MockExecutor {
    async fn simulate(&self, _call: &CallSpec) -> Result<()> {
        let delay = self.simulation_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.simulations.fetch_add(1, Ordering::SeqCst);
        if self.fail_simulation.load(Ordering::SeqCst) {
            anyhow::bail!("execution reverted")
        }
        Ok(())
    }

    async fn estimate_gas(&self, _call: &CallSpec) -> Result<u64> {
        Ok(self.gas_estimate.load(Ordering::SeqCst))
    }

    async fn dispatch(&self, _call: &CallSpec, _gas_limit: u64, _fees: FeeData) -> Result<B256> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        if self.fail_dispatch.load(Ordering::SeqCst) {
            anyhow::bail!("broadcast failed")
        }
        Ok(B256::repeat_byte(0x42))
    }
}

/// Quoter returning a fixed opaque payload.
pub(crate) struct MockQuoter {
    calls: AtomicUsize,
}

impl MockQuoter {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwapQuoter for MockQuoter {
    async fn quote(&self, request: QuoteRequest) -> Result<SwapQuote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let estimated = request.amount_in * U256::from(99u64) / U256::from(100u64);
        Ok(SwapQuote {
            payload: alloy::primitives::Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            min_out: SwapQuote::min_out_after_slippage(estimated, request.slippage_bps),
            estimated_out: estimated,
        })
    }
}

/// Notifier that records events for assertions.
pub(crate) struct RecordingNotifier {
    events: parking_lot::Mutex<Vec<AuditEvent>>,
}

impl RecordingNotifier {
    pub(crate) fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Scenario knobs for building a test context.
pub(crate) struct FeedScript {
    live: bool,
    armed: bool,
    min_profit_usd: f64,
    flash: bool,
    max_candidates: usize,
}

impl FeedScript {
    /// Both sources connected and fresh.
    pub(crate) fn bothlive() -> Self {
        Self {
            live: true,
            armed: false,
            min_profit_usd: 50.0,
            flash: true,
            max_candidates: 50_000,
        }
    }

    /// Prices cached but every source disconnected.
    pub(crate) fn silent() -> Self {
        Self {
            live: false,
            ..Self::bothlive()
        }
    }

    /// Execution enabled, dry-run off.
    pub(crate) fn armed(mut self) -> Self {
        self.armed = true;
        self
    }

    pub(crate) fn with_min_profit(mut self, min_profit_usd: f64) -> Self {
        self.min_profit_usd = min_profit_usd;
        self
    }

    /// Direct-mode deployment without a flash liquidator.
    pub(crate) fn without_flash(mut self) -> Self {
        self.flash = false;
        self
    }

    pub(crate) fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates;
        self
    }
}

/// A fully wired context over mocks.
pub(crate) struct Harness {
    pub(crate) ctx: Arc<EngineContext>,
    pub(crate) chain: Arc<MockChain>,
    pub(crate) executor: Arc<MockExecutor>,
    pub(crate) quoter: Arc<MockQuoter>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    /// Kept alive so debounced ticks have somewhere to go.
    #[allow(dead_code)]
    pub(crate) ticks: mpsc::Receiver<Address>,
}

fn test_settings(script: &FeedScript) -> Settings {
    let flash_line = if script.flash {
        "flash_liquidator_address = \"0xfcfcfcfcfcfcfcfcfcfcfcfcfcfcfcfcfcfcfcfc\"\n"
    } else {
        ""
    };
    let raw = format!(
        r#"
chain_id = 1
rpc_url = "http://localhost:8545"
pool_address = "0xcccccccccccccccccccccccccccccccccccccccc"
oracle_address = "0xdddddddddddddddddddddddddddddddddddddddd"
{flash_line}min_profit_usd = {min_profit}
enable_execution = {armed}
dry_run = {dry_run}
max_candidates = {max_candidates}
target_debt_assets = ["USDC"]
target_collateral_assets = ["WETH"]
native_asset = "WETH"

[[assets]]
symbol = "WETH"
address = "0xa1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1"
decimals = 18
liquidation_threshold = 0.825

[[assets]]
symbol = "USDC"
address = "0xb2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2"
decimals = 6
liquidation_threshold = 0.85
"#,
        min_profit = script.min_profit_usd,
        armed = script.armed,
        dry_run = !script.armed,
        max_candidates = script.max_candidates,
    );
    toml::from_str(&raw).expect("test settings parse")
}

/// Build an [`EngineContext`] over the mocks for the given scenario.
pub(crate) fn test_context(script: FeedScript) -> Harness {
    let settings = test_settings(&script);
    let catalog = AssetCatalog::from_settings(&settings.assets);

    let mut binance_map = HashMap::new();
    binance_map.insert("ETHUSDT".to_string(), WETH);
    let mut pyth_map = HashMap::new();
    pyth_map.insert("0xfeed".to_string(), USDC);

    let (prices, ticks) = PriceAggregator::new(
        binance_map,
        pyth_map,
        settings.price_stale(),
        settings.price_update_debounce(),
    );

    // WETH via Binance, USDC via Pyth: both sources fresh when live.
    prices.write_slot(
        WETH,
        PricePoint {
            price_usd: 2_000.0,
            captured_at: std::time::Instant::now(),
            source: PriceSource::Binance,
        },
    );
    prices.write_slot(
        USDC,
        PricePoint {
            price_usd: 1.0,
            captured_at: std::time::Instant::now(),
            source: PriceSource::Pyth,
        },
    );
    if script.live {
        prices.mark_connected(PriceSource::Binance, true);
        prices.mark_connected(PriceSource::Pyth, true);
    }

    let chain = Arc::new(MockChain::new());
    let executor = Arc::new(MockExecutor::new());
    let quoter = Arc::new(MockQuoter::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let ctx = Arc::new(EngineContext {
        config: ConfigHandle::fixed(settings),
        registry: BorrowerRegistry::new(),
        prices,
        catalog,
        chain: chain.clone(),
        executor: executor.clone(),
        quoter: quoter.clone(),
        notifier: notifier.clone(),
        fees: FeeSnapshot::new(),
        latest_block: AtomicU64::new(1_000),
        active_executions: AtomicUsize::new(0),
    });
    ctx.fees.update(FeeData {
        base_fee: 1_000_000_000,
        priority_fee: 100_000_000,
    });

    Harness {
        ctx,
        chain,
        executor,
        quoter,
        notifier,
        ticks,
    }
}

/// Catalog with the two standard test assets.
pub(crate) fn catalog_weth_usdc() -> AssetCatalog {
    AssetCatalog::from_settings(&[
        crate::config::AssetSettings {
            symbol: "WETH".to_string(),
            address: WETH,
            decimals: Some(18),
            liquidation_threshold: Some(0.825),
        },
        crate::config::AssetSettings {
            symbol: "USDC".to_string(),
            address: USDC,
            decimals: Some(6),
            liquidation_threshold: Some(0.85),
        },
    ])
}

/// Standalone aggregator seeded with fixed prices.
pub(crate) fn prices_with(prices: &[(Address, f64)]) -> Arc<PriceAggregator> {
    let (aggregator, _ticks) = PriceAggregator::new(
        HashMap::new(),
        HashMap::new(),
        std::time::Duration::from_secs(5),
        std::time::Duration::from_millis(1),
    );
    for (asset, price) in prices {
        aggregator.write_slot(
            *asset,
            PricePoint {
                price_usd: *price,
                captured_at: std::time::Instant::now(),
                source: PriceSource::Binance,
            },
        );
    }
    aggregator
}
