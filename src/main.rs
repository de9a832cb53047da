//! Liquidation agent for Aave-v3-style lending pools.
//!
//! Event-driven architecture:
//! - Pool events over WebSocket drive borrower balance refreshes
//! - Two off-chain price feeds (Binance, Pyth) feed the aggregator
//! - CRITICAL borrowers get a simulated, cached liquidation transaction
//! - The block loop promotes borrowers across bands and executes at the
//!   liquidation boundary, gated by profitability and feed liveness
//!
//! Configuration comes from a TOML file (`SENTINEL_CONFIG`, defaulting to
//! `config/default.toml`); the signer key is environment-only.

use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sentinel_api::{
    BinanceFeed, NullNotifier, Notifier, OneInchQuoter, PythFeed, WebhookNotifier,
};
use sentinel_chain::{
    ContractExecutor, FeeSnapshot, PoolEventListener, RpcClient, TransactionSender,
};
use sentinel_core::{
    AssetCatalog, BorrowerRegistry, ConfigHandle, Engine, EngineContext, PriceAggregator,
    SIGNER_KEY_ENV,
};

/// Environment variable selecting the config file.
const CONFIG_ENV: &str = "SENTINEL_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = ConfigHandle::load(&config_path)?;
    let settings = config.current();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{level},sentinel_core={level},sentinel_chain={level}",
                level = settings.log_level
            ))
        }))
        .init();

    info!(config = %config_path, chain_id = settings.chain_id, "Starting liquidation agent");
    info!(
        pool = %settings.pool_address,
        oracle = %settings.oracle_address,
        flash = ?settings.flash_liquidator_address,
        dry_run = settings.dry_run,
        enable_execution = settings.enable_execution,
        "Deployment"
    );

    let engine = build_engine(&config).await?;

    // Feed connectors push into the aggregator channel.
    let (feed_tx, feed_rx) = tokio::sync::mpsc::channel(4096);
    let binance = BinanceFeed::new(settings.binance_symbols.clone());
    let pyth = PythFeed::new(settings.pyth_feed_ids.clone());
    tokio::spawn(binance.run(feed_tx.clone(), engine.shutdown_signal()));
    tokio::spawn(pyth.run(feed_tx, engine.shutdown_signal()));

    // Pool event subscription with reconnect-on-close.
    let listener = PoolEventListener::new(&settings.ws_url, settings.pool_address);
    let pool_events = subscribe_with_retry(&listener).await?;

    // Ctrl-C triggers cooperative shutdown.
    let shutdown_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_engine.shutdown();
        }
    });

    // SIGHUP hot-reloads the configuration file.
    #[cfg(unix)]
    {
        let reload_config = config.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut hangup) = signal(SignalKind::hangup()) else {
                return;
            };
            while hangup.recv().await.is_some() {
                if let Err(e) = reload_config.reload() {
                    warn!(error = %e, "Config reload rejected");
                }
            }
        });
    }

    let tick_rx = engine
        .take_tick_rx()
        .context("tick receiver already taken")?;
    engine.run(feed_rx, tick_rx, pool_events).await
}

/// Construct the engine context from configuration.
async fn build_engine(config: &ConfigHandle) -> Result<Arc<EngineWithTicks>> {
    let settings = config.current();

    let chain = Arc::new(
        RpcClient::connect(
            &settings.rpc_url,
            settings.pool_address,
            settings.oracle_address,
        )
        .await?,
    );

    // Resolve feed symbol maps against the asset catalog.
    let catalog = AssetCatalog::from_settings(&settings.assets);
    let binance_map = settings
        .binance_symbol_map
        .iter()
        .filter_map(|(pair, symbol)| catalog.address_of(symbol).map(|a| (pair.clone(), a)))
        .collect();
    let pyth_map = settings
        .pyth_feed_map
        .iter()
        .filter_map(|(feed, symbol)| catalog.address_of(symbol).map(|a| (feed.clone(), a)))
        .collect();
    let (prices, tick_rx) = PriceAggregator::new(
        binance_map,
        pyth_map,
        settings.price_stale(),
        settings.price_update_debounce(),
    );
    info!(assets = catalog.len(), "Asset catalog loaded");

    // The sender exists only when the agent is armed.
    let sender = if settings.enable_execution && !settings.dry_run {
        let key = std::env::var(SIGNER_KEY_ENV)
            .with_context(|| format!("missing env var {SIGNER_KEY_ENV}"))?;
        Some(Arc::new(
            TransactionSender::new(
                &key,
                &settings.rpc_url,
                settings.chain_id,
                settings.relay_mode,
                settings.private_relay_url.as_deref(),
                settings.tx_timeout(),
            )
            .await?,
        ))
    } else {
        info!("Running unarmed (dry-run or execution disabled), no signer loaded");
        None
    };

    let from = sender
        .as_ref()
        .map(|s| s.address)
        .unwrap_or(alloy::primitives::Address::ZERO);
    let executor = Arc::new(ContractExecutor::new(&settings.rpc_url, from, sender));

    let quoter = Arc::new(OneInchQuoter::new(
        "https://api.1inch.dev",
        settings.chain_id,
        settings
            .one_inch_router_address
            .unwrap_or(alloy::primitives::Address::ZERO),
    ));

    let notifier: Arc<dyn Notifier> = match &settings.notifier_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(NullNotifier),
    };

    let ctx = Arc::new(EngineContext {
        config: config.clone(),
        registry: BorrowerRegistry::new(),
        prices,
        catalog,
        chain,
        executor,
        quoter,
        notifier,
        fees: FeeSnapshot::new(),
        latest_block: AtomicU64::new(0),
        active_executions: AtomicUsize::new(0),
    });

    info!("All components initialized");
    Ok(Arc::new(EngineWithTicks::new(ctx, tick_rx)))
}

/// Engine plus the one-shot tick receiver handed to `run`.
struct EngineWithTicks {
    engine: Engine,
    tick_rx: parking_lot::Mutex<Option<tokio::sync::mpsc::Receiver<alloy::primitives::Address>>>,
}

impl EngineWithTicks {
    fn new(
        ctx: Arc<EngineContext>,
        tick_rx: tokio::sync::mpsc::Receiver<alloy::primitives::Address>,
    ) -> Self {
        Self {
            engine: Engine::new(ctx),
            tick_rx: parking_lot::Mutex::new(Some(tick_rx)),
        }
    }

    fn take_tick_rx(
        &self,
    ) -> Option<tokio::sync::mpsc::Receiver<alloy::primitives::Address>> {
        self.tick_rx.lock().take()
    }
}

impl std::ops::Deref for EngineWithTicks {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}

/// Subscribe to pool events, retrying with a short backoff while the node
/// comes up.
async fn subscribe_with_retry(
    listener: &PoolEventListener,
) -> Result<impl futures::Stream<Item = sentinel_chain::PoolEvent> + Send + Unpin + 'static> {
    let mut attempts = 0u32;
    loop {
        match listener.subscribe().await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempts < 5 => {
                attempts += 1;
                warn!(error = %e, attempt = attempts, "Pool subscription failed, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(attempts as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
