//! Agent configuration.
//!
//! Settings are loaded from a TOML file with serde defaults matching the
//! deployment baseline. Everything is hot-reloadable through
//! [`ConfigHandle::reload`] except `chain_id` and the RPC endpoints, which
//! are pinned at startup; a reload that changes them is rejected.
//!
//! The signer key is environment-only (`SIGNER_KEY`), never in TOML.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;

use sentinel_chain::RelayMode;

use crate::borrower::Bands;

/// Environment variable carrying the signer private key.
pub const SIGNER_KEY_ENV: &str = "SIGNER_KEY";

/// An asset declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetSettings {
    pub symbol: String,
    pub address: Address,
    /// Resolved lazily from chain when absent.
    #[serde(default)]
    pub decimals: Option<u8>,
    /// Defaults to 0.75 when absent.
    #[serde(default)]
    pub liquidation_threshold: Option<f64>,
}

/// Full agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Startup-only.
    pub chain_id: u64,
    pub rpc_url: String,
    #[serde(default)]
    pub ws_url: String,

    // Contract addresses.
    pub pool_address: Address,
    pub oracle_address: Address,
    #[serde(default)]
    pub flash_liquidator_address: Option<Address>,
    #[serde(default)]
    pub one_inch_router_address: Option<Address>,

    // Economics.
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u16,
    #[serde(default = "default_tx_cache_ttl_blocks")]
    pub tx_cache_ttl_blocks: u64,
    #[serde(default = "default_hf_watch")]
    pub hf_watch: f64,
    #[serde(default = "default_hf_critical")]
    pub hf_critical: f64,
    #[serde(default = "default_hf_liquidatable")]
    pub hf_liquidatable: f64,
    #[serde(default = "default_min_profit_usd")]
    pub min_profit_usd: f64,
    #[serde(default = "default_max_gas_usd")]
    pub max_gas_usd: f64,
    #[serde(default = "default_min_debt_usd")]
    pub min_debt_usd: f64,
    #[serde(default = "default_liquidation_bonus_bps")]
    pub liquidation_bonus_bps: u16,

    // Execution switches.
    #[serde(default)]
    pub enable_execution: bool,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_max_concurrent_tx")]
    pub max_concurrent_tx: usize,

    // Asset universe.
    #[serde(default)]
    pub assets: Vec<AssetSettings>,
    #[serde(default)]
    pub target_debt_assets: Vec<String>,
    #[serde(default)]
    pub target_collateral_assets: Vec<String>,
    /// Symbol used to price gas in USD.
    #[serde(default = "default_native_asset")]
    pub native_asset: String,

    // Price feeds.
    #[serde(default)]
    pub binance_symbols: Vec<String>,
    /// Binance trading pair → internal asset symbol.
    #[serde(default)]
    pub binance_symbol_map: HashMap<String, String>,
    #[serde(default)]
    pub pyth_feed_ids: Vec<String>,
    /// Pyth feed id → internal asset symbol.
    #[serde(default)]
    pub pyth_feed_map: HashMap<String, String>,
    #[serde(default = "default_price_stale_ms")]
    pub price_stale_ms: u64,
    #[serde(
        default = "default_price_update_debounce_ms",
        alias = "price_update_debounce"
    )]
    pub price_update_debounce_ms: u64,

    // Broadcast.
    #[serde(default)]
    pub relay_mode: RelayMode,
    #[serde(default)]
    pub private_relay_url: Option<String>,
    #[serde(default = "default_tx_timeout_secs")]
    pub tx_timeout_secs: u64,

    // Timers and bootstrap.
    #[serde(
        default = "default_block_poll_interval_ms",
        alias = "block_poll_interval"
    )]
    pub block_poll_interval_ms: u64,
    #[serde(default)]
    pub event_confirmations: u64,
    #[serde(default = "default_seed_lookback_blocks")]
    pub seed_lookback_blocks: u64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    // Observability.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub notifier_url: Option<String>,
}

fn default_max_slippage_bps() -> u16 {
    50
}
fn default_tx_cache_ttl_blocks() -> u64 {
    5
}
fn default_hf_watch() -> f64 {
    1.10
}
fn default_hf_critical() -> f64 {
    1.04
}
fn default_hf_liquidatable() -> f64 {
    1.000
}
fn default_min_profit_usd() -> f64 {
    50.0
}
fn default_max_gas_usd() -> f64 {
    20.0
}
fn default_min_debt_usd() -> f64 {
    50.0
}
fn default_liquidation_bonus_bps() -> u16 {
    500
}
fn default_true() -> bool {
    true
}
fn default_max_concurrent_tx() -> usize {
    1
}
fn default_native_asset() -> String {
    "WETH".to_string()
}
fn default_price_stale_ms() -> u64 {
    5_000
}
fn default_price_update_debounce_ms() -> u64 {
    500
}
fn default_tx_timeout_secs() -> u64 {
    30
}
fn default_block_poll_interval_ms() -> u64 {
    1_000
}
fn default_seed_lookback_blocks() -> u64 {
    100_000
}
fn default_max_candidates() -> usize {
    50_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load and validate settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let settings: Self = toml::from_str(&content).context("parsing config TOML")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Startup validation. Fatal on failure.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            bail!("rpc_url must not be empty");
        }
        if self.pool_address == Address::ZERO {
            bail!("pool_address must not be empty");
        }
        if !(self.hf_watch > self.hf_critical && self.hf_critical > self.hf_liquidatable) {
            bail!(
                "health factor bands must satisfy hf_watch > hf_critical > hf_liquidatable \
                 (got {} / {} / {})",
                self.hf_watch,
                self.hf_critical,
                self.hf_liquidatable
            );
        }
        if self.hf_liquidatable < 0.0 {
            bail!("hf_liquidatable must be non-negative");
        }
        if self.enable_execution && !self.dry_run && std::env::var(SIGNER_KEY_ENV).is_err() {
            bail!("{SIGNER_KEY_ENV} is required when execution is enabled and dry_run is off");
        }
        Ok(())
    }

    pub fn bands(&self) -> Bands {
        Bands {
            watch: self.hf_watch,
            critical: self.hf_critical,
            liquidatable: self.hf_liquidatable,
        }
    }

    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_ms)
    }

    pub fn price_stale(&self) -> Duration {
        Duration::from_millis(self.price_stale_ms)
    }

    pub fn price_update_debounce(&self) -> Duration {
        Duration::from_millis(self.price_update_debounce_ms)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }

    pub fn liquidation_bonus(&self) -> f64 {
        self.liquidation_bonus_bps as f64 / 10_000.0
    }
}

/// Shared, reloadable settings handle.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Settings>>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = Settings::load(&path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
            path: Some(path),
        })
    }

    /// Wrap fixed settings (tests, embedders).
    pub fn fixed(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
            path: None,
        }
    }

    /// Current settings snapshot. Cheap; callers hold the `Arc` for the
    /// duration of one operation so a concurrent reload cannot tear it.
    pub fn current(&self) -> Arc<Settings> {
        self.inner.read().clone()
    }

    /// Re-read the config file and swap the snapshot. Startup-only fields
    /// must not change.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            bail!("config handle has no backing file");
        };
        let fresh = Settings::load(path)?;
        let current = self.current();
        if fresh.chain_id != current.chain_id
            || fresh.rpc_url != current.rpc_url
            || fresh.ws_url != current.ws_url
        {
            bail!("chain_id and RPC endpoints are startup-only; restart to change them");
        }
        *self.inner.write() = Arc::new(fresh);
        tracing::info!("Configuration reloaded");
        Ok(())
    }
}
