//! Asset catalog with lazy decimals resolution.
//!
//! Assets are declared in configuration (symbol, address, optional decimals
//! and liquidation threshold). Decimals for assets the config leaves open are
//! resolved from chain once and memoized process-wide; a resolution failure
//! keeps the last known value in place.

use std::collections::HashMap;

use alloy::primitives::Address;
use anyhow::Result;
use dashmap::DashMap;
use tracing::{debug, warn};

use sentinel_chain::ChainClient;

use crate::config::AssetSettings;

/// Liquidation threshold applied when the config does not pin one.
pub const DEFAULT_LIQUIDATION_THRESHOLD: f64 = 0.75;

/// A configured asset.
#[derive(Debug, Clone)]
pub struct AssetInfo {
    pub symbol: String,
    pub address: Address,
    /// Fraction of this asset's value counting toward collateralization.
    pub liquidation_threshold: f64,
}

/// Process-wide asset lookup plus the decimals cache.
pub struct AssetCatalog {
    by_address: HashMap<Address, AssetInfo>,
    by_symbol: HashMap<String, Address>,
    /// Memoized decimals, keyed by asset address. Seeded from config where
    /// declared, extended lazily from chain.
    decimals: DashMap<Address, u8>,
}

impl AssetCatalog {
    pub fn from_settings(assets: &[AssetSettings]) -> Self {
        let mut by_address = HashMap::with_capacity(assets.len());
        let mut by_symbol = HashMap::with_capacity(assets.len());
        let decimals = DashMap::new();

        for asset in assets {
            let info = AssetInfo {
                symbol: asset.symbol.clone(),
                address: asset.address,
                liquidation_threshold: asset
                    .liquidation_threshold
                    .unwrap_or(DEFAULT_LIQUIDATION_THRESHOLD),
            };
            if let Some(d) = asset.decimals {
                decimals.insert(asset.address, d);
            }
            by_symbol.insert(asset.symbol.clone(), asset.address);
            by_address.insert(asset.address, info);
        }

        Self {
            by_address,
            by_symbol,
            decimals,
        }
    }

    pub fn get(&self, address: &Address) -> Option<&AssetInfo> {
        self.by_address.get(address)
    }

    pub fn address_of(&self, symbol: &str) -> Option<Address> {
        self.by_symbol.get(symbol).copied()
    }

    pub fn symbol_of(&self, address: &Address) -> Option<&str> {
        self.by_address.get(address).map(|a| a.symbol.as_str())
    }

    /// Liquidation threshold with the default fallback for unknown assets.
    pub fn liquidation_threshold(&self, address: &Address) -> f64 {
        self.by_address
            .get(address)
            .map(|a| a.liquidation_threshold)
            .unwrap_or(DEFAULT_LIQUIDATION_THRESHOLD)
    }

    /// Cached decimals, if known.
    pub fn decimals(&self, address: &Address) -> Option<u8> {
        self.decimals.get(address).map(|d| *d)
    }

    /// Decimals, resolving from chain on a cache miss. The resolved value is
    /// memoized; on RPC failure any previously cached value stands.
    pub async fn resolve_decimals(&self, chain: &dyn ChainClient, address: Address) -> Result<u8> {
        if let Some(d) = self.decimals.get(&address) {
            return Ok(*d);
        }

        match chain.token_decimals(address).await {
            Ok(d) => {
                debug!(asset = %address, decimals = d, "Resolved token decimals");
                self.decimals.insert(address, d);
                Ok(d)
            }
            Err(e) => {
                warn!(asset = %address, error = %e, "Decimals resolution failed");
                Err(e)
            }
        }
    }

    /// All configured asset addresses.
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.by_address.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}
