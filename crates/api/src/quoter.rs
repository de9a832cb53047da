//! Swap quoter client for flash-liquidation payloads.
//!
//! Wraps a 1inch-style aggregator API: given a sell/buy pair and an input
//! amount it returns the opaque router calldata plus the estimated output.
//! The minimum acceptable output applies the configured slippage tolerance
//! in basis points. Quotes for repeated prepare attempts are cached briefly
//! keyed by pair and bucketed amount.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, Bytes, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, instrument};

const BPS_DENOMINATOR: u64 = 10_000;

/// Parameters for a swap quote request.
#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub sell_asset: Address,
    pub buy_asset: Address,
    pub amount_in: U256,
    pub recipient: Address,
    /// Slippage tolerance in basis points applied to the estimated output.
    pub slippage_bps: u16,
}

/// A swap route quote with encoded router payload.
#[derive(Debug, Clone)]
pub struct SwapQuote {
    /// Opaque calldata for the configured router.
    pub payload: Bytes,
    /// Estimated output amount in the buy asset's base units.
    pub estimated_out: U256,
    /// Estimated output minus the slippage tolerance.
    pub min_out: U256,
}

impl SwapQuote {
    /// min_out = estimated × (10000 − slippage_bps) / 10000
    pub fn min_out_after_slippage(estimated: U256, slippage_bps: u16) -> U256 {
        let keep = U256::from(BPS_DENOMINATOR.saturating_sub(slippage_bps as u64));
        estimated * keep / U256::from(BPS_DENOMINATOR)
    }
}

/// External swap quoter interface.
#[async_trait]
pub trait SwapQuoter: Send + Sync {
    async fn quote(&self, request: QuoteRequest) -> Result<SwapQuote>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct QuoteKey {
    sell: Address,
    buy: Address,
    /// Amounts bucketed to the top two decimal orders so near-identical
    /// prepare attempts share a cache entry.
    amount_bucket: u64,
}

#[derive(Clone)]
struct CachedQuote {
    quote: SwapQuote,
    cached_at: Instant,
}

#[derive(Debug, Deserialize)]
struct SwapResponse {
    tx: SwapTx,
    #[serde(rename = "dstAmount")]
    dst_amount: String,
}

#[derive(Debug, Deserialize)]
struct SwapTx {
    data: String,
}

/// HTTP client for a 1inch-compatible swap API.
pub struct OneInchQuoter {
    client: reqwest::Client,
    base_url: String,
    chain_id: u64,
    router: Address,
    cache: Arc<DashMap<QuoteKey, CachedQuote>>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for OneInchQuoter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneInchQuoter")
            .field("base_url", &self.base_url)
            .field("chain_id", &self.chain_id)
            .field("router", &self.router)
            .field("cache_size", &self.cache.len())
            .finish()
    }
}

impl OneInchQuoter {
    pub fn new(base_url: impl Into<String>, chain_id: u64, router: Address) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            chain_id,
            router,
            cache: Arc::new(DashMap::new()),
            cache_ttl: Duration::from_secs(5),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// The router contract the returned payloads target.
    pub fn router(&self) -> Address {
        self.router
    }

    fn cache_key(request: &QuoteRequest) -> QuoteKey {
        // Keep the two most significant digits of the amount.
        let approx: u64 = request
            .amount_in
            .to_string()
            .chars()
            .take(2)
            .chain(std::iter::repeat('0').take(request.amount_in.to_string().len().saturating_sub(2)))
            .collect::<String>()
            .parse()
            .unwrap_or(0);

        QuoteKey {
            sell: request.sell_asset,
            buy: request.buy_asset,
            amount_bucket: approx,
        }
    }
}

#[async_trait]
impl SwapQuoter for OneInchQuoter {
    #[instrument(skip(self), fields(sell = %request.sell_asset, buy = %request.buy_asset))]
    async fn quote(&self, request: QuoteRequest) -> Result<SwapQuote> {
        let key = Self::cache_key(&request);
        if let Some(cached) = self.cache.get(&key) {
            if cached.cached_at.elapsed() < self.cache_ttl {
                debug!("Swap quote served from cache");
                return Ok(cached.quote.clone());
            }
        }

        let url = format!("{}/swap/v6.0/{}/swap", self.base_url, self.chain_id);
        let amount = request.amount_in.to_string();
        let resp: SwapResponse = self
            .client
            .get(&url)
            .query(&[
                ("src", format!("{:#x}", request.sell_asset)),
                ("dst", format!("{:#x}", request.buy_asset)),
                ("amount", amount),
                ("from", format!("{:#x}", request.recipient)),
                ("receiver", format!("{:#x}", request.recipient)),
                ("slippage", format!("{}", request.slippage_bps as f64 / 100.0)),
                ("disableEstimate", "true".to_string()),
            ])
            .send()
            .await
            .context("swap quoter request failed")?
            .error_for_status()?
            .json()
            .await
            .context("swap quoter returned malformed body")?;

        let payload: Bytes = resp
            .tx
            .data
            .parse()
            .context("swap payload is not valid hex")?;
        let estimated_out: U256 = resp
            .dst_amount
            .parse()
            .context("swap estimated output is not a decimal integer")?;
        let min_out = SwapQuote::min_out_after_slippage(estimated_out, request.slippage_bps);

        let quote = SwapQuote {
            payload,
            estimated_out,
            min_out,
        };

        self.cache.insert(
            key,
            CachedQuote {
                quote: quote.clone(),
                cached_at: Instant::now(),
            },
        );

        debug!(
            estimated_out = %quote.estimated_out,
            min_out = %quote.min_out,
            "Swap quote fetched"
        );
        Ok(quote)
    }
}
