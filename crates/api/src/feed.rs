//! Common types emitted by the price feed connectors.

use std::fmt;

/// Identity of an off-chain price source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceSource {
    Binance,
    Pyth,
}

impl PriceSource {
    /// Stable index for per-source bookkeeping arrays.
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        match self {
            Self::Binance => 0,
            Self::Pyth => 1,
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binance => write!(f, "binance"),
            Self::Pyth => write!(f, "pyth"),
        }
    }
}

/// A single price observation as published by a feed.
///
/// `symbol` is the feed's own identifier (a Binance trading pair or a Pyth
/// feed id); mapping to internal asset names happens in the aggregator.
#[derive(Debug, Clone)]
pub struct FeedUpdate {
    pub source: PriceSource,
    pub symbol: String,
    pub price_usd: f64,
    /// Publish time reported by the feed (unix seconds), when available.
    pub published_at: Option<u64>,
}

/// Events pushed by a connector into the aggregator channel.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Connected(PriceSource),
    Disconnected(PriceSource),
    Price(FeedUpdate),
}
