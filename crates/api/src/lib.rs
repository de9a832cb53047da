//! External service clients for the liquidation agent.
//!
//! This crate provides the off-chain collaborators the core engine consumes:
//! - Binance and Pyth price feed connectors (push streams into the aggregator)
//! - 1inch-style swap quoter for flash-liquidation swap payloads
//! - Best-effort webhook notifier for the audit channel

mod binance;
mod feed;
mod notifier;
mod pyth;
mod quoter;

pub use binance::BinanceFeed;
pub use feed::{FeedEvent, FeedUpdate, PriceSource};
pub use notifier::{AuditEvent, Notifier, NullNotifier, WebhookNotifier};
pub use pyth::PythFeed;
pub use quoter::{OneInchQuoter, QuoteRequest, SwapQuote, SwapQuoter};
