//! Binance spot price feed connector.
//!
//! Polls the public ticker endpoint for the configured symbols and pushes
//! every observation into the aggregator channel. Binance is treated as a
//! plain push stream by the rest of the system; connection state changes are
//! reported so the aggregator's liveness policy sees outages immediately.

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::feed::{FeedEvent, FeedUpdate, PriceSource};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Reconnect backoff bounds.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

/// Polling connector for Binance spot prices.
pub struct BinanceFeed {
    client: reqwest::Client,
    base_url: String,
    symbols: Vec<String>,
    poll_interval: Duration,
}

impl BinanceFeed {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            symbols,
            poll_interval: Duration::from_millis(1_000),
        }
    }

    /// Override the API base URL (tests, mirrors).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the connector until shutdown. Reconnects forever with bounded
    /// backoff; emits `Connected`/`Disconnected` transitions around outages.
    pub async fn run(self, tx: mpsc::Sender<FeedEvent>, mut shutdown: watch::Receiver<bool>) {
        if self.symbols.is_empty() {
            info!("No Binance symbols configured, connector idle");
            return;
        }

        let mut backoff = BACKOFF_MIN;
        let mut connected = false;
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            match self.fetch_tickers().await {
                Ok(tickers) => {
                    if !connected {
                        connected = true;
                        backoff = BACKOFF_MIN;
                        info!(symbols = self.symbols.len(), "Binance feed connected");
                        if tx.send(FeedEvent::Connected(PriceSource::Binance)).await.is_err() {
                            break;
                        }
                    }

                    for t in tickers {
                        let Ok(price_usd) = t.price.parse::<f64>() else {
                            debug!(symbol = %t.symbol, raw = %t.price, "Unparseable ticker price");
                            continue;
                        };
                        let update = FeedUpdate {
                            source: PriceSource::Binance,
                            symbol: t.symbol,
                            price_usd,
                            published_at: None,
                        };
                        if tx.send(FeedEvent::Price(update)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    if connected {
                        connected = false;
                        warn!(error = %e, "Binance feed disconnected");
                        let _ = tx.send(FeedEvent::Disconnected(PriceSource::Binance)).await;
                    } else {
                        debug!(error = %e, "Binance poll failed while disconnected");
                    }

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }

        info!("Binance feed connector stopped");
    }

    async fn fetch_tickers(&self) -> Result<Vec<TickerPrice>> {
        // /api/v3/ticker/price takes a JSON array of symbols.
        let symbols = serde_json::to_string(&self.symbols)?;
        let url = format!("{}/api/v3/ticker/price", self.base_url);

        let resp = self
            .client
            .get(&url)
            .query(&[("symbols", symbols.as_str())])
            .send()
            .await?
            .error_for_status()?;

        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_parsing() {
        let raw = r#"[{"symbol":"ETHUSDT","price":"2000.51000000"},{"symbol":"BTCUSDT","price":"60123.00"}]"#;
        let tickers: Vec<TickerPrice> = serde_json::from_str(raw).unwrap();
        assert_eq!(tickers.len(), 2);
        assert_eq!(tickers[0].symbol, "ETHUSDT");
        assert!((tickers[0].price.parse::<f64>().unwrap() - 2000.51).abs() < 1e-9);
    }
}
