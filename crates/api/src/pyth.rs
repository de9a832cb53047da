//! Pyth Hermes price feed connector.
//!
//! Streams price updates from the Hermes SSE endpoint for the configured
//! feed ids. Each server-sent event carries a batch of parsed price updates;
//! every one is forwarded into the aggregator channel keyed by feed id.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::feed::{FeedEvent, FeedUpdate, PriceSource};

const DEFAULT_HERMES_URL: &str = "https://hermes.pyth.network";

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    parsed: Vec<ParsedUpdate>,
}

#[derive(Debug, Deserialize)]
struct ParsedUpdate {
    id: String,
    price: PythPrice,
}

#[derive(Debug, Deserialize)]
struct PythPrice {
    price: String,
    expo: i32,
    publish_time: u64,
}

impl PythPrice {
    /// Scale the fixed-point mantissa into a USD float.
    fn to_usd(&self) -> Option<f64> {
        let mantissa = self.price.parse::<i64>().ok()?;
        if mantissa <= 0 {
            return None;
        }
        Some(mantissa as f64 * 10f64.powi(self.expo))
    }
}

/// Streaming connector for Pyth Hermes.
pub struct PythFeed {
    client: reqwest::Client,
    hermes_url: String,
    feed_ids: Vec<String>,
}

impl PythFeed {
    pub fn new(feed_ids: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            hermes_url: DEFAULT_HERMES_URL.to_string(),
            feed_ids,
        }
    }

    pub fn with_hermes_url(mut self, url: impl Into<String>) -> Self {
        self.hermes_url = url.into();
        self
    }

    /// Run the connector until shutdown, reconnecting with bounded backoff.
    pub async fn run(self, tx: mpsc::Sender<FeedEvent>, mut shutdown: watch::Receiver<bool>) {
        if self.feed_ids.is_empty() {
            info!("No Pyth feed ids configured, connector idle");
            return;
        }

        let mut backoff = BACKOFF_MIN;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.stream_once(&tx) => {
                    match result {
                        Ok(()) => warn!("Pyth stream ended, reconnecting"),
                        Err(e) => warn!(error = %e, "Pyth stream failed, reconnecting"),
                    }
                    let _ = tx.send(FeedEvent::Disconnected(PriceSource::Pyth)).await;

                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }

        info!("Pyth feed connector stopped");
    }

    /// Open the SSE stream and forward updates until it closes.
    async fn stream_once(&self, tx: &mpsc::Sender<FeedEvent>) -> Result<()> {
        let url = format!("{}/v2/updates/price/stream", self.hermes_url);
        let query: Vec<(&str, &str)> = self
            .feed_ids
            .iter()
            .map(|id| ("ids[]", id.as_str()))
            .collect();

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .context("Hermes connect failed")?
            .error_for_status()?;

        info!(feeds = self.feed_ids.len(), "Pyth Hermes stream connected");
        tx.send(FeedEvent::Connected(PriceSource::Pyth))
            .await
            .map_err(|_| anyhow::anyhow!("aggregator channel closed"))?;

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Hermes stream read failed")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames are newline-delimited; a "data:" line carries the payload.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(json) = line.strip_prefix("data:") else {
                    continue;
                };

                match serde_json::from_str::<StreamPayload>(json.trim()) {
                    Ok(payload) => {
                        for parsed in payload.parsed {
                            let Some(price_usd) = parsed.price.to_usd() else {
                                debug!(feed = %parsed.id, "Non-positive Pyth price dropped");
                                continue;
                            };
                            let update = FeedUpdate {
                                source: PriceSource::Pyth,
                                symbol: parsed.id,
                                price_usd,
                                published_at: Some(parsed.price.publish_time),
                            };
                            if tx.send(FeedEvent::Price(update)).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => debug!(error = %e, "Skipping unparseable Hermes frame"),
                }
            }
        }

        Ok(())
    }
}
