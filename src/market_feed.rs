//! Fallback market price feed.
//!
//! The engine subprocess is the primary market data source. When its feed
//! goes quiet, this poller fetches spot prices from the venue's public
//! ticker endpoint and injects synthetic `market` events so stream consumers
//! keep seeing prices. While the engine feed is fresh the poller does
//! nothing.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio::time::interval;
use tracing::{debug, info};

use crate::bridge::EventLog;
use crate::models::{now_ms, GatewayEvent};

/// Tracks when the engine last produced a market event. Written by the
/// router's ingest path, read by the poller.
#[derive(Default)]
pub struct EngineFeedStatus {
    last_market_ms: AtomicI64,
}

impl EngineFeedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        self.last_market_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// True when no engine market event arrived within `threshold_ms`
    /// (including the case where none ever arrived).
    pub fn is_stale(&self, threshold_ms: i64) -> bool {
        let last = self.last_market_ms.load(Ordering::Relaxed);
        last == 0 || now_ms() - last > threshold_ms
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

pub struct MarketFeedPoller {
    http: Client,
    rest_base: String,
    symbols: Vec<String>,
    log: Arc<EventLog>,
    status: Arc<EngineFeedStatus>,
    poll_interval: Duration,
    staleness_ms: i64,
    running: Arc<AtomicBool>,
}

impl MarketFeedPoller {
    pub fn new(
        rest_base: &str,
        symbols: Vec<String>,
        log: Arc<EventLog>,
        status: Arc<EngineFeedStatus>,
        poll_interval: Duration,
        staleness_ms: i64,
    ) -> Arc<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent("BridgeBot/1.0")
            .build()
            .expect("Failed to create HTTP client");

        Arc::new(Self {
            http,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            symbols,
            log,
            status,
            poll_interval,
            staleness_ms,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn spawn(self: &Arc<Self>) {
        let poller = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(poller.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if !poller.running.load(Ordering::Relaxed) {
                    break;
                }
                if !poller.status.is_stale(poller.staleness_ms) {
                    continue;
                }
                poller.poll_once().await;
            }
            info!("market feed poller stopped");
        });
    }

    async fn poll_once(&self) {
        for symbol in &self.symbols {
            match self.fetch_price(symbol).await {
                Ok(price) => {
                    self.log.append(GatewayEvent::Market {
                        symbol: symbol.clone(),
                        price,
                        ts: now_ms() / 1000,
                    });
                }
                Err(e) => {
                    // Price poll failures are log noise, not event-worthy.
                    debug!(symbol = %symbol, error = %e, "market price poll failed");
                }
            }
        }
    }

    async fn fetch_price(&self, symbol: &str) -> anyhow::Result<f64> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.rest_base, symbol);
        let ticker: TickerPrice = self.http.get(&url).send().await?.json().await?;
        let price: f64 = ticker.price.parse()?;
        if !price.is_finite() || price <= 0.0 {
            anyhow::bail!("bogus price {price}");
        }
        Ok(price)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
