//! Exchange user-data stream.
//!
//! Maintains the push-based order/account subscription: acquire a listen
//! key, connect the WebSocket, keep the key alive on a timer, translate
//! inbound messages into normalized events, and on any disconnect release
//! the key and reconnect with a doubling backoff.
//!
//! A keepalive failure alone does not tear the connection down; only the
//! read loop observing closure or an error does. The `connected` flag is
//! shared with the execution router so its fallback poller can stand down
//! while the push stream is live.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bridge::{AccountStore, EventLog, OrderStore};
use crate::exchange::rest::VenueApi;
use crate::models::{now_ms, AssetBalance, GatewayEvent, OrderSide, OrderStatus};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

pub struct UserDataStream {
    venue: Arc<dyn VenueApi>,
    ws_base: String,
    log: Arc<EventLog>,
    orders: Arc<OrderStore>,
    balances: Arc<AccountStore>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    keepalive_interval: Duration,
}

impl UserDataStream {
    pub fn new(
        venue: Arc<dyn VenueApi>,
        ws_base: &str,
        log: Arc<EventLog>,
        orders: Arc<OrderStore>,
        balances: Arc<AccountStore>,
        connected: Arc<AtomicBool>,
        keepalive_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            venue,
            ws_base: ws_base.trim_end_matches('/').to_string(),
            log,
            orders,
            balances,
            connected,
            running: Arc::new(AtomicBool::new(true)),
            keepalive_interval,
        })
    }

    pub fn spawn(self: &Arc<Self>) {
        let stream = self.clone();
        tokio::spawn(async move {
            stream.run().await;
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    async fn run(self: Arc<Self>) {
        let mut delay = INITIAL_RECONNECT_DELAY;

        while self.running.load(Ordering::Relaxed) {
            let listen_key = match self.venue.create_listen_key().await {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "listen key acquisition failed");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                    continue;
                }
            };

            match self.stream_session(&listen_key).await {
                Ok(()) => {
                    debug!("user-data stream closed cleanly");
                    delay = INITIAL_RECONNECT_DELAY;
                }
                Err(e) => {
                    warn!(error = %e, "user-data stream disconnected");
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }

            self.connected.store(false, Ordering::Relaxed);

            // Best effort; the venue expires unrefreshed keys on its own.
            if let Err(e) = self.venue.close_listen_key(&listen_key).await {
                debug!(error = %e, "listen key close failed");
            }

            sleep(delay).await;
        }
        info!("user-data stream stopped");
    }

    /// One connected session: runs until the socket closes or errors.
    async fn stream_session(&self, listen_key: &str) -> Result<()> {
        let url = format!("{}/ws/{}", self.ws_base, listen_key);
        let (ws, _) = connect_async(&url)
            .await
            .context("user-data stream connect failed")?;
        info!("user-data stream connected");

        let (mut write, mut read) = ws.split();
        self.connected.store(true, Ordering::Relaxed);

        // Refresh the listen key well inside the venue's expiry window.
        let mut keepalive = interval_at(
            Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    if let Err(e) = self.venue.keepalive_listen_key(listen_key).await {
                        // Not fatal: the read loop decides liveness.
                        warn!(error = %e, "listen key keepalive failed");
                    } else {
                        debug!("listen key refreshed");
                    }
                }
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "user-data stream close frame");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(anyhow!("user-data stream error: {e}")),
                        None => return Err(anyhow!("user-data stream ended")),
                    }
                }
            }
        }
    }

    /// Translate one inbound message. Irrelevant or unparseable messages are
    /// skipped silently.
    fn handle_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };

        match value.get("e").and_then(|e| e.as_str()) {
            Some("executionReport") => self.handle_execution_report(&value),
            Some("outboundAccountPosition") => self.handle_account_position(&value),
            _ => {}
        }
    }

    /// An execution report always yields an `order_update`; when it carries a
    /// non-zero last-fill quantity it additionally yields a `fill`.
    fn handle_execution_report(&self, value: &Value) {
        // Cancels carry the original id in "C" and a cancel-specific id in "c".
        let client_order_id = value
            .get("C")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .or_else(|| value.get("c").and_then(|c| c.as_str()))
            .map(|c| c.to_string());
        let Some(client_order_id) = client_order_id else {
            return;
        };

        let update = GatewayEvent::OrderUpdate {
            client_order_id: client_order_id.clone(),
            venue_order_id: value.get("i").and_then(|i| i.as_i64()).map(|i| i.to_string()),
            status: value
                .get("X")
                .and_then(|x| x.as_str())
                .and_then(OrderStatus::from_venue),
            reason: value
                .get("r")
                .and_then(|r| r.as_str())
                .filter(|r| !r.is_empty() && *r != "NONE")
                .map(|r| r.to_string()),
            symbol: value.get("s").and_then(|s| s.as_str()).map(|s| s.to_string()),
            side: value
                .get("S")
                .and_then(|s| s.as_str())
                .and_then(OrderSide::parse),
            qty: str_f64(value, "q"),
            price: str_f64(value, "p").filter(|p| *p > 0.0),
        };
        self.orders.apply(&update);
        self.log.append(update);

        let last_fill_qty = str_f64(value, "l").unwrap_or(0.0);
        if last_fill_qty > 0.0 {
            let fill = GatewayEvent::Fill {
                client_order_id,
                symbol: value
                    .get("s")
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string(),
                qty: last_fill_qty,
                price: str_f64(value, "L").unwrap_or(0.0),
            };
            self.orders.apply(&fill);
            self.log.append(fill);
        }
    }

    /// Account positions are complete snapshots: replace the store wholesale
    /// and emit a marker event.
    fn handle_account_position(&self, value: &Value) {
        let Some(entries) = value.get("B").and_then(|b| b.as_array()) else {
            return;
        };

        let balances: Vec<AssetBalance> = entries
            .iter()
            .filter_map(|entry| {
                Some(AssetBalance {
                    asset: entry.get("a")?.as_str()?.to_string(),
                    free: str_f64(entry, "f")?,
                    locked: str_f64(entry, "l")?,
                })
            })
            .collect();

        self.balances.replace(balances);
        self.log.append(GatewayEvent::Account {
            ts: value.get("E").and_then(|e| e.as_i64()).unwrap_or_else(now_ms),
        });
    }
}

/// Venue numerics arrive as decimal strings; tolerate plain numbers too.
fn str_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}
