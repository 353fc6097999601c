//! Execution router: dispatches order actions to the engine subprocess
//! (simulated mode) or the live venue (live mode), and normalizes both paths
//! into the shared event schema.
//!
//! Simulated mode is fire-and-forget: the command line is written to the
//! engine and confirmation arrives later on its output stream. Live mode is
//! synchronous at the edge (the REST call decides accept/reject immediately)
//! and asynchronous afterwards: a background poller and/or the user-data
//! stream discover fills and status changes out of band. The poller is a
//! fallback only - it suspends itself while the push stream is connected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::bridge::event_log::EventLog;
use crate::bridge::order_store::OrderStore;
use crate::config::ExecutionMode;
use crate::engine::{protocol, ProcessChannel};
use crate::error::BridgeError;
use crate::exchange::rest::{VenueApi, VenueOrderStatus};
use crate::market_feed::EngineFeedStatus;
use crate::models::{GatewayEvent, OrderSide, OrderStatus, QTY_EPSILON};

/// Orders the live-mode poller is still reconciling.
struct WatchedOrder {
    symbol: String,
    last_executed_qty: f64,
}

pub struct RouterConfig {
    pub poll_interval: Duration,
    pub error_throttle: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            error_throttle: Duration::from_secs(5),
        }
    }
}

pub struct ExecutionRouter {
    mode: ExecutionMode,
    channel: Option<Arc<ProcessChannel>>,
    venue: Option<Arc<dyn VenueApi>>,
    log: Arc<EventLog>,
    orders: Arc<OrderStore>,
    feed_status: Arc<EngineFeedStatus>,
    watched: Mutex<HashMap<String, WatchedOrder>>,
    /// Set by the user-data stream; suppresses the fallback poller.
    stream_connected: Arc<AtomicBool>,
    last_error_event: Mutex<Option<Instant>>,
    running: Arc<AtomicBool>,
    config: RouterConfig,
}

impl ExecutionRouter {
    pub fn new(
        mode: ExecutionMode,
        channel: Option<Arc<ProcessChannel>>,
        venue: Option<Arc<dyn VenueApi>>,
        log: Arc<EventLog>,
        orders: Arc<OrderStore>,
        feed_status: Arc<EngineFeedStatus>,
        stream_connected: Arc<AtomicBool>,
        config: RouterConfig,
    ) -> Self {
        Self {
            mode,
            channel,
            venue,
            log,
            orders,
            feed_status,
            watched: Mutex::new(HashMap::new()),
            stream_connected,
            last_error_event: Mutex::new(None),
            running: Arc::new(AtomicBool::new(true)),
            config,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Place an order. In simulated mode success means the command was
    /// *sent*; acceptance arrives later as an engine event. In live mode the
    /// venue's synchronous answer is synthesized into an event immediately.
    pub async fn place_order(
        &self,
        side: OrderSide,
        symbol: &str,
        qty: f64,
        price: f64,
        client_order_id: &str,
    ) -> Result<(), BridgeError> {
        // Declared parameters are recorded up front so state queries succeed
        // before any confirmation exists.
        self.orders.declare(
            client_order_id,
            Some(symbol),
            Some(side),
            Some(qty),
            Some(price),
        );

        match self.mode {
            ExecutionMode::Simulated => {
                let channel = self.channel.as_ref().ok_or(BridgeError::ChannelClosed)?;
                channel
                    .send_line(&protocol::order_command(
                        side,
                        symbol,
                        qty,
                        price,
                        client_order_id,
                    ))
                    .await?;
                debug!(client_order_id, symbol, "order command sent to engine");
                Ok(())
            }
            ExecutionMode::Live => {
                let venue = self.venue.as_ref().ok_or_else(|| {
                    BridgeError::VenueUnavailable("venue credentials not configured".to_string())
                })?;

                match venue
                    .place_order(symbol, side, qty, price, client_order_id)
                    .await
                {
                    Ok(placed) => {
                        info!(
                            client_order_id,
                            venue_order_id = %placed.venue_order_id,
                            "order accepted by venue"
                        );
                        self.emit_order_update(
                            client_order_id,
                            Some(placed.venue_order_id),
                            Some(OrderStatus::Accepted),
                            None,
                        );
                        self.watched.lock().insert(
                            client_order_id.to_string(),
                            WatchedOrder {
                                symbol: symbol.to_string(),
                                last_executed_qty: 0.0,
                            },
                        );
                        Ok(())
                    }
                    Err(e) => {
                        // Fail fast as data: the rejection is an event, not
                        // an error to the caller.
                        warn!(client_order_id, error = %e, "venue rejected order");
                        self.emit_order_update(
                            client_order_id,
                            None,
                            Some(OrderStatus::Rejected),
                            Some(e.to_string()),
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// Cancel an order. Symbol may be omitted when the store already knows it.
    pub async fn cancel_order(
        &self,
        client_order_id: &str,
        symbol: Option<&str>,
    ) -> Result<(), BridgeError> {
        match self.mode {
            ExecutionMode::Simulated => {
                let channel = self.channel.as_ref().ok_or(BridgeError::ChannelClosed)?;
                channel
                    .send_line(&protocol::cancel_command(client_order_id))
                    .await?;
                debug!(client_order_id, "cancel command sent to engine");
                Ok(())
            }
            ExecutionMode::Live => {
                let venue = self.venue.as_ref().ok_or_else(|| {
                    BridgeError::VenueUnavailable("venue credentials not configured".to_string())
                })?;

                let symbol = symbol
                    .map(|s| s.to_string())
                    .or_else(|| self.orders.get(client_order_id).and_then(|r| r.symbol))
                    .ok_or_else(|| {
                        BridgeError::VenueUnavailable(format!(
                            "unknown symbol for order {client_order_id}"
                        ))
                    })?;

                let (status, reason) = match venue.cancel_order(&symbol, client_order_id).await {
                    Ok(()) => (OrderStatus::Cancelled, None),
                    Err(e) => {
                        warn!(client_order_id, error = %e, "venue cancel failed");
                        (OrderStatus::Rejected, Some(e.to_string()))
                    }
                };
                self.emit_order_update(client_order_id, None, Some(status), reason);
                self.watched.lock().remove(client_order_id);
                Ok(())
            }
        }
    }

    /// Apply and publish one normalized event (from any source).
    pub fn ingest(&self, event: GatewayEvent) {
        if let GatewayEvent::Market { .. } = &event {
            self.feed_status.touch();
        }
        self.orders.apply(&event);
        self.log.append(event);
    }

    /// Consume the engine's decoded output stream for the process lifetime.
    pub fn spawn_engine_ingest(self: &Arc<Self>, mut rx: UnboundedReceiver<Value>) {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                if let Some(event) = protocol::decode_engine_event(&value) {
                    router.ingest(event);
                }
            }
            warn!("engine event stream ended");
        });
    }

    /// Fallback reconciliation loop for live mode. Runs only while the push
    /// stream is down; exits cooperatively via [`stop`](Self::stop).
    pub fn spawn_status_poller(self: &Arc<Self>) {
        if self.mode != ExecutionMode::Live {
            return;
        }
        let router = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(router.config.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if !router.running.load(Ordering::Relaxed) {
                    break;
                }
                if router.stream_connected.load(Ordering::Relaxed) {
                    continue;
                }
                router.poll_watched_once().await;
            }
            info!("order status poller stopped");
        });
    }

    /// One reconciliation pass over all watched orders.
    pub async fn poll_watched_once(&self) {
        let Some(venue) = self.venue.clone() else {
            return;
        };

        let snapshot: Vec<(String, String, f64)> = self
            .watched
            .lock()
            .iter()
            .map(|(id, w)| (id.clone(), w.symbol.clone(), w.last_executed_qty))
            .collect();

        for (client_order_id, symbol, last_executed) in snapshot {
            match venue.order_status(&symbol, &client_order_id).await {
                Ok(status) => {
                    self.reconcile_poll(&client_order_id, &symbol, last_executed, status)
                }
                Err(e) => self.emit_throttled_error(format!(
                    "status poll failed for {client_order_id}: {e}"
                )),
            }
        }
    }

    fn reconcile_poll(
        &self,
        client_order_id: &str,
        symbol: &str,
        last_executed: f64,
        venue_status: VenueOrderStatus,
    ) {
        // Quantity delta since the last poll becomes an incremental fill.
        let delta = venue_status.executed_qty - last_executed;
        if delta > QTY_EPSILON {
            let price = venue_status.avg_price.unwrap_or(0.0);
            self.ingest(GatewayEvent::Fill {
                client_order_id: client_order_id.to_string(),
                symbol: symbol.to_string(),
                qty: delta,
                price,
            });
            if let Some(watched) = self.watched.lock().get_mut(client_order_id) {
                watched.last_executed_qty = venue_status.executed_qty;
            }
        }

        let previous = self.orders.get(client_order_id).and_then(|r| r.status);
        if let Some(status) = venue_status.status {
            if previous != Some(status) {
                self.emit_order_update(
                    client_order_id,
                    venue_status.venue_order_id.clone(),
                    Some(status),
                    None,
                );
            }
            if status.is_terminal() {
                self.watched.lock().remove(client_order_id);
                debug!(client_order_id, status = status.as_str(), "order left poll set");
            }
        }
    }

    fn emit_order_update(
        &self,
        client_order_id: &str,
        venue_order_id: Option<String>,
        status: Option<OrderStatus>,
        reason: Option<String>,
    ) {
        self.ingest(GatewayEvent::OrderUpdate {
            client_order_id: client_order_id.to_string(),
            venue_order_id,
            status,
            reason,
            symbol: None,
            side: None,
            qty: None,
            price: None,
        });
    }

    /// Emit at most one error event per throttle interval so a sustained
    /// venue outage does not flood the log.
    fn emit_throttled_error(&self, message: String) {
        let mut last = self.last_error_event.lock();
        let due = match *last {
            Some(at) => at.elapsed() >= self.config.error_throttle,
            None => true,
        };
        if due {
            *last = Some(Instant::now());
            drop(last);
            warn!(%message, "venue reconciliation error");
            self.ingest(GatewayEvent::Error { message });
        } else {
            debug!(%message, "venue reconciliation error (throttled)");
        }
    }

    /// Number of orders still awaiting a terminal status in live mode.
    pub fn watched_count(&self) -> usize {
        self.watched.lock().len()
    }

    /// Cooperative stop for the background poller.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::rest::PlacedOrder;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Scripted venue: placement outcome and a queue of status responses.
    #[derive(Default)]
    struct MockVenue {
        fail_place: bool,
        fail_cancel: bool,
        statuses: Mutex<VecDeque<VenueOrderStatus>>,
        status_calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl VenueApi for MockVenue {
        async fn place_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _qty: f64,
            _price: f64,
            _client_order_id: &str,
        ) -> Result<PlacedOrder> {
            if self.fail_place {
                return Err(anyhow!("insufficient balance"));
            }
            Ok(PlacedOrder {
                venue_order_id: "9001".to_string(),
            })
        }

        async fn cancel_order(&self, _symbol: &str, _client_order_id: &str) -> Result<()> {
            if self.fail_cancel {
                return Err(anyhow!("unknown order"));
            }
            Ok(())
        }

        async fn order_status(
            &self,
            _symbol: &str,
            _client_order_id: &str,
        ) -> Result<VenueOrderStatus> {
            self.status_calls
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.statuses
                .lock()
                .pop_front()
                .ok_or_else(|| anyhow!("venue unavailable"))
        }

        async fn create_listen_key(&self) -> Result<String> {
            Ok("key".to_string())
        }

        async fn keepalive_listen_key(&self, _listen_key: &str) -> Result<()> {
            Ok(())
        }

        async fn close_listen_key(&self, _listen_key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn live_router(venue: Arc<MockVenue>) -> ExecutionRouter {
        ExecutionRouter::new(
            ExecutionMode::Live,
            None,
            Some(venue),
            Arc::new(EventLog::new(128, 32)),
            Arc::new(OrderStore::new()),
            Arc::new(EngineFeedStatus::new()),
            Arc::new(AtomicBool::new(false)),
            RouterConfig {
                poll_interval: Duration::from_millis(10),
                error_throttle: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn live_place_success_synthesizes_accepted() {
        let venue = Arc::new(MockVenue::default());
        let router = live_router(venue);

        router
            .place_order(OrderSide::Buy, "BTCUSDT", 1.0, 100.0, "o1")
            .await
            .unwrap();

        let record = router.orders.get("o1").unwrap();
        assert_eq!(record.status, Some(OrderStatus::Accepted));
        assert_eq!(record.venue_order_id.as_deref(), Some("9001"));
        assert_eq!(record.qty, Some(1.0));
        assert_eq!(router.watched_count(), 1);

        let (events, _) = router.log.read_since(None);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn live_place_failure_synthesizes_rejected() {
        let venue = Arc::new(MockVenue {
            fail_place: true,
            ..Default::default()
        });
        let router = live_router(venue);

        // The action itself succeeds; the rejection is data.
        router
            .place_order(OrderSide::Sell, "BTCUSDT", 1.0, 100.0, "o1")
            .await
            .unwrap();

        let record = router.orders.get("o1").unwrap();
        assert_eq!(record.status, Some(OrderStatus::Rejected));
        assert!(record.reason.as_deref().unwrap().contains("insufficient"));
        assert_eq!(router.watched_count(), 0);
    }

    #[tokio::test]
    async fn live_without_credentials_errors_synchronously() {
        let router = ExecutionRouter::new(
            ExecutionMode::Live,
            None,
            None,
            Arc::new(EventLog::new(128, 32)),
            Arc::new(OrderStore::new()),
            Arc::new(EngineFeedStatus::new()),
            Arc::new(AtomicBool::new(false)),
            RouterConfig::default(),
        );
        let result = router
            .place_order(OrderSide::Buy, "BTCUSDT", 1.0, 100.0, "o1")
            .await;
        assert!(matches!(result, Err(BridgeError::VenueUnavailable(_))));
    }

    #[tokio::test]
    async fn live_cancel_resolves_symbol_from_store() {
        let venue = Arc::new(MockVenue::default());
        let router = live_router(venue);
        router
            .place_order(OrderSide::Buy, "BTCUSDT", 1.0, 100.0, "o1")
            .await
            .unwrap();

        router.cancel_order("o1", None).await.unwrap();
        let record = router.orders.get("o1").unwrap();
        assert_eq!(record.status, Some(OrderStatus::Cancelled));
        assert_eq!(router.watched_count(), 0);
    }

    #[tokio::test]
    async fn live_cancel_failure_synthesizes_rejected_with_reason() {
        let venue = Arc::new(MockVenue {
            fail_cancel: true,
            ..Default::default()
        });
        let router = live_router(venue);
        router
            .place_order(OrderSide::Buy, "BTCUSDT", 1.0, 100.0, "o1")
            .await
            .unwrap();

        router.cancel_order("o1", Some("BTCUSDT")).await.unwrap();
        let record = router.orders.get("o1").unwrap();
        assert_eq!(record.status, Some(OrderStatus::Rejected));
        assert!(record.reason.as_deref().unwrap().contains("unknown order"));
        assert_eq!(router.watched_count(), 0);
    }

    #[tokio::test]
    async fn poll_detects_fill_delta_and_terminal_status() {
        let venue = Arc::new(MockVenue::default());
        venue.statuses.lock().push_back(VenueOrderStatus {
            status: Some(OrderStatus::PartiallyFilled),
            executed_qty: 0.4,
            orig_qty: 1.0,
            avg_price: Some(100.0),
            venue_order_id: Some("9001".to_string()),
        });
        venue.statuses.lock().push_back(VenueOrderStatus {
            status: Some(OrderStatus::Filled),
            executed_qty: 1.0,
            orig_qty: 1.0,
            avg_price: Some(100.5),
            venue_order_id: Some("9001".to_string()),
        });

        let router = live_router(venue.clone());
        router
            .place_order(OrderSide::Buy, "BTCUSDT", 1.0, 100.0, "o1")
            .await
            .unwrap();

        router.poll_watched_once().await;
        let record = router.orders.get("o1").unwrap();
        assert_eq!(record.status, Some(OrderStatus::PartiallyFilled));
        assert!((record.executed_qty - 0.4).abs() < QTY_EPSILON);

        router.poll_watched_once().await;
        let record = router.orders.get("o1").unwrap();
        assert_eq!(record.status, Some(OrderStatus::Filled));
        assert!((record.executed_qty - 1.0).abs() < QTY_EPSILON);
        // Terminal orders leave the poll set.
        assert_eq!(router.watched_count(), 0);
    }

    #[tokio::test]
    async fn poll_errors_are_throttled_to_one_event() {
        let venue = Arc::new(MockVenue::default()); // empty status queue -> every poll errors
        let router = live_router(venue.clone());
        router
            .place_order(OrderSide::Buy, "BTCUSDT", 1.0, 100.0, "o1")
            .await
            .unwrap();

        for _ in 0..5 {
            router.poll_watched_once().await;
        }

        // Every pass hit the venue, but only the first error became an event.
        assert_eq!(
            venue
                .status_calls
                .load(std::sync::atomic::Ordering::Relaxed),
            5
        );
        let errors = router
            .log
            .read_since(None)
            .0
            .into_iter()
            .filter(|(_, e)| matches!(e, GatewayEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn engine_market_events_touch_feed_freshness() {
        let router = ExecutionRouter::new(
            ExecutionMode::Live,
            None,
            None,
            Arc::new(EventLog::new(128, 32)),
            Arc::new(OrderStore::new()),
            Arc::new(EngineFeedStatus::new()),
            Arc::new(AtomicBool::new(false)),
            RouterConfig::default(),
        );
        assert!(router.feed_status.is_stale(1_000));
        router.ingest(GatewayEvent::Market {
            symbol: "BTCUSDT".to_string(),
            price: 1.0,
            ts: 0,
        });
        assert!(!router.feed_status.is_stale(60_000));
    }
}
