//! Order reconciliation store.
//!
//! One record per client order id, merged from whatever arrives: declared
//! parameters from the caller, async engine confirmations, synchronous venue
//! responses, poller deltas, and push-stream execution reports. Sources
//! interleave arbitrarily, so every merge is monotonic and idempotent:
//! executed quantity never decreases, statuses never move backwards, and a
//! terminal status is never downgraded by a late fill or update.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::models::{now_ns, GatewayEvent, OrderRecord, OrderSide, OrderStatus, QTY_EPSILON};

#[derive(Default)]
pub struct OrderStore {
    inner: Mutex<HashMap<String, OrderRecord>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert of caller-declared order parameters. Creates the
    /// record if missing; absent arguments never clear populated fields.
    pub fn declare(
        &self,
        client_order_id: &str,
        symbol: Option<&str>,
        side: Option<OrderSide>,
        qty: Option<f64>,
        price: Option<f64>,
    ) {
        let mut inner = self.inner.lock();
        let record = inner
            .entry(client_order_id.to_string())
            .or_insert_with(|| OrderRecord::new(client_order_id));

        if let Some(symbol) = symbol {
            record.symbol = Some(symbol.to_string());
        }
        if let Some(side) = side {
            record.side = Some(side);
        }
        if let Some(qty) = qty {
            record.qty = Some(qty);
        }
        if let Some(price) = price {
            record.price = Some(price);
        }
        record.updated_at_ns = now_ns();
    }

    /// Merge a normalized event into the store. Non-order events are ignored.
    pub fn apply(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::OrderUpdate {
                client_order_id,
                venue_order_id,
                status,
                reason,
                symbol,
                side,
                qty,
                price,
            } => {
                let mut inner = self.inner.lock();
                let record = inner
                    .entry(client_order_id.clone())
                    .or_insert_with(|| OrderRecord::new(client_order_id));

                if let Some(venue_id) = venue_order_id {
                    record.venue_order_id = Some(venue_id.clone());
                }
                if let Some(reason) = reason {
                    record.reason = Some(reason.clone());
                }
                if let Some(symbol) = symbol {
                    record.symbol = Some(symbol.clone());
                }
                if let Some(side) = side {
                    record.side = Some(*side);
                }
                if let Some(qty) = qty {
                    record.qty = Some(*qty);
                }
                if let Some(price) = price {
                    record.price = Some(*price);
                }
                if let Some(new_status) = status {
                    apply_status(record, *new_status);
                }
                record.updated_at_ns = now_ns();
            }
            GatewayEvent::Fill {
                client_order_id,
                symbol,
                qty,
                price,
            } => {
                let mut inner = self.inner.lock();
                let record = inner
                    .entry(client_order_id.clone())
                    .or_insert_with(|| OrderRecord::new(client_order_id));

                if record.symbol.is_none() {
                    record.symbol = Some(symbol.clone());
                }

                if *qty > 0.0 {
                    // Running VWAP over all fills seen so far.
                    let prev_qty = record.executed_qty;
                    let prev_avg = record.avg_fill_price.unwrap_or(0.0);
                    let new_qty = prev_qty + qty;
                    record.avg_fill_price = Some((prev_avg * prev_qty + price * qty) / new_qty);
                    record.executed_qty = new_qty;
                }

                // Fills still accrue quantity after a terminal status, but
                // must not resurrect the order's lifecycle.
                if !record.is_terminal() {
                    let inferred = match record.qty {
                        Some(declared) if declared > 0.0
                            && record.executed_qty + QTY_EPSILON >= declared =>
                        {
                            OrderStatus::Filled
                        }
                        _ => OrderStatus::PartiallyFilled,
                    };
                    apply_status(record, inferred);
                }
                record.updated_at_ns = now_ns();
            }
            _ => {}
        }
    }

    pub fn get(&self, client_order_id: &str) -> Option<OrderRecord> {
        self.inner.lock().get(client_order_id).cloned()
    }

    pub fn list(&self) -> Vec<OrderRecord> {
        let mut records: Vec<OrderRecord> = self.inner.lock().values().cloned().collect();
        records.sort_by(|a, b| a.updated_at_ns.cmp(&b.updated_at_ns));
        records
    }
}

/// Forward-only status transition. A terminal status is never replaced by a
/// non-terminal one, and lower lifecycle ranks never overwrite higher ones,
/// so poller/stream interleavings converge to the same record.
fn apply_status(record: &mut OrderRecord, new_status: OrderStatus) {
    match record.status {
        Some(current) if new_status.rank() < current.rank() => {}
        _ => record.status = Some(new_status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: &str, status: OrderStatus) -> GatewayEvent {
        GatewayEvent::OrderUpdate {
            client_order_id: id.to_string(),
            venue_order_id: None,
            status: Some(status),
            reason: None,
            symbol: None,
            side: None,
            qty: None,
            price: None,
        }
    }

    fn fill(id: &str, qty: f64, price: f64) -> GatewayEvent {
        GatewayEvent::Fill {
            client_order_id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            qty,
            price,
        }
    }

    #[test]
    fn accept_then_two_partial_fills() {
        let store = OrderStore::new();
        store.declare("o1", Some("BTCUSDT"), Some(OrderSide::Buy), Some(1.0), Some(100.0));
        store.apply(&update("o1", OrderStatus::Accepted));

        store.apply(&fill("o1", 0.4, 100.0));
        let record = store.get("o1").unwrap();
        assert_eq!(record.status, Some(OrderStatus::PartiallyFilled));
        assert!((record.executed_qty - 0.4).abs() < QTY_EPSILON);

        store.apply(&fill("o1", 0.6, 101.0));
        let record = store.get("o1").unwrap();
        assert_eq!(record.status, Some(OrderStatus::Filled));
        assert!((record.executed_qty - 1.0).abs() < QTY_EPSILON);
    }

    #[test]
    fn fills_compute_running_vwap() {
        let store = OrderStore::new();
        store.declare("o1", None, None, Some(1.0), None);
        store.apply(&fill("o1", 0.5, 100.0));
        store.apply(&fill("o1", 0.5, 200.0));

        let record = store.get("o1").unwrap();
        assert!((record.avg_fill_price.unwrap() - 150.0).abs() < 1e-6);
    }

    #[test]
    fn reject_short_circuits_fill_inference() {
        let store = OrderStore::new();
        store.apply(&update("o1", OrderStatus::Rejected));
        store.apply(&fill("o1", 0.1, 50.0));

        let record = store.get("o1").unwrap();
        assert_eq!(record.status, Some(OrderStatus::Rejected));
        assert!((record.executed_qty - 0.1).abs() < QTY_EPSILON);
    }

    #[test]
    fn terminal_status_survives_late_non_terminal_update() {
        let store = OrderStore::new();
        store.apply(&update("o1", OrderStatus::Filled));
        store.apply(&update("o1", OrderStatus::Accepted));

        assert_eq!(store.get("o1").unwrap().status, Some(OrderStatus::Filled));
    }

    #[test]
    fn declare_then_confirm_is_order_independent() {
        let confirm = GatewayEvent::OrderUpdate {
            client_order_id: "o1".to_string(),
            venue_order_id: Some("v42".to_string()),
            status: Some(OrderStatus::Accepted),
            reason: None,
            symbol: Some("BTCUSDT".to_string()),
            side: None,
            qty: None,
            price: None,
        };

        // declare first
        let store = OrderStore::new();
        store.declare("o1", None, Some(OrderSide::Sell), Some(2.0), Some(99.0));
        store.apply(&confirm);
        let a = store.get("o1").unwrap();

        // confirm first
        let store = OrderStore::new();
        store.apply(&confirm);
        store.declare("o1", None, Some(OrderSide::Sell), Some(2.0), Some(99.0));
        let b = store.get("o1").unwrap();

        for record in [a, b] {
            assert_eq!(record.symbol.as_deref(), Some("BTCUSDT"));
            assert_eq!(record.side, Some(OrderSide::Sell));
            assert_eq!(record.qty, Some(2.0));
            assert_eq!(record.price, Some(99.0));
            assert_eq!(record.venue_order_id.as_deref(), Some("v42"));
            assert_eq!(record.status, Some(OrderStatus::Accepted));
        }
    }

    #[test]
    fn declare_never_clears_populated_fields() {
        let store = OrderStore::new();
        store.declare("o1", Some("BTCUSDT"), Some(OrderSide::Buy), Some(1.0), Some(10.0));
        store.declare("o1", None, None, None, None);

        let record = store.get("o1").unwrap();
        assert_eq!(record.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(record.qty, Some(1.0));
    }

    #[test]
    fn executed_qty_is_monotonic_across_interleavings() {
        let store = OrderStore::new();
        store.declare("o1", None, None, Some(10.0), None);
        let mut last = 0.0;
        for i in 0..5 {
            store.apply(&fill("o1", 0.5, 100.0));
            store.apply(&update("o1", OrderStatus::Accepted));
            let executed = store.get("o1").unwrap().executed_qty;
            assert!(executed >= last, "iteration {i}: executed decreased");
            last = executed;
        }
        assert!((last - 2.5).abs() < QTY_EPSILON);
    }

    #[test]
    fn event_for_unseen_id_creates_record() {
        let store = OrderStore::new();
        store.apply(&fill("ghost", 0.2, 10.0));
        let record = store.get("ghost").unwrap();
        assert_eq!(record.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(record.status, Some(OrderStatus::PartiallyFilled));
    }

    #[test]
    fn list_returns_snapshot_copies() {
        let store = OrderStore::new();
        store.declare("o1", Some("BTCUSDT"), None, None, None);
        let mut listed = store.list();
        listed[0].symbol = Some("MUTATED".to_string());
        assert_eq!(store.get("o1").unwrap().symbol.as_deref(), Some("BTCUSDT"));
    }
}
