//! Engine wire protocol: command encoding and event-line decoding.
//!
//! Commands are single text lines:
//!
//! ```text
//! ORDER <BUY|SELL> <symbol> <qty> <price> <client_order_id>
//! CANCEL <client_order_id>
//! ```
//!
//! Events arrive as one JSON object per line with a `type` discriminator.
//! The engine also emits internal types the bridge does not care about;
//! those, and anything that fails to decode, are skipped.

use serde_json::Value;
use tracing::debug;

use crate::models::{now_ms, GatewayEvent, OrderSide};

pub fn order_command(
    side: OrderSide,
    symbol: &str,
    qty: f64,
    price: f64,
    client_order_id: &str,
) -> String {
    format!(
        "ORDER {} {} {} {} {}",
        side.as_str(),
        symbol,
        qty,
        price,
        client_order_id
    )
}

pub fn cancel_command(client_order_id: &str) -> String {
    format!("CANCEL {client_order_id}")
}

/// Decode one engine output object into a normalized event. Returns `None`
/// for engine-internal types and undecodable payloads.
pub fn decode_engine_event(value: &Value) -> Option<GatewayEvent> {
    let kind = value.get("type").and_then(|t| t.as_str())?;
    if !matches!(kind, "market" | "order_update" | "fill" | "error" | "account") {
        return None;
    }

    let mut event: GatewayEvent = match serde_json::from_value(value.clone()) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, kind, "dropped undecodable engine event");
            return None;
        }
    };

    // Engines are allowed to omit market timestamps; stamp receipt time.
    if let GatewayEvent::Market { ts, .. } = &mut event {
        if *ts == 0 {
            *ts = now_ms() / 1000;
        }
    }

    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn order_command_layout() {
        let cmd = order_command(OrderSide::Buy, "BTCUSDT", 0.5, 42000.0, "abc-1");
        assert_eq!(cmd, "ORDER BUY BTCUSDT 0.5 42000 abc-1");
    }

    #[test]
    fn cancel_command_layout() {
        assert_eq!(cancel_command("abc-1"), "CANCEL abc-1");
    }

    #[test]
    fn decodes_known_types() {
        let value = json!({
            "type": "order_update",
            "client_order_id": "abc-1",
            "status": "ACCEPTED",
            "venue_order_id": "7"
        });
        let event = decode_engine_event(&value).unwrap();
        match event {
            GatewayEvent::OrderUpdate {
                client_order_id,
                venue_order_id,
                ..
            } => {
                assert_eq!(client_order_id, "abc-1");
                assert_eq!(venue_order_id.as_deref(), Some("7"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn skips_engine_internal_types() {
        let value = json!({"type": "heartbeat", "seq": 10});
        assert!(decode_engine_event(&value).is_none());
    }

    #[test]
    fn stamps_missing_market_timestamp() {
        let value = json!({"type": "market", "symbol": "BTCUSDT", "price": 9.5});
        match decode_engine_event(&value).unwrap() {
            GatewayEvent::Market { ts, .. } => assert!(ts > 0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn malformed_known_type_is_dropped() {
        // fill without required fields
        let value = json!({"type": "fill", "qty": "not-a-number"});
        assert!(decode_engine_event(&value).is_none());
    }
}
