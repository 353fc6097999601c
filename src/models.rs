//! Core data model shared across the bridge: normalized events, order
//! records, and account balances.
//!
//! Both the simulated engine and the live exchange paths are translated into
//! [`GatewayEvent`] values, so every downstream consumer (order store,
//! event log, SSE clients) sees a single schema.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Tolerance used when comparing executed quantity against declared quantity.
/// Absorbs float drift from venues that report quantities as decimal strings.
pub const QTY_EPSILON: f64 = 1e-9;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

/// Order lifecycle status. The wire representation is the screaming-snake
/// string (`"PARTIALLY_FILLED"` etc.), shared by the engine protocol and the
/// venue translation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    /// Position in the lifecycle; used to refuse backwards transitions when
    /// poller- and stream-sourced updates interleave.
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::Accepted => 1,
            OrderStatus::PartiallyFilled => 2,
            _ => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Accepted => "ACCEPTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    /// Map a venue-reported status string onto the bridge lifecycle.
    /// Unknown statuses map to `None` and leave the record untouched.
    pub fn from_venue(s: &str) -> Option<Self> {
        match s {
            "NEW" | "ACCEPTED" => Some(OrderStatus::Accepted),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" | "PENDING_CANCEL" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

/// Normalized event, the single schema every source feeds into.
///
/// Serialized with a `type` tag so it is line-compatible with the engine
/// subprocess protocol (`{"type":"fill",...}`) and directly usable as an SSE
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    Market {
        symbol: String,
        price: f64,
        #[serde(default)]
        ts: i64,
    },
    OrderUpdate {
        client_order_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        venue_order_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<OrderStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        side: Option<OrderSide>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        qty: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        price: Option<f64>,
    },
    Fill {
        client_order_id: String,
        symbol: String,
        qty: f64,
        price: f64,
    },
    /// Marker that the balance snapshot changed; the balances themselves live
    /// in the account store.
    Account { ts: i64 },
    Error { message: String },
}

impl GatewayEvent {
    /// Whether this event belongs in the recent-activity view (order/fill/
    /// error traffic, as opposed to the market firehose).
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            GatewayEvent::OrderUpdate { .. } | GatewayEvent::Fill { .. } | GatewayEvent::Error { .. }
        )
    }
}

/// Reconciled per-order state, keyed by the caller-supplied client order id.
///
/// Declared fields (symbol/side/qty/price) may arrive before, with, or
/// instead of venue confirmation, so every one of them is optional until
/// first populated.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub client_order_id: String,
    pub symbol: Option<String>,
    pub side: Option<OrderSide>,
    pub qty: Option<f64>,
    pub price: Option<f64>,
    pub venue_order_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub reason: Option<String>,
    /// Cumulative executed quantity. Never decreases.
    pub executed_qty: f64,
    /// Running volume-weighted average fill price; defined once executed_qty > 0.
    pub avg_fill_price: Option<f64>,
    /// Nanoseconds since epoch of the last mutation.
    pub updated_at_ns: i64,
}

impl OrderRecord {
    pub fn new(client_order_id: &str) -> Self {
        Self {
            client_order_id: client_order_id.to_string(),
            symbol: None,
            side: None,
            qty: None,
            price: None,
            venue_order_id: None,
            status: None,
            reason: None,
            executed_qty: 0.0,
            avg_fill_price: None,
            updated_at_ns: now_ns(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.map(|s| s.is_terminal()).unwrap_or(false)
    }
}

/// One asset's balance in the account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

/// Nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
