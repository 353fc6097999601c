//! Signed REST client for the live exchange.
//!
//! The router and the user-data stream talk to the venue through the
//! [`VenueApi`] trait so tests can substitute a scripted venue. The real
//! implementation signs query strings with HMAC-SHA256 and authenticates
//! with an API-key header, Binance-style.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::models::{now_ms, OrderSide, OrderStatus};

type HmacSha256 = Hmac<Sha256>;

/// Acknowledgement for a placed order.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub venue_order_id: String,
}

/// One point-in-time view of an order at the venue.
#[derive(Debug, Clone)]
pub struct VenueOrderStatus {
    pub status: Option<OrderStatus>,
    pub executed_qty: f64,
    pub orig_qty: f64,
    pub avg_price: Option<f64>,
    pub venue_order_id: Option<String>,
}

/// Black-box venue operations consumed by the execution router and the
/// user-data stream.
#[async_trait]
pub trait VenueApi: Send + Sync {
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
        client_order_id: &str,
    ) -> Result<PlacedOrder>;

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<()>;

    async fn order_status(&self, symbol: &str, client_order_id: &str) -> Result<VenueOrderStatus>;

    async fn create_listen_key(&self) -> Result<String>;

    async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()>;

    async fn close_listen_key(&self, listen_key: &str) -> Result<()>;
}

pub struct VenueRestClient {
    http: Client,
    rest_base: String,
    api_key: String,
    api_secret: String,
}

impl VenueRestClient {
    pub fn new(rest_base: &str, api_key: &str, api_secret: &str) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("BridgeBot/1.0")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }

    /// HMAC-SHA256 over the query string, hex encoded.
    fn sign(secret: &str, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value> {
        let mut query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        query.push(format!("timestamp={}", now_ms()));
        query.push("recvWindow=5000".to_string());
        let query = query.join("&");
        let signature = Self::sign(&self.api_secret, &query);

        let url = format!("{}{}?{}&signature={}", self.rest_base, path, query, signature);
        debug!(%path, "venue request");

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("venue request failed")?;

        let status = response.status();
        let body = response.text().await.context("venue response read failed")?;
        if !status.is_success() {
            bail!("venue returned {status}: {body}");
        }
        serde_json::from_str(&body).context("venue response was not JSON")
    }

    /// Listen-key endpoints authenticate with the API key header alone.
    async fn keyed_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value> {
        let mut url = format!("{}{}", self.rest_base, path);
        if !params.is_empty() {
            let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            url = format!("{}?{}", url, query.join("&"));
        }

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("venue request failed")?;

        let status = response.status();
        let body = response.text().await.context("venue response read failed")?;
        if !status.is_success() {
            bail!("venue returned {status}: {body}");
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).context("venue response was not JSON")
    }
}

/// Venues report quantities and prices as decimal strings.
fn field_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

#[async_trait]
impl VenueApi for VenueRestClient {
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
        client_order_id: &str,
    ) -> Result<PlacedOrder> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", qty.to_string()),
            ("price", price.to_string()),
            ("newClientOrderId", client_order_id.to_string()),
        ];
        let response = self
            .signed_request(Method::POST, "/api/v3/order", &params)
            .await?;

        let venue_order_id = response
            .get("orderId")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .context("venue order response missing orderId")?;

        Ok(PlacedOrder { venue_order_id })
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        self.signed_request(Method::DELETE, "/api/v3/order", &params)
            .await?;
        Ok(())
    }

    async fn order_status(&self, symbol: &str, client_order_id: &str) -> Result<VenueOrderStatus> {
        let params = [
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let response = self
            .signed_request(Method::GET, "/api/v3/order", &params)
            .await?;

        let executed_qty = field_f64(&response, "executedQty").unwrap_or(0.0);
        let orig_qty = field_f64(&response, "origQty").unwrap_or(0.0);
        // The order endpoint reports cumulative quote volume, not a price;
        // divide it back out for the average fill price.
        let avg_price = field_f64(&response, "cummulativeQuoteQty")
            .filter(|_| executed_qty > 0.0)
            .map(|quote| quote / executed_qty);

        Ok(VenueOrderStatus {
            status: response
                .get("status")
                .and_then(|s| s.as_str())
                .and_then(OrderStatus::from_venue),
            executed_qty,
            orig_qty,
            avg_price,
            venue_order_id: response
                .get("orderId")
                .and_then(|v| v.as_i64())
                .map(|id| id.to_string()),
        })
    }

    async fn create_listen_key(&self) -> Result<String> {
        let response = self
            .keyed_request(Method::POST, "/api/v3/userDataStream", &[])
            .await?;
        response
            .get("listenKey")
            .and_then(|k| k.as_str())
            .map(|k| k.to_string())
            .context("venue response missing listenKey")
    }

    async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()> {
        self.keyed_request(
            Method::PUT,
            "/api/v3/userDataStream",
            &[("listenKey", listen_key.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn close_listen_key(&self, listen_key: &str) -> Result<()> {
        self.keyed_request(
            Method::DELETE,
            "/api/v3/userDataStream",
            &[("listenKey", listen_key.to_string())],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hmac_signature_matches_known_vector() {
        // Vector from the venue's API documentation.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let signature = VenueRestClient::sign(secret, query);
        assert_eq!(
            signature,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn numeric_fields_parse_from_strings_and_numbers() {
        let value = json!({"executedQty": "1.50000000", "origQty": 2.0});
        assert_eq!(field_f64(&value, "executedQty"), Some(1.5));
        assert_eq!(field_f64(&value, "origQty"), Some(2.0));
        assert_eq!(field_f64(&value, "missing"), None);
    }
}
