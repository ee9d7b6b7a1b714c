//! Concrete `VenueAdapter` for Bybit V5 linear perpetuals: HMAC-SHA256
//! signed REST with a retry wrapper, behind the venue-neutral trait.

use super::{
    normalize_symbol, AccountStreamEvent, OpenOrder, OpenPosition, OrderRequest, OrderState,
    OrderStatus, OrderType, PositionSide, RateScheduler, SymbolMeta, VenueAdapter,
};
use crate::errors::VenueError;
use crate::venue::rate_limiter::{RateLimiterConfig, RequestClass};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

type HmacSha256 = Hmac<Sha256>;

/// Classify a Bybit retCode + HTTP status into a `VenueError`.
fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> VenueError {
    match (ret_code, http_status) {
        (10006, _) | (_, 429) => VenueError::RateLimited { retry_after_secs: 10 },
        (10016, _) | (_, 500..=599) => VenueError::Timeout,
        (110007, _) | (110012, _) => VenueError::InvalidSize,
        (110017, _) => VenueError::InvalidPrice,
        (110025, _) => VenueError::PositionModeMismatch,
        (110001, _) => VenueError::NotFound,
        (10003, _) | (10004, _) | (_, 401) => VenueError::Unauthorized,
        _ => VenueError::VenueRejected { code: ret_code, msg: msg.to_string() },
    }
}

async fn with_retry<F, Fut, T>(scheduler: &RateScheduler, operation: F, max_retries: u32) -> Result<T, VenueError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let mut retries = 0;
    let mut delay = Duration::from_secs(1);
    loop {
        match operation().await {
            Ok(r) => {
                scheduler.record_success();
                return Ok(r);
            }
            Err(VenueError::RateLimited { retry_after_secs }) => {
                scheduler.record_failure();
                if retries >= max_retries {
                    return Err(VenueError::RateLimited { retry_after_secs });
                }
                log::warn!("rate limited — sleeping {}s (attempt {}/{})", retry_after_secs, retries + 1, max_retries);
                tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                retries += 1;
            }
            Err(VenueError::Timeout) | Err(VenueError::TransportError(_)) => {
                scheduler.record_failure();
                if retries >= max_retries {
                    return Err(VenueError::Timeout);
                }
                log::warn!("transient error — retry in {:?} ({}/{})", delay, retries + 1, max_retries);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(60));
                retries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct BybitVenue {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    default_quote: String,
    scheduler: Arc<RateScheduler>,
}

impl BybitVenue {
    pub fn new(base_url: impl Into<String>, api_key: String, api_secret: String, rate_limiter_config: RateLimiterConfig) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("HTTP client build failed");

        BybitVenue {
            client,
            base_url: base_url.into(),
            api_key,
            api_secret,
            default_quote: "USDT".to_string(),
            scheduler: Arc::new(RateScheduler::new(rate_limiter_config)),
        }
    }

    pub fn rate_scheduler(&self) -> Arc<RateScheduler> {
        self.scheduler.clone()
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("HMAC init failed");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, body: &str) -> reqwest::header::HeaderMap {
        let ts = Self::timestamp_ms().to_string();
        let recv_window = "5000";
        let payload = format!("{}{}{}{}", ts, self.api_key, recv_window, body);
        let signature = self.sign(&payload);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-BAPI-API-KEY", self.api_key.parse().unwrap());
        headers.insert("X-BAPI-TIMESTAMP", ts.parse().unwrap());
        headers.insert("X-BAPI-SIGN", signature.parse().unwrap());
        headers.insert("X-BAPI-RECV-WINDOW", recv_window.parse().unwrap());
        headers.insert(reqwest::header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers
    }

    async fn post_signed(&self, path: &str, body: String) -> Result<serde_json::Value, VenueError> {
        self.scheduler.wait_turn(RequestClass::Signed).await;
        let url = format!("{}{}", self.base_url, path);
        let headers = self.signed_headers(&body);
        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| VenueError::TransportError(e.to_string()))?;

        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp.json().await.map_err(|e| VenueError::TransportError(e.to_string()))?;
        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json)
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status, msg))
        }
    }

    async fn get_signed(&self, path: &str, query: &str) -> Result<serde_json::Value, VenueError> {
        self.scheduler.wait_turn(RequestClass::Signed).await;
        let ts = Self::timestamp_ms().to_string();
        let recv_window = "5000";
        let payload = format!("{}{}{}{}", ts, self.api_key, recv_window, query);
        let signature = self.sign(&payload);

        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &ts)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", recv_window)
            .send()
            .await
            .map_err(|e| VenueError::TransportError(e.to_string()))?;

        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp.json().await.map_err(|e| VenueError::TransportError(e.to_string()))?;
        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code == 0 {
            Ok(json)
        } else {
            let msg = json["retMsg"].as_str().unwrap_or("unknown");
            Err(classify_error(ret_code, http_status, msg))
        }
    }

    fn order_type_str(t: OrderType) -> &'static str {
        match t {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
            OrderType::TakeProfitMarket => "Market",
            OrderType::StopMarket => "Market",
            OrderType::TakeProfitLimit => "Limit",
            OrderType::StopLimit => "Limit",
        }
    }

    fn parse_order_state(s: &str) -> OrderState {
        match s {
            "New" | "Untriggered" | "PendingCancel" => OrderState::New,
            "PartiallyFilled" => OrderState::PartiallyFilled,
            "Filled" => OrderState::Filled,
            "Cancelled" | "Deactivated" => OrderState::Canceled,
            "Expired" | "Triggered" => OrderState::Expired,
            "Rejected" => OrderState::Rejected,
            _ => OrderState::New,
        }
    }
}

#[async_trait]
impl VenueAdapter for BybitVenue {
    async fn price(&self, symbol: &str) -> Result<f64, VenueError> {
        let symbol = normalize_symbol(symbol, &self.default_quote);
        self.scheduler.wait_turn(RequestClass::MarketData).await;
        let url = format!(
            "{}/v5/market/tickers?category=linear&symbol={}",
            self.base_url, symbol
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VenueError::TransportError(e.to_string()))?;
        let json: serde_json::Value = resp.json().await.map_err(|e| VenueError::TransportError(e.to_string()))?;
        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            return Err(VenueError::VenueRejected { code: ret_code, msg: "tickers".into() });
        }
        json["result"]["list"][0]["lastPrice"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or(VenueError::NotFound)
    }

    async fn submit_order(&self, req: OrderRequest) -> Result<String, VenueError> {
        let symbol = normalize_symbol(&req.symbol, &self.default_quote);
        if req.qty <= 0.0 {
            return Err(VenueError::InvalidSize);
        }
        let side_str = match req.side {
            Some(super::OrderSide::Buy) => "Buy",
            Some(super::OrderSide::Sell) => "Sell",
            None => return Err(VenueError::InvalidSize),
        };
        let order_type = req.order_type.unwrap_or(OrderType::Market);
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side_str,
            "orderType": Self::order_type_str(order_type),
            "qty": format!("{:.8}", req.qty),
            "orderLinkId": req.client_token,
            "timeInForce": "GTC",
        });
        if let Some(price) = req.price {
            body["price"] = serde_json::json!(format!("{:.8}", price));
        }
        if let Some(stop) = req.stop_price {
            body["triggerPrice"] = serde_json::json!(format!("{:.8}", stop));
        }
        if req.reduce_only {
            body["reduceOnly"] = serde_json::json!(true);
        }
        if let Some(ps) = req.position_side {
            body["positionIdx"] = serde_json::json!(match ps {
                PositionSide::Long => 1,
                PositionSide::Short => 2,
            });
        }

        let json = with_retry(&self.scheduler, || {
            let body = body.to_string();
            async move { self.post_signed("/v5/order/create", body).await }
        }, 3).await?;

        Ok(json["result"]["orderId"].as_str().unwrap_or_default().to_string())
    }

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> Result<(), VenueError> {
        let symbol = normalize_symbol(symbol, &self.default_quote);
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": venue_order_id,
        })
        .to_string();
        match self.post_signed("/v5/order/cancel", body).await {
            Ok(_) => Ok(()),
            // R3: canceling an already-terminal/non-existent order is a non-error.
            Err(VenueError::NotFound) => Ok(()),
            Err(VenueError::VenueRejected { code: 110001, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn order_status(&self, symbol: &str, venue_order_id: &str) -> Result<OrderStatus, VenueError> {
        let symbol = normalize_symbol(symbol, &self.default_quote);
        let query = format!("category=linear&symbol={}&orderId={}", symbol, venue_order_id);
        let json = self.get_signed("/v5/order/realtime", &query).await?;
        let entry = json["result"]["list"]
            .as_array()
            .and_then(|a| a.first())
            .ok_or(VenueError::NotFound)?;
        Ok(OrderStatus {
            state: Self::parse_order_state(entry["orderStatus"].as_str().unwrap_or("New")),
            filled_qty: entry["cumExecQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            avg_fill_price: entry["avgPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
        })
    }

    async fn open_positions(&self) -> Result<Vec<OpenPosition>, VenueError> {
        let query = "category=linear&settleCoin=USDT&limit=200";
        let json = self.get_signed("/v5/position/list", query).await?;
        let list = json["result"]["list"].as_array().cloned().unwrap_or_default();
        Ok(list
            .into_iter()
            .filter_map(|entry| {
                let size: f64 = entry["size"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                if size == 0.0 {
                    return None;
                }
                let side = if entry["side"].as_str() == Some("Sell") { PositionSide::Short } else { PositionSide::Long };
                Some(OpenPosition {
                    symbol: entry["symbol"].as_str()?.to_string(),
                    side,
                    qty: size,
                    entry_price: entry["avgPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    mark_price: entry["markPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn closable_qty(&self, symbol: &str, side: PositionSide) -> Result<f64, VenueError> {
        let symbol = normalize_symbol(symbol, &self.default_quote);
        Ok(self
            .open_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol && p.side == side)
            .map(|p| p.qty)
            .unwrap_or(0.0))
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, VenueError> {
        let query = match symbol {
            Some(s) => format!("category=linear&symbol={}", normalize_symbol(s, &self.default_quote)),
            None => "category=linear&settleCoin=USDT&limit=200".to_string(),
        };
        let json = self.get_signed("/v5/order/realtime", &query).await?;
        let list = json["result"]["list"].as_array().cloned().unwrap_or_default();
        Ok(list
            .into_iter()
            .filter_map(|entry| {
                Some(OpenOrder {
                    symbol: entry["symbol"].as_str()?.to_string(),
                    venue_order_id: entry["orderId"].as_str()?.to_string(),
                    side: if entry["side"].as_str() == Some("Sell") { super::OrderSide::Sell } else { super::OrderSide::Buy },
                    order_type: OrderType::Limit,
                    reduce_only: entry["reduceOnly"].as_bool().unwrap_or(false),
                    qty: entry["qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    price: entry["price"].as_str().and_then(|s| s.parse().ok()),
                })
            })
            .collect())
    }

    async fn symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, VenueError> {
        let symbol = normalize_symbol(symbol, &self.default_quote);
        self.scheduler.wait_turn(RequestClass::MarketData).await;
        let url = format!(
            "{}/v5/market/instruments-info?category=linear&symbol={}",
            self.base_url, symbol
        );
        let resp = self.client.get(&url).send().await.map_err(|e| VenueError::TransportError(e.to_string()))?;
        let json: serde_json::Value = resp.json().await.map_err(|e| VenueError::TransportError(e.to_string()))?;
        let entry = json["result"]["list"][0].clone();
        if entry.is_null() {
            return Err(VenueError::NotFound);
        }
        Ok(SymbolMeta {
            tick_size: entry["priceFilter"]["tickSize"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.01),
            step_size: entry["lotSizeFilter"]["qtyStep"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.001),
            min_notional: entry["lotSizeFilter"]["minNotionalValue"].as_str().and_then(|s| s.parse().ok()).unwrap_or(5.0),
            hedge_mode: false,
            price_precision: 2,
            qty_precision: 3,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        let symbol = normalize_symbol(symbol, &self.default_quote);
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        })
        .to_string();
        match self.post_signed("/v5/position/set-leverage", body).await {
            Ok(_) => Ok(()),
            // retCode 110043: "leverage not modified" — idempotent no-op (R2).
            Err(VenueError::VenueRejected { code: 110043, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_position_mode(&self, hedge_mode: bool) -> Result<(), VenueError> {
        let body = serde_json::json!({
            "category": "linear",
            "mode": if hedge_mode { 3 } else { 0 },
        })
        .to_string();
        match self.post_signed("/v5/position/switch-mode", body).await {
            Ok(_) => Ok(()),
            Err(VenueError::VenueRejected { code: 110025, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Minimal account-stream decoder for Bybit's private WS payloads
/// (`order`/`execution`/`position` topics). Pushed events are delivered on
/// an mpsc channel; unknown topics are logged and dropped.
pub fn decode_account_stream_message(topic: &str, data: &serde_json::Value) -> Vec<AccountStreamEvent> {
    let mut events = Vec::new();
    match topic {
        "order" => {
            if let Some(list) = data.as_array() {
                for item in list {
                    events.push(AccountStreamEvent::OrderUpdate {
                        venue_order_id: item["orderId"].as_str().unwrap_or_default().to_string(),
                        symbol: item["symbol"].as_str().unwrap_or_default().to_string(),
                        state: BybitVenue::parse_order_state(item["orderStatus"].as_str().unwrap_or("New")),
                        filled_qty: item["cumExecQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                        avg_fill_price: item["avgPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    });
                }
            }
        }
        "position" => {
            if let Some(list) = data.as_array() {
                for item in list {
                    events.push(AccountStreamEvent::AccountUpdate {
                        symbol: item["symbol"].as_str().unwrap_or_default().to_string(),
                        position_qty: item["size"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                        entry_price: item["entryPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    });
                }
            }
        }
        _ => {
            log::debug!("account stream: ignoring unknown topic '{}'", topic);
        }
    }
    events
}

pub type AccountStreamReceiver = mpsc::Receiver<AccountStreamEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_error_maps_known_codes() {
        assert!(matches!(classify_error(10006, 200, ""), VenueError::RateLimited { .. }));
        assert!(matches!(classify_error(10016, 200, ""), VenueError::Timeout));
        assert!(matches!(classify_error(110007, 200, ""), VenueError::InvalidSize));
        assert!(matches!(classify_error(1, 200, "x"), VenueError::VenueRejected { .. }));
    }

    #[test]
    fn decode_account_stream_drops_unknown_topics() {
        let events = decode_account_stream_message("wallet", &serde_json::json!([]));
        assert!(events.is_empty());
    }

    #[test]
    fn decode_account_stream_parses_order_updates() {
        let data = serde_json::json!([{
            "orderId": "abc123",
            "symbol": "BTCUSDT",
            "orderStatus": "Filled",
            "cumExecQty": "0.01",
            "avgPrice": "30180.0"
        }]);
        let events = decode_account_stream_message("order", &data);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AccountStreamEvent::OrderUpdate { state, avg_fill_price, .. } => {
                assert_eq!(*state, OrderState::Filled);
                assert!((*avg_fill_price - 30180.0).abs() < 1e-6);
            }
            _ => panic!("expected OrderUpdate"),
        }
    }
}
