//! Venue Adapter: a venue-neutral capability set hiding wire
//! details, rate limiting, and clock skew behind one trait.

mod rate_limiter;
pub mod bybit;
pub mod bybit_ws;

pub use rate_limiter::{RateLimiterConfig, RateScheduler};

use crate::errors::VenueError;
use async_trait::async_trait;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    TakeProfitMarket,
    StopMarket,
    TakeProfitLimit,
    StopLimit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Clone, Debug, Default)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Option<OrderSide>,
    pub order_type: Option<OrderType>,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub position_side: Option<PositionSide>,
    pub time_in_force: Option<TimeInForce>,
    /// Client-generated idempotency token; resubmitting the same token must
    /// not create a second order.
    pub client_token: String,
}

impl OrderRequest {
    pub fn new(symbol: impl Into<String>, client_token: impl Into<String>) -> Self {
        OrderRequest {
            symbol: symbol.into(),
            client_token: client_token.into(),
            order_type: Some(OrderType::Market),
            time_in_force: Some(TimeInForce::Gtc),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

#[derive(Clone, Debug)]
pub struct OrderStatus {
    pub state: OrderState,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
}

#[derive(Clone, Debug)]
pub struct OpenPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub mark_price: f64,
}

#[derive(Clone, Debug)]
pub struct OpenOrder {
    pub symbol: String,
    pub venue_order_id: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub reduce_only: bool,
    pub qty: f64,
    pub price: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct SymbolMeta {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub hedge_mode: bool,
    pub price_precision: u32,
    pub qty_precision: u32,
}

/// Tagged account-stream events, decoded explicitly from venue payloads
/// into these variants; unknown events are logged and dropped by the
/// caller.
#[derive(Clone, Debug)]
pub enum AccountStreamEvent {
    OrderUpdate {
        venue_order_id: String,
        symbol: String,
        state: OrderState,
        filled_qty: f64,
        avg_fill_price: f64,
    },
    AccountUpdate {
        symbol: String,
        position_qty: f64,
        entry_price: f64,
    },
    ListenKeyExpired,
}

/// Outcome of attempting to place a protective exit order, as an explicit
/// result type rather than exception-as-control-flow.
#[derive(Clone, Debug)]
pub enum PlacementOutcome {
    Placed(String),
    RefusedBySymbol,
    RejectedBySize,
    Error(VenueError),
}

/// Rounds `qty` toward zero to the nearest multiple of `step`. A `step` of
/// zero disables rounding (the venue reports no minimum granularity).
pub fn round_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    (qty / step).trunc() * step
}

/// Rounds `price` toward zero to the nearest multiple of `tick`.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    (price / tick).trunc() * tick
}

/// Canonicalizes a symbol string: uppercase, no separators, quote currency
/// appended if missing.
pub fn normalize_symbol(raw: &str, default_quote: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase();
    if cleaned.ends_with(&default_quote.to_uppercase()) {
        cleaned
    } else {
        format!("{cleaned}{}", default_quote.to_uppercase())
    }
}

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Last trade price, served from the tick cache when fresh, else a REST
    /// fallback.
    async fn price(&self, symbol: &str) -> Result<f64, VenueError>;

    async fn submit_order(&self, req: OrderRequest) -> Result<String, VenueError>;

    /// Canceling a non-existent order is a non-error (spec R3).
    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> Result<(), VenueError>;

    async fn order_status(&self, symbol: &str, venue_order_id: &str) -> Result<OrderStatus, VenueError>;

    async fn open_positions(&self) -> Result<Vec<OpenPosition>, VenueError>;

    async fn closable_qty(&self, symbol: &str, side: PositionSide) -> Result<f64, VenueError>;

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, VenueError>;

    async fn symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, VenueError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError>;

    async fn set_position_mode(&self, hedge_mode: bool) -> Result<(), VenueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_rounding_truncates_toward_zero() {
        assert_eq!(round_to_step(1.2349, 0.001), 1.234);
        assert_eq!(round_to_step(-1.2349, 0.001), -1.234);
    }

    #[test]
    fn step_rounding_of_exact_multiple_is_a_no_op() {
        assert!((round_to_step(1.5, 0.1) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn tick_rounding_on_exact_tick_is_a_no_op() {
        // B2: price exactly on a tick rounds to itself.
        assert!((round_to_tick(100.50, 0.01) - 100.50).abs() < 1e-9);
    }

    #[test]
    fn zero_step_disables_rounding() {
        assert_eq!(round_to_step(1.23456, 0.0), 1.23456);
    }

    #[test]
    fn normalize_symbol_appends_missing_quote_and_uppercases() {
        assert_eq!(normalize_symbol("btc", "usdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("btc-usdt", "usdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("BTCUSDT", "usdt"), "BTCUSDT");
    }
}
