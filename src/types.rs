//! Domain entities. Identifiers are opaque newtypes over `u64` so a
//! `PositionId` can never be passed where an `EntryOrderId` is expected.

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(BotId);
id_type!(StrategyId);
id_type!(EntryOrderId);
id_type!(PositionId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SidePolicy {
    LongOnly,
    ShortOnly,
    Both,
}

impl SidePolicy {
    pub fn allows(self, side: Side) -> bool {
        match (self, side) {
            (SidePolicy::Both, _) => true,
            (SidePolicy::LongOnly, Side::Long) => true,
            (SidePolicy::ShortOnly, Side::Short) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyMode {
    TrendFollowing,
    CounterTrend,
}

/// A (bot, symbol, interval) rule. Mutated by the operator; read-only to the
/// engine outside of hot-reload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Strategy {
    pub id: StrategyId,
    pub bot_id: BotId,
    pub symbol: String,
    pub interval: String,
    pub side_policy: SidePolicy,
    pub mode: StrategyMode,
    pub oc_threshold_pct: f64,
    /// Only meaningful in `CounterTrend` mode.
    pub extend_pct: f64,
    pub notional_amount: f64,
    pub tp_pct: f64,
    pub sl_pct: Option<f64>,
    pub trail_reduce_pct: f64,
    pub trail_up_reduce_pct: f64,
    pub active: bool,
}

/// A trading-account binding. One `VenueAdapter` is instantiated per active
/// bot on startup and on enable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bot {
    pub id: BotId,
    pub name: String,
    pub venue: String,
    pub api_key: String,
    pub api_secret: String,
    pub proxy: Option<String>,
    pub max_concurrent_trades: usize,
    pub notification_channel: Option<String>,
    pub active: bool,
    /// Optional JSON filter predicate restricting which symbols this bot
    /// may trade; `None` means unrestricted.
    pub symbol_filter: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOrderStatus {
    Open,
    Filled,
    Canceled,
    Expired,
}

impl EntryOrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EntryOrderStatus::Open)
    }
}

/// One row per venue-submitted entry. Terminal statuses are immutable —
/// `EntryConfirmationMonitor` and `OrderService` are the only writers, and
/// only while `status == Open`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntryOrder {
    pub id: EntryOrderId,
    pub strategy_id: StrategyId,
    pub bot_id: BotId,
    pub venue_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub notional_amount: f64,
    pub target_entry_price: f64,
    pub status: EntryOrderStatus,
    pub reservation_token: Option<String>,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Canonical close reasons. `sync_exchange_empty` is deliberately not
/// modeled as distinct from `SyncNotOnExchange` — see DESIGN.md for why
/// the two collapse into one variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TpHit,
    SlHit,
    ManualTest,
    ForceCloseFromApi,
    GhostCleanupScript,
    SyncExchangeClosed,
    SyncNotOnExchange,
    SyncInvalidClose,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::TpHit => "tp_hit",
            CloseReason::SlHit => "sl_hit",
            CloseReason::ManualTest => "manual_test",
            CloseReason::ForceCloseFromApi => "force_close_from_api",
            CloseReason::GhostCleanupScript => "ghost_cleanup_script",
            CloseReason::SyncExchangeClosed => "sync_exchange_closed",
            CloseReason::SyncNotOnExchange => "sync_not_on_exchange",
            CloseReason::SyncInvalidClose => "sync_invalid_close",
        }
    }
}

/// Tracks whether the current TP order on the venue is a market take-profit,
/// a limit take-profit (market-variant rejection fallback), or has been
/// converted into a breakeven stop once trailing crossed entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitOrderKind {
    TakeProfitMarket,
    TakeProfitLimit,
    StopMarketBreakeven,
}

/// One row per confirmed open exposure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub strategy_id: StrategyId,
    pub bot_id: BotId,
    pub entry_order_id: EntryOrderId,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub notional_amount: f64,
    pub position_size: f64,
    pub tp_price: f64,
    pub initial_tp_price: f64,
    pub sl_price: Option<f64>,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub tp_order_kind: ExitOrderKind,
    /// Layer A falls back to enforcing SL in the control loop (MARKET close
    /// on crossing) when the venue refuses conditional orders.
    pub software_sl: bool,
    pub minutes_elapsed: u64,
    pub opened_at: i64,
    pub status: PositionStatus,
    pub close_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<i64>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn has_both_exits(&self) -> bool {
        self.tp_order_id.is_some() && self.sl_order_id.is_some()
    }

    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        (mark_price - self.entry_price) * self.position_size * self.side.sign()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OcDirection {
    Bullish,
    Bearish,
}

/// A candidate trade produced by the Signal Scanner.
#[derive(Clone, Debug)]
pub struct EntryIntent {
    pub strategy_id: StrategyId,
    pub bot_id: BotId,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub is_market: bool,
    pub notional_amount: f64,
    pub oc_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_policy_filters_correctly() {
        assert!(SidePolicy::Both.allows(Side::Long));
        assert!(SidePolicy::Both.allows(Side::Short));
        assert!(SidePolicy::LongOnly.allows(Side::Long));
        assert!(!SidePolicy::LongOnly.allows(Side::Short));
        assert!(SidePolicy::ShortOnly.allows(Side::Short));
        assert!(!SidePolicy::ShortOnly.allows(Side::Long));
    }

    #[test]
    fn unrealized_pnl_respects_side_sign() {
        let mut pos = sample_position(Side::Long, 100.0);
        assert_eq!(pos.unrealized_pnl(110.0), 100.0);
        pos.side = Side::Short;
        assert_eq!(pos.unrealized_pnl(110.0), -100.0);
    }

    fn sample_position(side: Side, entry: f64) -> Position {
        Position {
            id: PositionId(1),
            strategy_id: StrategyId(1),
            bot_id: BotId(1),
            entry_order_id: EntryOrderId(1),
            symbol: "BTCUSDT".into(),
            side,
            entry_price: entry,
            notional_amount: 1000.0,
            position_size: 10.0,
            tp_price: 110.0,
            initial_tp_price: 110.0,
            sl_price: Some(90.0),
            tp_order_id: None,
            sl_order_id: None,
            tp_order_kind: ExitOrderKind::TakeProfitMarket,
            software_sl: false,
            minutes_elapsed: 0,
            opened_at: 0,
            status: PositionStatus::Open,
            close_price: None,
            realized_pnl: None,
            close_reason: None,
            closed_at: None,
        }
    }
}
