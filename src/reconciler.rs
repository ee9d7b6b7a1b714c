//! Three-way diff between venue state and the internal book, run as a
//! recurring, venue-neutral sweep plus an orphan-order cancellation pass.

use crate::types::{BotId, CloseReason, EntryOrder, EntryOrderStatus, ExitOrderKind, Position, PositionId, Side, Strategy};
use crate::venue::{OpenOrder, OpenPosition, OrderType, PositionSide};
use std::collections::HashSet;

fn position_side_to_side(side: PositionSide) -> Side {
    match side {
        PositionSide::Long => Side::Long,
        PositionSide::Short => Side::Short,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VenueOnlyResolution {
    /// An open Entry Order already covers this venue position; drive it
    /// through Entry Confirmation rather than fabricating a new Position.
    MatchesOpenEntryOrder(crate::types::EntryOrderId),
    /// No matching order, but an active Strategy exists for (bot, symbol):
    /// synthesize a Position at the venue's reported entry price.
    Synthesize { entry_price: f64, synthetic_order_id: String },
    /// Neither an Entry Order nor an active Strategy explains this
    /// exposure; cannot attribute, skipped.
    Unattributable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftCorrection {
    pub position_id: PositionId,
    pub venue_qty: f64,
    pub book_qty: f64,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub venue_only: Vec<VenueOnlyResolution>,
    pub book_only_closed: Vec<PositionId>,
    pub drift: Vec<DriftCorrection>,
    pub stale_exit_ids_cleared: Vec<PositionId>,
    pub orphan_orders_canceled: Vec<String>,
}

/// Classifies one (bot, symbol, side) key into Venue-only / Book-only /
/// Both, given the venue's reported positions and the internal open book.
pub fn classify(venue_positions: &[OpenPosition], book_positions: &[Position]) -> (Vec<OpenPosition>, Vec<Position>, Vec<(OpenPosition, Position)>) {
    let mut venue_only = Vec::new();
    let mut book_only = Vec::new();
    let mut both = Vec::new();
    let mut matched_book: HashSet<PositionId> = HashSet::new();

    for vp in venue_positions {
        let side = position_side_to_side(vp.side);
        if let Some(bp) = book_positions.iter().find(|p| p.symbol == vp.symbol && p.side == side && p.is_open()) {
            both.push((vp.clone(), bp.clone()));
            matched_book.insert(bp.id);
        } else {
            venue_only.push(vp.clone());
        }
    }
    for bp in book_positions {
        if bp.is_open() && !matched_book.contains(&bp.id) {
            book_only.push(bp.clone());
        }
    }
    (venue_only, book_only, both)
}

/// Resolves one Venue-only exposure: prefer attributing it to an open
/// Entry Order, fall back to synthesizing a Position from an active
/// Strategy, otherwise leave it unattributable.
pub fn resolve_venue_only(
    venue_position: &OpenPosition,
    bot_id: BotId,
    open_entry_orders: &[EntryOrder],
    active_strategies: &[Strategy],
    now: i64,
) -> VenueOnlyResolution {
    let side = position_side_to_side(venue_position.side);
    if let Some(order) = open_entry_orders
        .iter()
        .find(|o| o.bot_id == bot_id && o.symbol == venue_position.symbol && o.side == side && o.status == EntryOrderStatus::Open)
    {
        return VenueOnlyResolution::MatchesOpenEntryOrder(order.id);
    }
    if active_strategies.iter().any(|s| s.bot_id == bot_id && s.symbol == venue_position.symbol && s.side_policy.allows(side)) {
        return VenueOnlyResolution::Synthesize {
            entry_price: venue_position.entry_price,
            synthetic_order_id: format!("sync_{now}"),
        };
    }
    VenueOnlyResolution::Unattributable
}

/// Drift tolerance check for a Both-sets pair.
pub fn drift_exceeds_tolerance(venue_qty: f64, book_qty: f64, tolerance_pct: f64) -> bool {
    if book_qty == 0.0 {
        return venue_qty != 0.0;
    }
    ((venue_qty - book_qty).abs() / book_qty.abs()) * 100.0 > tolerance_pct
}

/// Partitions live venue orders into take-profit and stop-loss id sets for
/// `clear_stale_exit_if_missing`.
pub fn live_exit_id_sets(open_orders: &[OpenOrder]) -> (HashSet<String>, HashSet<String>) {
    let mut tp_ids = HashSet::new();
    let mut sl_ids = HashSet::new();
    for order in open_orders {
        match order.order_type {
            OrderType::TakeProfitMarket | OrderType::TakeProfitLimit => {
                tp_ids.insert(order.venue_order_id.clone());
            }
            OrderType::StopMarket | OrderType::StopLimit => {
                sl_ids.insert(order.venue_order_id.clone());
            }
            OrderType::Market | OrderType::Limit => {}
        }
    }
    (tp_ids, sl_ids)
}

/// Orphan sweep: reduce-only venue orders with no matching open Position
/// are stale and get canceled.
pub fn find_orphan_orders<'a>(open_orders: &'a [OpenOrder], book_positions: &[Position]) -> Vec<&'a OpenOrder> {
    open_orders
        .iter()
        .filter(|o| o.reduce_only)
        .filter(|o| !book_positions.iter().any(|p| p.is_open() && p.symbol == o.symbol))
        .collect()
}

/// Clears a stale exit id so Layer A re-attaches it next cycle. Returns
/// the fields that changed without mutating in place, so callers decide
/// whether to persist.
pub fn clear_stale_exit_if_missing(position: &mut Position, live_tp_ids: &HashSet<String>, live_sl_ids: &HashSet<String>) -> bool {
    let mut cleared = false;
    if let Some(id) = &position.tp_order_id {
        if !live_tp_ids.contains(id) {
            position.tp_order_id = None;
            position.tp_order_kind = ExitOrderKind::TakeProfitMarket;
            cleared = true;
        }
    }
    if let Some(id) = &position.sl_order_id {
        if !live_sl_ids.contains(id) {
            position.sl_order_id = None;
            cleared = true;
        }
    }
    cleared
}

/// Book-only closure: the venue no longer reports this exposure. Closed
/// with `sync_not_on_exchange`, price taken from the last known mark (the
/// reconciler's only authority to declare "no position").
pub fn close_book_only(position: &Position, last_known_price: f64) -> (f64, f64, CloseReason) {
    let pnl = crate::position_monitor::realized_pnl(position, last_known_price);
    (last_known_price, pnl, CloseReason::SyncNotOnExchange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryOrderId, ExitOrderKind, PositionStatus, SidePolicy, StrategyId, StrategyMode};

    fn venue_pos(symbol: &str, side: PositionSide, qty: f64, entry: f64) -> OpenPosition {
        OpenPosition { symbol: symbol.into(), side, qty, entry_price: entry, mark_price: entry }
    }

    fn book_pos(id: u64, symbol: &str, side: Side) -> Position {
        Position {
            id: PositionId(id),
            strategy_id: StrategyId(1),
            bot_id: BotId(1),
            entry_order_id: EntryOrderId(1),
            symbol: symbol.into(),
            side,
            entry_price: 30000.0,
            notional_amount: 100.0,
            position_size: 0.0033,
            tp_price: 31500.0,
            initial_tp_price: 31500.0,
            sl_price: Some(29000.0),
            tp_order_id: Some("tp-1".into()),
            sl_order_id: Some("sl-1".into()),
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

    #[test]
    fn classifies_venue_only_book_only_and_both() {
        let venue = vec![venue_pos("BTCUSDT", PositionSide::Long, 0.01, 30000.0), venue_pos("ETHUSDT", PositionSide::Long, 1.0, 2000.0)];
        let book = vec![book_pos(1, "BTCUSDT", Side::Long), book_pos(2, "SOLUSDT", Side::Long)];

        let (venue_only, book_only, both) = classify(&venue, &book);
        assert_eq!(venue_only.len(), 1);
        assert_eq!(venue_only[0].symbol, "ETHUSDT");
        assert_eq!(book_only.len(), 1);
        assert_eq!(book_only[0].symbol, "SOLUSDT");
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].1.symbol, "BTCUSDT");
    }

    #[test]
    fn venue_only_matches_open_entry_order_before_synthesizing() {
        let vp = venue_pos("BTCUSDT", PositionSide::Long, 0.01, 30000.0);
        let order = EntryOrder {
            id: EntryOrderId(7),
            strategy_id: StrategyId(1),
            bot_id: BotId(1),
            venue_order_id: "v-7".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            notional_amount: 100.0,
            target_entry_price: 30000.0,
            status: EntryOrderStatus::Open,
            reservation_token: None,
            created_at: 0,
        };
        let resolution = resolve_venue_only(&vp, BotId(1), &[order], &[], 1000);
        assert_eq!(resolution, VenueOnlyResolution::MatchesOpenEntryOrder(EntryOrderId(7)));
    }

    #[test]
    fn venue_only_synthesizes_when_strategy_active_but_no_order() {
        let vp = venue_pos("BTCUSDT", PositionSide::Long, 0.01, 30000.0);
        let strat = Strategy {
            id: StrategyId(1),
            bot_id: BotId(1),
            symbol: "BTCUSDT".into(),
            interval: "5m".into(),
            side_policy: SidePolicy::Both,
            mode: StrategyMode::TrendFollowing,
            oc_threshold_pct: 0.5,
            extend_pct: 0.0,
            notional_amount: 100.0,
            tp_pct: 5.0,
            sl_pct: None,
            trail_reduce_pct: 1.0,
            trail_up_reduce_pct: 1.0,
            active: true,
        };
        let resolution = resolve_venue_only(&vp, BotId(1), &[], &[strat], 1000);
        match resolution {
            VenueOnlyResolution::Synthesize { entry_price, synthetic_order_id } => {
                assert_eq!(entry_price, 30000.0);
                assert_eq!(synthetic_order_id, "sync_1000");
            }
            other => panic!("expected Synthesize, got {other:?}"),
        }
    }

    #[test]
    fn venue_only_unattributable_without_order_or_strategy() {
        let vp = venue_pos("BTCUSDT", PositionSide::Long, 0.01, 30000.0);
        let resolution = resolve_venue_only(&vp, BotId(1), &[], &[], 1000);
        assert_eq!(resolution, VenueOnlyResolution::Unattributable);
    }

    #[test]
    fn drift_within_tolerance_is_not_flagged() {
        assert!(!drift_exceeds_tolerance(0.0100, 0.0102, 5.0));
        assert!(drift_exceeds_tolerance(0.0100, 0.0200, 5.0));
    }

    #[test]
    fn orphan_sweep_finds_reduce_only_orders_with_no_matching_position() {
        let orders = vec![
            OpenOrder { symbol: "BTCUSDT".into(), venue_order_id: "o1".into(), side: crate::venue::OrderSide::Sell, order_type: crate::venue::OrderType::StopMarket, reduce_only: true, qty: 0.01, price: None },
            OpenOrder { symbol: "ETHUSDT".into(), venue_order_id: "o2".into(), side: crate::venue::OrderSide::Sell, order_type: crate::venue::OrderType::Limit, reduce_only: false, qty: 1.0, price: Some(2000.0) },
        ];
        let book = vec![];
        let orphans = find_orphan_orders(&orders, &book);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].venue_order_id, "o1");
    }

    #[test]
    fn stale_exit_id_is_cleared_when_not_live_on_venue() {
        let mut pos = book_pos(1, "BTCUSDT", Side::Long);
        let live_tp: HashSet<String> = HashSet::new();
        let live_sl: HashSet<String> = ["sl-1".to_string()].into_iter().collect();
        let cleared = clear_stale_exit_if_missing(&mut pos, &live_tp, &live_sl);
        assert!(cleared);
        assert!(pos.tp_order_id.is_none());
        assert!(pos.sl_order_id.is_some());
    }

    #[test]
    fn live_exit_id_sets_partitions_by_order_type() {
        let orders = vec![
            OpenOrder { symbol: "BTCUSDT".into(), venue_order_id: "tp-1".into(), side: crate::venue::OrderSide::Sell, order_type: OrderType::TakeProfitMarket, reduce_only: true, qty: 0.01, price: None },
            OpenOrder { symbol: "BTCUSDT".into(), venue_order_id: "sl-1".into(), side: crate::venue::OrderSide::Sell, order_type: OrderType::StopMarket, reduce_only: true, qty: 0.01, price: None },
            OpenOrder { symbol: "BTCUSDT".into(), venue_order_id: "o3".into(), side: crate::venue::OrderSide::Buy, order_type: OrderType::Limit, reduce_only: false, qty: 0.01, price: Some(30000.0) },
        ];
        let (tp_ids, sl_ids) = live_exit_id_sets(&orders);
        assert!(tp_ids.contains("tp-1"));
        assert!(sl_ids.contains("sl-1"));
        assert!(!tp_ids.contains("o3") && !sl_ids.contains("o3"));
    }
}
