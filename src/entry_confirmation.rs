//! Resolves open Entry Orders to filled/terminal-failed, from either a
//! pushed account-stream event or a REST poll, over the same venue-neutral
//! `AccountStreamEvent`/`OrderState` inputs.

use crate::types::{EntryOrder, EntryOrderStatus, ExitOrderKind, Position, PositionId, PositionStatus, Side, Strategy};
use crate::venue::{AccountStreamEvent, OrderState};

#[derive(Debug, Clone)]
pub enum ConfirmationOutcome {
    Filled(Position),
    TerminalFailureNoFill,
    /// Update did not move the Entry Order into a terminal state (e.g. a
    /// partial fill report); caller takes no action.
    Ignored,
}

impl PartialEq for ConfirmationOutcome {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (ConfirmationOutcome::Filled(_), ConfirmationOutcome::Filled(_))
                | (ConfirmationOutcome::TerminalFailureNoFill, ConfirmationOutcome::TerminalFailureNoFill)
                | (ConfirmationOutcome::Ignored, ConfirmationOutcome::Ignored)
        )
    }
}

fn tp_price(entry: f64, tp_pct: f64, side: Side) -> f64 {
    match side {
        Side::Long => entry * (1.0 + tp_pct / 100.0),
        Side::Short => entry * (1.0 - tp_pct / 100.0),
    }
}

fn sl_price(entry: f64, sl_pct: f64, side: Side) -> f64 {
    match side {
        Side::Long => entry * (1.0 - sl_pct / 100.0),
        Side::Short => entry * (1.0 + sl_pct / 100.0),
    }
}

/// Computes the terminal outcome of one account-stream order update against
/// the Entry Order it targets. Pure function: callers own persistence.
pub fn resolve_update(
    order: &EntryOrder,
    strategy: &Strategy,
    event_state: OrderState,
    reported_avg_fill_price: f64,
    fallback_entry_price: f64,
    position_id: PositionId,
    now: i64,
) -> ConfirmationOutcome {
    match event_state {
        OrderState::Filled => {
            let entry = if reported_avg_fill_price > 0.0 { reported_avg_fill_price } else { fallback_entry_price };
            let tp = tp_price(entry, strategy.tp_pct, order.side);
            let sl = strategy.sl_pct.map(|pct| sl_price(entry, pct, order.side));

            ConfirmationOutcome::Filled(Position {
                id: position_id,
                strategy_id: order.strategy_id,
                bot_id: order.bot_id,
                entry_order_id: order.id,
                symbol: order.symbol.clone(),
                side: order.side,
                entry_price: entry,
                notional_amount: order.notional_amount,
                position_size: order.notional_amount / entry,
                tp_price: tp,
                initial_tp_price: tp,
                sl_price: sl,
                tp_order_id: None,
                sl_order_id: None,
                tp_order_kind: ExitOrderKind::TakeProfitMarket,
                software_sl: false,
                minutes_elapsed: 0,
                opened_at: now,
                status: PositionStatus::Open,
                close_price: None,
                realized_pnl: None,
                close_reason: None,
                closed_at: None,
            })
        }
        OrderState::Canceled | OrderState::Expired | OrderState::Rejected => ConfirmationOutcome::TerminalFailureNoFill,
        OrderState::New | OrderState::PartiallyFilled => ConfirmationOutcome::Ignored,
    }
}

/// Matches one decoded account-stream event to an open Entry Order, if any.
pub fn match_event<'a>(event: &AccountStreamEvent, open_orders: &'a [EntryOrder]) -> Option<&'a EntryOrder> {
    match event {
        AccountStreamEvent::OrderUpdate { venue_order_id, .. } => {
            open_orders.iter().find(|o| o.status == EntryOrderStatus::Open && &o.venue_order_id == venue_order_id)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BotId, EntryOrderId, SidePolicy, StrategyId, StrategyMode};

    fn sample_order() -> EntryOrder {
        EntryOrder {
            id: EntryOrderId(1),
            strategy_id: StrategyId(1),
            bot_id: BotId(1),
            venue_order_id: "v-1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            notional_amount: 100.0,
            target_entry_price: 30000.0,
            status: EntryOrderStatus::Open,
            reservation_token: Some("tok".into()),
            created_at: 0,
        }
    }

    fn sample_strategy() -> Strategy {
        Strategy {
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
            sl_pct: Some(2.0),
            trail_reduce_pct: 1.0,
            trail_up_reduce_pct: 1.0,
            active: true,
        }
    }

    #[test]
    fn fill_computes_tp_and_sl_from_reported_avg_price() {
        let order = sample_order();
        let strat = sample_strategy();
        let outcome = resolve_update(&order, &strat, OrderState::Filled, 30010.0, 30000.0, PositionId(1), 1000);
        match outcome {
            ConfirmationOutcome::Filled(pos) => {
                assert_eq!(pos.entry_price, 30010.0);
                assert!((pos.tp_price - 30010.0 * 1.05).abs() < 1e-6);
                assert!((pos.sl_price.unwrap() - 30010.0 * 0.98).abs() < 1e-6);
                assert_eq!(pos.initial_tp_price, pos.tp_price);
                assert_eq!(pos.minutes_elapsed, 0);
            }
            other => panic!("expected Filled, got {other:?}"),
        }
    }

    #[test]
    fn fill_falls_back_to_intent_entry_price_when_no_avg_reported() {
        let order = sample_order();
        let strat = sample_strategy();
        let outcome = resolve_update(&order, &strat, OrderState::Filled, 0.0, 30000.0, PositionId(1), 1000);
        match outcome {
            ConfirmationOutcome::Filled(pos) => assert_eq!(pos.entry_price, 30000.0),
            other => panic!("expected Filled, got {other:?}"),
        }
    }

    #[test]
    fn zero_fill_cancel_is_terminal_failure_with_no_position() {
        let order = sample_order();
        let strat = sample_strategy();
        let outcome = resolve_update(&order, &strat, OrderState::Canceled, 0.0, 30000.0, PositionId(1), 1000);
        assert_eq!(outcome, ConfirmationOutcome::TerminalFailureNoFill);
    }

    #[test]
    fn partial_fill_is_ignored_pending_terminal_state() {
        let order = sample_order();
        let strat = sample_strategy();
        let outcome = resolve_update(&order, &strat, OrderState::PartiallyFilled, 0.0, 30000.0, PositionId(1), 1000);
        assert_eq!(outcome, ConfirmationOutcome::Ignored);
    }

    #[test]
    fn match_event_finds_open_order_by_venue_id() {
        let orders = vec![sample_order()];
        let event = AccountStreamEvent::OrderUpdate {
            venue_order_id: "v-1".into(),
            symbol: "BTCUSDT".into(),
            state: OrderState::Filled,
            filled_qty: 0.003,
            avg_fill_price: 30010.0,
        };
        assert!(match_event(&event, &orders).is_some());
    }
}
