//! Control loop over open Positions. Layer A attaches missing TP/SL exits
//! with a two-phase commit; Layer B trails TP/SL and detects fills, over a
//! venue-neutral, per-Position pipeline.

use crate::errors::VenueError;
use crate::types::{CloseReason, ExitOrderKind, Position, Side};
use crate::venue::{OrderRequest, OrderSide, OrderType, PositionSide, VenueAdapter};

#[derive(Debug, Clone)]
pub enum LayerAOutcome {
    BothExitsPresent,
    TpAttached { tp_order_id: String, kind: ExitOrderKind },
    SlAttached { sl_order_id: String },
    SoftwareSlEngaged,
    /// Two-phase commit aborted: the position closed or the TP filled
    /// between placing TP and attempting SL.
    AbortedPositionChanged,
    Failed(VenueError),
}

impl PartialEq for LayerAOutcome {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LayerAOutcome::BothExitsPresent, LayerAOutcome::BothExitsPresent) => true,
            (LayerAOutcome::TpAttached { kind: k1, .. }, LayerAOutcome::TpAttached { kind: k2, .. }) => k1 == k2,
            (LayerAOutcome::SlAttached { .. }, LayerAOutcome::SlAttached { .. }) => true,
            (LayerAOutcome::SoftwareSlEngaged, LayerAOutcome::SoftwareSlEngaged) => true,
            (LayerAOutcome::AbortedPositionChanged, LayerAOutcome::AbortedPositionChanged) => true,
            (LayerAOutcome::Failed(_), LayerAOutcome::Failed(_)) => true,
            _ => false,
        }
    }
}

fn exit_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Sell,
        Side::Short => OrderSide::Buy,
    }
}

fn position_side_of(side: Side) -> PositionSide {
    match side {
        Side::Long => PositionSide::Long,
        Side::Short => PositionSide::Short,
    }
}

/// Places a reduce-only TAKE_PROFIT_MARKET, falling back to LIMIT if the
/// venue rejects the market variant.
pub async fn attach_take_profit<V: VenueAdapter>(
    venue: &V,
    position: &Position,
    hedge_mode: bool,
) -> Result<(String, ExitOrderKind), VenueError> {
    let mut req = OrderRequest::new(position.symbol.clone(), format!("tp-{}", position.id));
    req.side = Some(exit_side(position.side));
    req.order_type = Some(OrderType::TakeProfitMarket);
    req.qty = position.position_size;
    req.stop_price = Some(position.tp_price);
    req.reduce_only = true;
    req.position_side = if hedge_mode { Some(position_side_of(position.side)) } else { None };

    match venue.submit_order(req.clone()).await {
        Ok(id) => Ok((id, ExitOrderKind::TakeProfitMarket)),
        Err(e) if e.is_price_too_close_to_market() => {
            let mut limit_req = req;
            limit_req.order_type = Some(OrderType::TakeProfitLimit);
            limit_req.price = Some(position.tp_price);
            let id = venue.submit_order(limit_req).await?;
            Ok((id, ExitOrderKind::TakeProfitLimit))
        }
        Err(e) => Err(e),
    }
}

/// Places a STOP_MARKET stop-loss. Returns `Ok(None)` when the venue
/// refuses conditional orders entirely, signaling software-SL mode.
pub async fn attach_stop_loss<V: VenueAdapter>(
    venue: &V,
    position: &Position,
    sl_price: f64,
    hedge_mode: bool,
) -> Result<Option<String>, VenueError> {
    let mut req = OrderRequest::new(position.symbol.clone(), format!("sl-{}", position.id));
    req.side = Some(exit_side(position.side));
    req.order_type = Some(OrderType::StopMarket);
    req.qty = position.position_size;
    req.stop_price = Some(sl_price);
    req.reduce_only = true;
    req.position_side = if hedge_mode { Some(position_side_of(position.side)) } else { None };

    match venue.submit_order(req).await {
        Ok(id) => Ok(Some(id)),
        Err(VenueError::PositionModeMismatch) | Err(VenueError::InvalidPrice) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Runs the two-phase commit for one Position missing one or both exits.
/// `still_open_and_tp_unfilled` re-verifies venue state right before
/// placing SL, guarding against the position closing or the TP filling
/// between the two phases.
pub async fn ensure_exits<V: VenueAdapter>(
    venue: &V,
    position: &mut Position,
    hedge_mode: bool,
    still_open_and_tp_unfilled: impl std::future::Future<Output = Result<bool, VenueError>>,
) -> LayerAOutcome {
    if position.has_both_exits() {
        return LayerAOutcome::BothExitsPresent;
    }

    if position.tp_order_id.is_none() {
        match attach_take_profit(venue, position, hedge_mode).await {
            Ok((id, kind)) => {
                position.tp_order_id = Some(id.clone());
                position.tp_order_kind = kind;
                return LayerAOutcome::TpAttached { tp_order_id: id, kind };
            }
            Err(e) => return LayerAOutcome::Failed(e),
        }
    }

    match still_open_and_tp_unfilled.await {
        Ok(true) => {}
        Ok(false) => return LayerAOutcome::AbortedPositionChanged,
        Err(e) => return LayerAOutcome::Failed(e),
    }

    match attach_stop_loss(venue, position, position.sl_price.unwrap_or(position.entry_price), hedge_mode).await {
        Ok(Some(id)) => {
            position.sl_order_id = Some(id.clone());
            LayerAOutcome::SlAttached { sl_order_id: id }
        }
        Ok(None) => {
            position.software_sl = true;
            LayerAOutcome::SoftwareSlEngaged
        }
        Err(e) => LayerAOutcome::Failed(e),
    }
}

/// `true` once an open Position has waited longer than `emergency_ttl` for
/// both exits, bypassing normal rate throttling to complete Layer A.
pub fn is_emergency(position: &Position, now: i64, emergency_ttl_secs: i64) -> bool {
    !position.has_both_exits() && (now - position.opened_at) > emergency_ttl_secs
}

/// Trailing TP recomputation for one minute boundary. Returns the new TP
/// and, if it crossed entry, the converted exit kind in break-even
/// territory. Trail rates live on the Strategy, not the Position, so
/// they're passed in explicitly.
pub fn trail_take_profit_with_rates(
    position: &Position,
    trail_reduce_pct: f64,
    trail_up_reduce_pct: f64,
    delta_minutes: u64,
) -> (f64, ExitOrderKind) {
    let range = (position.initial_tp_price - position.entry_price).abs();
    let trail_pct = match position.side {
        Side::Long => trail_up_reduce_pct,
        Side::Short => trail_reduce_pct,
    };
    let step_per_minute = range * (trail_pct / 100.0);
    let total_step = step_per_minute * delta_minutes as f64;

    let raw_new_tp = match position.side {
        Side::Long => position.tp_price - total_step,
        Side::Short => position.tp_price + total_step,
    };

    let crossed_entry = match position.side {
        Side::Long => raw_new_tp <= position.entry_price,
        Side::Short => raw_new_tp >= position.entry_price,
    };

    if crossed_entry {
        (position.entry_price, ExitOrderKind::StopMarketBreakeven)
    } else {
        (raw_new_tp, position.tp_order_kind)
    }
}

/// Replacement threshold gate: only cancel/replace the venue order when
/// the move exceeds both an absolute tick-count bound and a relative
/// percentage bound.
pub fn should_replace_exit_order(prev: f64, new: f64, tick_size: f64, min_tick_count: f64, min_price_change_pct: f64) -> bool {
    let abs_move = (new - prev).abs();
    let avg = (prev + new) / 2.0;
    let pct_move = if avg == 0.0 { 0.0 } else { abs_move / avg * 100.0 };
    abs_move > min_tick_count * tick_size && pct_move > min_price_change_pct
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillDetection {
    TpFilled,
    SlFilled,
    NoFill,
}

pub fn realized_pnl(position: &Position, close_price: f64) -> f64 {
    (close_price - position.entry_price) * position.position_size * position.side.sign()
}

pub fn close_reason_for_fill(fill: FillDetection) -> Option<CloseReason> {
    match fill {
        FillDetection::TpFilled => Some(CloseReason::TpHit),
        FillDetection::SlFilled => Some(CloseReason::SlHit),
        FillDetection::NoFill => None,
    }
}

/// Software-SL enforcement: when the venue refused a conditional stop,
/// the control loop itself market-closes on crossing.
pub fn software_sl_triggered(position: &Position, mark_price: f64) -> bool {
    if !position.software_sl {
        return false;
    }
    match (position.side, position.sl_price) {
        (Side::Long, Some(sl)) => mark_price <= sl,
        (Side::Short, Some(sl)) => mark_price >= sl,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BotId, EntryOrderId, PositionId, PositionStatus, StrategyId};
    use crate::venue::{OpenOrder, OpenPosition, OrderStatus, SymbolMeta};
    use async_trait::async_trait;

    fn sample_position(side: Side) -> Position {
        Position {
            id: PositionId(1),
            strategy_id: StrategyId(1),
            bot_id: BotId(1),
            entry_order_id: EntryOrderId(1),
            symbol: "BTCUSDT".into(),
            side,
            entry_price: 30000.0,
            notional_amount: 100.0,
            position_size: 0.0033,
            tp_price: 31500.0,
            initial_tp_price: 31500.0,
            sl_price: Some(29000.0),
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

    struct FakeVenue {
        tp_rejects_market: bool,
        sl_rejects: bool,
    }

    #[async_trait]
    impl VenueAdapter for FakeVenue {
        async fn price(&self, _symbol: &str) -> Result<f64, VenueError> {
            Ok(30000.0)
        }
        async fn submit_order(&self, req: OrderRequest) -> Result<String, VenueError> {
            if req.order_type == Some(OrderType::TakeProfitMarket) && self.tp_rejects_market {
                return Err(VenueError::VenueRejected { code: 30208, msg: "close to market".into() });
            }
            if req.order_type == Some(OrderType::StopMarket) && self.sl_rejects {
                return Err(VenueError::PositionModeMismatch);
            }
            Ok(format!("order-for-{}", req.client_token))
        }
        async fn cancel_order(&self, _symbol: &str, _id: &str) -> Result<(), VenueError> {
            Ok(())
        }
        async fn order_status(&self, _symbol: &str, _id: &str) -> Result<OrderStatus, VenueError> {
            unimplemented!()
        }
        async fn open_positions(&self) -> Result<Vec<OpenPosition>, VenueError> {
            Ok(vec![])
        }
        async fn closable_qty(&self, _symbol: &str, _side: PositionSide) -> Result<f64, VenueError> {
            Ok(0.0)
        }
        async fn open_orders(&self, _symbol: Option<&str>) -> Result<Vec<OpenOrder>, VenueError> {
            Ok(vec![])
        }
        async fn symbol_meta(&self, _symbol: &str) -> Result<SymbolMeta, VenueError> {
            unimplemented!()
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), VenueError> {
            Ok(())
        }
        async fn set_position_mode(&self, _hedge_mode: bool) -> Result<(), VenueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn two_phase_commit_places_tp_then_sl_in_order() {
        let venue = FakeVenue { tp_rejects_market: false, sl_rejects: false };
        let mut pos = sample_position(Side::Long);
        let outcome = ensure_exits(&venue, &mut pos, false, async { Ok(true) }).await;
        assert!(matches!(outcome, LayerAOutcome::TpAttached { kind: ExitOrderKind::TakeProfitMarket, .. }));
        assert!(pos.tp_order_id.is_some());
        assert!(pos.sl_order_id.is_none());

        let outcome2 = ensure_exits(&venue, &mut pos, false, async { Ok(true) }).await;
        assert!(matches!(outcome2, LayerAOutcome::SlAttached { .. }));
        assert!(pos.has_both_exits());
    }

    #[tokio::test]
    async fn aborts_sl_placement_when_position_closed_between_phases() {
        let venue = FakeVenue { tp_rejects_market: false, sl_rejects: false };
        let mut pos = sample_position(Side::Long);
        pos.tp_order_id = Some("tp-already".into());
        let outcome = ensure_exits(&venue, &mut pos, false, async { Ok(false) }).await;
        assert_eq!(outcome, LayerAOutcome::AbortedPositionChanged);
        assert!(pos.sl_order_id.is_none());
    }

    #[tokio::test]
    async fn tp_market_rejection_falls_back_to_limit() {
        let venue = FakeVenue { tp_rejects_market: true, sl_rejects: false };
        let mut pos = sample_position(Side::Long);
        let outcome = ensure_exits(&venue, &mut pos, false, async { Ok(true) }).await;
        match outcome {
            LayerAOutcome::TpAttached { kind, .. } => assert_eq!(kind, ExitOrderKind::TakeProfitLimit),
            other => panic!("expected TpAttached, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sl_rejection_engages_software_sl_mode() {
        let venue = FakeVenue { tp_rejects_market: false, sl_rejects: true };
        let mut pos = sample_position(Side::Long);
        pos.tp_order_id = Some("tp-already".into());
        let outcome = ensure_exits(&venue, &mut pos, false, async { Ok(true) }).await;
        assert_eq!(outcome, LayerAOutcome::SoftwareSlEngaged);
        assert!(pos.software_sl);
    }

    #[test]
    fn trailing_tp_monotonically_tightens_for_long() {
        let mut pos = sample_position(Side::Long);
        let (tp1, _) = trail_take_profit_with_rates(&pos, 1.0, 1.0, 1);
        pos.tp_price = tp1;
        let (tp2, _) = trail_take_profit_with_rates(&pos, 1.0, 1.0, 1);
        assert!(tp2 < tp1);
        assert!(tp1 < pos.initial_tp_price);
    }

    #[test]
    fn trailing_tp_clamps_at_entry_and_converts_order_type() {
        let mut pos = sample_position(Side::Long);
        pos.tp_price = pos.entry_price + 1.0; // almost at entry already
        let (new_tp, kind) = trail_take_profit_with_rates(&pos, 1.0, 1.0, 100);
        assert_eq!(new_tp, pos.entry_price);
        assert_eq!(kind, ExitOrderKind::StopMarketBreakeven);
    }

    #[test]
    fn breakeven_crossing_yields_nonnegative_pnl_at_fill() {
        let mut pos = sample_position(Side::Long);
        pos.tp_price = pos.entry_price; // clamped to breakeven
        let pnl = realized_pnl(&pos, pos.tp_price);
        assert!(pnl >= 0.0);
    }

    #[test]
    fn replacement_threshold_blocks_small_moves() {
        assert!(!should_replace_exit_order(31500.0, 31502.0, 0.5, 5.0, 0.05));
        assert!(should_replace_exit_order(31500.0, 31600.0, 0.5, 5.0, 0.05));
    }

    #[test]
    fn realized_pnl_uses_side_sign() {
        let pos_long = sample_position(Side::Long);
        assert!(realized_pnl(&pos_long, pos_long.tp_price) > 0.0);

        let mut pos_short = sample_position(Side::Short);
        pos_short.tp_price = pos_short.entry_price - 1500.0; // a short's TP sits below entry
        assert!(realized_pnl(&pos_short, pos_short.tp_price) > 0.0);
    }

    #[test]
    fn software_sl_triggers_only_when_engaged_and_crossed() {
        let mut pos = sample_position(Side::Long);
        assert!(!software_sl_triggered(&pos, 28000.0));
        pos.software_sl = true;
        assert!(software_sl_triggered(&pos, 28000.0));
        assert!(!software_sl_triggered(&pos, 30500.0));
    }

    #[test]
    fn is_emergency_fires_past_ttl_without_both_exits() {
        let pos = sample_position(Side::Long);
        assert!(!is_emergency(&pos, 10, 30));
        assert!(is_emergency(&pos, 31, 30));
    }
}
