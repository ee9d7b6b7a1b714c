//! Operator CLI: runs one Position Reconciler sweep.
//! `reconcile [--apply]` — without `--apply`, reports what would change
//! without mutating state.

use oc_trader::entry_confirmation::{self, ConfirmationOutcome};
use oc_trader::reconciler::{self, VenueOnlyResolution};
use oc_trader::repository::{EntryOrderRepository, FillTransaction, InMemoryStore, PositionRepository, StrategyRepository};
use oc_trader::tick_bus::TickBus;
use oc_trader::types::{BotId, EntryOrder, EntryOrderId, EntryOrderStatus, PositionId, Side};
use oc_trader::venue::bybit::BybitVenue;
use oc_trader::venue::{OpenPosition, OrderState, PositionSide, RateLimiterConfig, VenueAdapter};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let apply = std::env::args().any(|a| a == "--apply");

    let base_url = std::env::var("BYBIT_BASE_URL").unwrap_or_else(|_| "https://api-demo.bybit.com".into());
    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    let venue = BybitVenue::new(base_url, api_key, api_secret, RateLimiterConfig::default());
    let store = Arc::new(InMemoryStore::new());

    let venue_positions = match venue.open_positions().await {
        Ok(p) => p,
        Err(e) => {
            log::error!("failed to fetch venue positions: {e}");
            return ExitCode::from(1);
        }
    };
    let book_positions = PositionRepository::open_positions(store.as_ref());
    let (venue_only, book_only, both) = reconciler::classify(&venue_positions, &book_positions);

    if venue_only.is_empty() && book_only.is_empty() {
        log::info!("reconcile: book and venue already match ({} positions in both)", both.len());
        return ExitCode::from(2);
    }

    log::info!("reconcile: {} venue-only, {} book-only, {} matched", venue_only.len(), book_only.len(), both.len());

    if !apply {
        log::info!("dry run (pass --apply to mutate state)");
        return ExitCode::SUCCESS;
    }

    let next_position_id = AtomicU64::new(1);
    let next_entry_order_id = AtomicU64::new(1);

    let open_orders = EntryOrderRepository::open_orders(store.as_ref());
    let strategies = StrategyRepository::all_active(store.as_ref());
    let now = TickBus::now_ts();
    for vp in &venue_only {
        let resolution = reconciler::resolve_venue_only(vp, BotId(1), &open_orders, &strategies, now);
        match resolution {
            VenueOnlyResolution::MatchesOpenEntryOrder(order_id) => {
                if let Some(order) = EntryOrderRepository::get(store.as_ref(), order_id) {
                    let position_id = PositionId(next_position_id.fetch_add(1, Ordering::SeqCst));
                    confirm_entry_order(&venue, store.as_ref(), &order, position_id).await;
                } else {
                    log::warn!("{}: resolved order {order_id} no longer open", vp.symbol);
                }
            }
            VenueOnlyResolution::Synthesize { entry_price, synthetic_order_id } => {
                synthesize_venue_only_position(store.as_ref(), BotId(1), vp, entry_price, &synthetic_order_id, &strategies, &next_position_id, &next_entry_order_id).await;
            }
            VenueOnlyResolution::Unattributable => {
                log::warn!("{}: unattributable, no open order or active strategy matched", vp.symbol);
            }
        }
    }
    for bp in &book_only {
        let mark = venue.price(&bp.symbol).await.unwrap_or(bp.entry_price);
        let (close_price, pnl, reason) = reconciler::close_book_only(bp, mark);
        PositionRepository::close(store.as_ref(), bp.id, close_price, pnl, reason, now);
        log::info!("closed {} as {}", bp.symbol, reason.as_str());
    }

    ExitCode::SUCCESS
}

/// Polls venue order status for one open Entry Order and resolves it into a
/// Position, mirroring the main service's Entry Confirmation Monitor.
async fn confirm_entry_order<V: VenueAdapter>(venue: &V, store: &InMemoryStore, order: &EntryOrder, position_id: PositionId) {
    let Some(strategy) = StrategyRepository::get(store, order.strategy_id) else { return };
    let status = match venue.order_status(&order.symbol, &order.venue_order_id).await {
        Ok(s) => s,
        Err(e) => {
            log::warn!("order status poll failed for {}: {e}", order.venue_order_id);
            return;
        }
    };
    let outcome = entry_confirmation::resolve_update(order, &strategy, status.state, status.avg_fill_price, order.target_entry_price, position_id, TickBus::now_ts());
    match outcome {
        ConfirmationOutcome::Filled(position) => {
            log::info!("{}: venue-only order matched, position {} opened", position.symbol, position.id);
            FillTransaction::confirm_fill(store, order.id, position);
        }
        ConfirmationOutcome::TerminalFailureNoFill => {
            EntryOrderRepository::set_status(store, order.id, EntryOrderStatus::Canceled);
        }
        ConfirmationOutcome::Ignored => {
            log::info!("{}: order {} still not filled, left open", order.symbol, order.venue_order_id);
        }
    }
}

/// Builds and commits a synthetic Position for a venue-only exposure with no
/// matching Entry Order but an active Strategy.
async fn synthesize_venue_only_position(
    store: &InMemoryStore,
    bot_id: BotId,
    venue_position: &OpenPosition,
    entry_price: f64,
    synthetic_order_id: &str,
    strategies: &[oc_trader::types::Strategy],
    next_position_id: &AtomicU64,
    next_entry_order_id: &AtomicU64,
) {
    let side = match venue_position.side {
        PositionSide::Long => Side::Long,
        PositionSide::Short => Side::Short,
    };
    let Some(strategy) = strategies.iter().find(|s| s.bot_id == bot_id && s.symbol == venue_position.symbol && s.side_policy.allows(side)) else {
        log::warn!("{}: lost matching strategy while synthesizing", venue_position.symbol);
        return;
    };

    let now = TickBus::now_ts();
    let order = EntryOrder {
        id: EntryOrderId(next_entry_order_id.fetch_add(1, Ordering::SeqCst)),
        strategy_id: strategy.id,
        bot_id,
        venue_order_id: synthetic_order_id.to_string(),
        symbol: venue_position.symbol.clone(),
        side,
        notional_amount: venue_position.qty * entry_price,
        target_entry_price: entry_price,
        status: EntryOrderStatus::Open,
        reservation_token: None,
        created_at: now,
    };
    EntryOrderRepository::insert(store, order.clone());

    let position_id = PositionId(next_position_id.fetch_add(1, Ordering::SeqCst));
    let outcome = entry_confirmation::resolve_update(&order, strategy, OrderState::Filled, entry_price, entry_price, position_id, now);
    let ConfirmationOutcome::Filled(mut position) = outcome else {
        unreachable!("OrderState::Filled always resolves to ConfirmationOutcome::Filled");
    };
    position.position_size = venue_position.qty;
    log::info!("{}: synthesized position {} from venue-only exposure with no matching order", position.symbol, position.id);
    FillTransaction::confirm_fill(store, order.id, position);
}
