#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced, dirty pages scheduled for release");
}

use oc_trader::config::ConfigStore;
use oc_trader::entry_confirmation::{self, ConfirmationOutcome};
use oc_trader::notifier::{Notifier, NullNotifier, TelegramNotifier};
use oc_trader::order_service::{KeyedLocks, OrderService, SubmitOutcome};
use oc_trader::position_monitor;
use oc_trader::queue::PriorityQueue;
use oc_trader::reconciler::{self, VenueOnlyResolution};
use oc_trader::repository::{
    BotRepository, EntryOrderRepository, FillTransaction, InMemoryStore, PositionRepository,
    StrategyRepository,
};
use oc_trader::signal_scanner::{self, OpenBookView};
use oc_trader::tick_bus::TickBus;
use oc_trader::timer;
use oc_trader::types::{
    Bot, BotId, CloseReason, EntryOrder, EntryOrderId, EntryOrderStatus, PositionId, Side,
    SidePolicy, Strategy, StrategyId, StrategyMode,
};
use oc_trader::venue::bybit::BybitVenue;
use oc_trader::venue::bybit_ws;
use oc_trader::venue::{AccountStreamEvent, OpenPosition, OrderState, PositionSide, RateLimiterConfig, VenueAdapter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct OpenBook {
    store: Arc<InMemoryStore>,
}

impl OpenBookView for OpenBook {
    fn has_open_exposure(&self, bot_id: BotId, symbol: &str, side: Side) -> bool {
        if PositionRepository::has_open_exposure(self.store.as_ref(), bot_id, symbol, side) {
            return true;
        }
        // A counter-trend LIMIT order may still be sitting open on the
        // venue with no Position yet: count that as exposure too, or a
        // second signal before the first fill would dedup past it.
        EntryOrderRepository::open_orders(self.store.as_ref())
            .iter()
            .any(|o| o.bot_id == bot_id && o.symbol == symbol && o.side == side)
    }
}

fn default_bot() -> Bot {
    Bot {
        id: BotId(1),
        name: "default".into(),
        venue: "bybit".into(),
        api_key: std::env::var("BYBIT_API_KEY").unwrap_or_default(),
        api_secret: std::env::var("BYBIT_API_SECRET").unwrap_or_default(),
        proxy: None,
        max_concurrent_trades: 2,
        notification_channel: None,
        active: true,
        symbol_filter: None,
    }
}

fn default_strategy() -> Strategy {
    Strategy {
        id: StrategyId(1),
        bot_id: BotId(1),
        symbol: std::env::var("OC_SYMBOL").unwrap_or_else(|_| "BTCUSDT".into()),
        interval: "1m".into(),
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

/// Parses the restricted `*/N * * * * *` seconds-step shape of
/// `entry_order_monitor_cron`; anything else falls back to `default`. No
/// general cron grammar is supported — the crate carries no cron crate, and
/// this covers the only documented form of the key.
fn cron_step_interval(expr: &str, default: Duration) -> Duration {
    expr.split_whitespace()
        .next()
        .and_then(|field| field.strip_prefix("*/"))
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ConfigStore::with_defaults();
    let store = Arc::new(InMemoryStore::new());
    store.seed_bot(default_bot());
    store.seed_strategy(default_strategy());

    let base_url = std::env::var("BYBIT_BASE_URL").unwrap_or_else(|_| "https://api-demo.bybit.com".into());
    let bot = BotRepository::all_active(store.as_ref()).into_iter().next().expect("seeded bot");
    let rate_limiter_config = RateLimiterConfig::from_snapshot(&config.snapshot());
    let venue = Arc::new(BybitVenue::new(base_url, bot.api_key.clone(), bot.api_secret.clone(), rate_limiter_config));

    let notifier: Arc<dyn Notifier> = match (std::env::var("TELEGRAM_TOKEN"), std::env::var("TELEGRAM_CHAT_ID")) {
        (Ok(token), Ok(chat_id)) => Arc::new(TelegramNotifier::new(&token, &chat_id)),
        _ => {
            log::info!("no telegram credentials set, notifications are local-log only");
            Arc::new(NullNotifier)
        }
    };

    let tick_bus = TickBus::new();
    let locks = Arc::new(KeyedLocks::new());
    let next_entry_order_id = Arc::new(AtomicU64::new(1));
    let order_service = Arc::new(OrderService::new(venue.clone(), locks.clone(), next_entry_order_id.clone(), 3));
    let next_position_id = Arc::new(AtomicU64::new(1));

    // Reconcile against the venue once at startup before accepting new
    // signals.
    run_reconciliation_cycle(venue.as_ref(), &store, &notifier, &config, &next_position_id, &next_entry_order_id).await;

    // Candle-close handler: Signal Scanner -> Order Service.
    {
        let store = store.clone();
        let order_service = order_service.clone();
        tick_bus.on_candle_closed(Arc::new(move |symbol, candle| {
            let store = store.clone();
            let order_service = order_service.clone();
            let symbol = symbol.to_string();
            tokio::spawn(async move {
                let strategies: Vec<Strategy> = StrategyRepository::all_active(store.as_ref())
                    .into_iter()
                    .filter(|s| s.symbol == symbol)
                    .collect();
                if strategies.is_empty() {
                    return;
                }
                let book = OpenBook { store: store.clone() };
                let refs: Vec<&Strategy> = strategies.iter().collect();
                let current_price = candle.close;
                let intents = signal_scanner::scan_candle(refs, candle.open, candle.close, current_price, &book);
                for intent in intents {
                    match order_service.submit(intent.clone(), 10, TickBus::now_ts()).await {
                        SubmitOutcome::Submitted(order) => {
                            log::info!("entry order submitted: {} {:?} {}", order.symbol, order.side, order.venue_order_id);
                            EntryOrderRepository::insert(store.as_ref(), order);
                        }
                        SubmitOutcome::RejectedNoRetry(reason) => {
                            log::warn!("entry intent dropped for {}: {reason}", intent.symbol);
                        }
                        SubmitOutcome::Abandoned(err) => {
                            log::error!("entry intent abandoned for {}: {err}", intent.symbol);
                        }
                    }
                }
            });
        }));
    }

    // Public trade WebSocket feeding the tick bus, reconnecting with
    // backoff. Falls back to REST price polling whenever the socket is
    // down, so candles keep closing even mid-reconnect.
    {
        let tick_bus = tick_bus.clone();
        let store = store.clone();
        let ws_url = std::env::var("BYBIT_PUBLIC_WS_URL").unwrap_or_else(|_| "wss://stream.bybit.com/v5/public/linear".into());
        tokio::spawn(async move {
            loop {
                let symbols: Vec<String> = StrategyRepository::all_active(store.as_ref()).into_iter().map(|s| s.symbol).collect();
                if symbols.is_empty() {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                let tick_bus = tick_bus.clone();
                let ws_url = ws_url.clone();
                let result = bybit_ws::reconnect_with_backoff(
                    move || {
                        let ws_url = ws_url.clone();
                        let symbols = symbols.clone();
                        let tick_bus = tick_bus.clone();
                        async move { bybit_ws::connect_public_ticks(&ws_url, &symbols, tick_bus).await }
                    },
                    u32::MAX,
                    1,
                )
                .await;
                if let Err(e) = result {
                    log::error!("public tick stream gave up: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        });
    }

    // REST price-poll fallback, covering symbols newly added while the
    // socket above is still (re)connecting.
    {
        let tick_bus = tick_bus.clone();
        let venue = venue.clone();
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                let symbols: Vec<String> = StrategyRepository::all_active(store.as_ref()).into_iter().map(|s| s.symbol).collect();
                for symbol in symbols {
                    match venue.price(&symbol).await {
                        Ok(price) => tick_bus.publish_tick(&symbol, price, TickBus::now_ts()),
                        Err(e) => log::debug!("price poll failed for {symbol}: {e}"),
                    }
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
    }

    // Private account WebSocket: live-mode-only fill/position push that
    // resolves entries faster than the REST poll below (teacher's
    // `websocket_private::BybitPrivateWs`). Skipped when no credentials are
    // configured (demo accounts authenticate via REST only).
    if !bot.api_key.is_empty() && !bot.api_secret.is_empty() {
        let store = store.clone();
        let notifier = notifier.clone();
        let next_position_id = next_position_id.clone();
        let api_key = bot.api_key.clone();
        let api_secret = bot.api_secret.clone();
        let ws_url = std::env::var("BYBIT_PRIVATE_WS_URL").unwrap_or_else(|_| "wss://stream.bybit.com/v5/private".into());
        tokio::spawn(async move {
            loop {
                let (tx, mut rx) = tokio::sync::mpsc::channel::<AccountStreamEvent>(64);
                let store2 = store.clone();
                let notifier2 = notifier.clone();
                let next_position_id2 = next_position_id.clone();
                let drain = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        apply_account_stream_event(event, &store2, &notifier2, &next_position_id2).await;
                    }
                });
                let ws_url = ws_url.clone();
                let api_key = api_key.clone();
                let api_secret = api_secret.clone();
                let result = bybit_ws::reconnect_with_backoff(
                    move || {
                        let ws_url = ws_url.clone();
                        let api_key = api_key.clone();
                        let api_secret = api_secret.clone();
                        let tx = tx.clone();
                        async move { bybit_ws::connect_account_stream(&ws_url, &api_key, &api_secret, tx).await }
                    },
                    u32::MAX,
                    1,
                )
                .await;
                drain.abort();
                if let Err(e) = result {
                    log::error!("account stream gave up: {e}");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    // Entry Confirmation REST poll fallback, on the cron-documented cadence.
    {
        let store = store.clone();
        let venue = venue.clone();
        let notifier = notifier.clone();
        let next_position_id = next_position_id.clone();
        let default_period = Duration::from_secs(30);
        let period = config
            .snapshot()
            .get_str("entry_order_monitor_cron")
            .map(|cron| cron_step_interval(cron, default_period))
            .unwrap_or(default_period);
        timer::every(period, move || {
            let store = store.clone();
            let venue = venue.clone();
            let notifier = notifier.clone();
            let next_position_id = next_position_id.clone();
            async move { run_entry_confirmation_poll(venue.as_ref(), &store, &notifier, &next_position_id).await }
        });
    }

    // Position Monitor control loop: scans and enqueues onto two bounded
    // priority queues (Layer A exit-attachment, Layer B trailing/fill
    // detection) so the cycle itself never blocks on a venue round-trip.
    let tp_sl_queue = Arc::new(PriorityQueue::spawn(4, {
        let venue = venue.clone();
        let store = store.clone();
        let notifier = notifier.clone();
        let config = config.clone();
        move |position_id: PositionId| {
            let venue = venue.clone();
            let store = store.clone();
            let notifier = notifier.clone();
            let config = config.clone();
            async move { process_layer_a(&*venue, &store, &notifier, &config, position_id).await }
        }
    }));
    let monitor_queue = Arc::new(PriorityQueue::spawn(3, {
        let venue = venue.clone();
        let store = store.clone();
        let notifier = notifier.clone();
        let config = config.clone();
        move |position_id: PositionId| {
            let venue = venue.clone();
            let store = store.clone();
            let notifier = notifier.clone();
            let config = config.clone();
            async move { process_layer_b(&*venue, &store, &notifier, &config, position_id).await }
        }
    }));
    {
        let store = store.clone();
        let config = config.clone();
        let tp_sl_queue = tp_sl_queue.clone();
        let monitor_queue = monitor_queue.clone();
        let period = config.snapshot().duration_ms("position_monitor_interval_ms").max(Duration::from_millis(500));
        timer::every(period, move || {
            let store = store.clone();
            let config = config.clone();
            let tp_sl_queue = tp_sl_queue.clone();
            let monitor_queue = monitor_queue.clone();
            async move {
                scan_position_monitor_cycle(&store, &config, &tp_sl_queue, &monitor_queue);
            }
        });
    }

    // Position Reconciler.
    {
        let store = store.clone();
        let venue = venue.clone();
        let notifier = notifier.clone();
        let config = config.clone();
        let next_position_id = next_position_id.clone();
        let next_entry_order_id = next_entry_order_id.clone();
        let minutes = config.snapshot().get_i64("position_sync_interval_minutes").unwrap_or(5).max(1);
        let period = Duration::from_secs(minutes as u64 * 60);
        timer::every(period, move || {
            let store = store.clone();
            let venue = venue.clone();
            let notifier = notifier.clone();
            let config = config.clone();
            let next_position_id = next_position_id.clone();
            let next_entry_order_id = next_entry_order_id.clone();
            async move { run_reconciliation_cycle(venue.as_ref(), &store, &notifier, &config, &next_position_id, &next_entry_order_id).await }
        });
    }

    log::info!("oc_trader started");
    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received, draining in-flight work");
    tokio::time::sleep(config.snapshot().duration_ms("shutdown_drain_timeout_secs")).await;
    Ok(())
}

/// Applies one pushed account-stream event to the book, sharing the Entry
/// Confirmation Monitor's decision logic with the REST poll.
async fn apply_account_stream_event(
    event: AccountStreamEvent,
    store: &InMemoryStore,
    notifier: &Arc<dyn Notifier>,
    next_position_id: &AtomicU64,
) {
    let AccountStreamEvent::OrderUpdate { state, avg_fill_price, .. } = &event else {
        return;
    };
    let (state, avg_fill_price) = (*state, *avg_fill_price);
    let open_orders = EntryOrderRepository::open_orders(store);
    let Some(order) = entry_confirmation::match_event(&event, &open_orders) else { return };
    let Some(strategy) = StrategyRepository::get(store, order.strategy_id) else { return };
    let position_id = PositionId(next_position_id.fetch_add(1, Ordering::SeqCst));
    let outcome = entry_confirmation::resolve_update(
        order,
        &strategy,
        state,
        avg_fill_price,
        order.target_entry_price,
        position_id,
        TickBus::now_ts(),
    );
    apply_confirmation_outcome(store, notifier, order.id, outcome).await;
}

/// Commits the result of `entry_confirmation::resolve_update`: filled
/// orders become Positions via the fill transaction, terminal non-fills
/// close out the Entry Order, partial/unresolved updates are no-ops.
async fn apply_confirmation_outcome(
    store: &InMemoryStore,
    notifier: &Arc<dyn Notifier>,
    order_id: EntryOrderId,
    outcome: ConfirmationOutcome,
) {
    match outcome {
        ConfirmationOutcome::Filled(position) => {
            notifier
                .entry_filled(&position.symbol, position.side, position.position_size, position.entry_price, position.tp_price, position.sl_price)
                .await;
            FillTransaction::confirm_fill(store, order_id, position);
        }
        ConfirmationOutcome::TerminalFailureNoFill => {
            EntryOrderRepository::set_status(store, order_id, EntryOrderStatus::Canceled);
        }
        ConfirmationOutcome::Ignored => {}
    }
}

/// Polls venue order status for one open Entry Order and resolves it,
/// shared by the REST poll loop and the reconciler's `MatchesOpenEntryOrder`
/// resolution.
async fn confirm_entry_order<V: VenueAdapter>(
    venue: &V,
    store: &InMemoryStore,
    notifier: &Arc<dyn Notifier>,
    order: &EntryOrder,
    position_id: PositionId,
) {
    let Some(strategy) = StrategyRepository::get(store, order.strategy_id) else { return };
    let status = match venue.order_status(&order.symbol, &order.venue_order_id).await {
        Ok(s) => s,
        Err(e) => {
            log::debug!("order status poll failed for {}: {e}", order.venue_order_id);
            return;
        }
    };
    let outcome = entry_confirmation::resolve_update(
        order,
        &strategy,
        status.state,
        status.avg_fill_price,
        order.target_entry_price,
        position_id,
        TickBus::now_ts(),
    );
    apply_confirmation_outcome(store, notifier, order.id, outcome).await;
}

async fn run_entry_confirmation_poll<V: VenueAdapter>(
    venue: &V,
    store: &InMemoryStore,
    notifier: &Arc<dyn Notifier>,
    next_position_id: &AtomicU64,
) {
    for order in EntryOrderRepository::open_orders(store) {
        let position_id = PositionId(next_position_id.fetch_add(1, Ordering::SeqCst));
        confirm_entry_order(venue, store, notifier, &order, position_id).await;
    }
}

/// Builds and commits a synthetic Position for a venue-only exposure with
/// no matching Entry Order but an active Strategy: mints a synthetic Entry
/// Order first (the fill transaction requires one), then runs it through
/// the same `resolve_update` path as a real fill.
async fn synthesize_venue_only_position(
    store: &InMemoryStore,
    notifier: &Arc<dyn Notifier>,
    bot_id: BotId,
    venue_position: &OpenPosition,
    entry_price: f64,
    synthetic_order_id: &str,
    strategies: &[Strategy],
    next_position_id: &AtomicU64,
    next_entry_order_id: &AtomicU64,
) {
    let side = match venue_position.side {
        PositionSide::Long => Side::Long,
        PositionSide::Short => Side::Short,
    };
    let Some(strategy) = strategies.iter().find(|s| s.bot_id == bot_id && s.symbol == venue_position.symbol && s.side_policy.allows(side)) else {
        log::warn!("reconciler: lost matching strategy while synthesizing {}", venue_position.symbol);
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
    // The venue's reported qty is authoritative, not the notional/entry
    // round trip used to mint the synthetic order.
    position.position_size = venue_position.qty;
    notifier.reconciler_anomaly(&format!("{} synthesized from venue-only exposure with no matching order", position.symbol)).await;
    FillTransaction::confirm_fill(store, order.id, position);
}

/// Scans open Positions and enqueues each onto the appropriate priority
/// queue; does no venue I/O itself, so a cycle always returns promptly.
fn scan_position_monitor_cycle(
    store: &InMemoryStore,
    config: &ConfigStore,
    tp_sl_queue: &PriorityQueue<PositionId>,
    monitor_queue: &PriorityQueue<PositionId>,
) {
    let emergency_ttl = config.snapshot().get_i64("emergency_ttl_secs").unwrap_or(30);
    let now = TickBus::now_ts();
    for position in PositionRepository::open_positions(store) {
        let age_secs = (now - position.opened_at).max(0);
        if !position.has_both_exits() {
            let emergency = position_monitor::is_emergency(&position, now, emergency_ttl);
            tp_sl_queue.push(position.id, emergency, age_secs);
        } else {
            monitor_queue.push(position.id, false, age_secs);
        }
    }
}

/// Layer A worker: re-fetches the Position fresh (it may have changed since
/// it was enqueued) and attaches whichever exits are still missing.
async fn process_layer_a<V: VenueAdapter>(venue: &V, store: &InMemoryStore, notifier: &Arc<dyn Notifier>, config: &ConfigStore, position_id: PositionId) {
    let Some(mut position) = PositionRepository::get(store, position_id) else { return };
    if !position.is_open() || position.has_both_exits() {
        return;
    }
    let snapshot = config.snapshot();
    let emergency_ttl = snapshot.get_i64("emergency_ttl_secs").unwrap_or(30);
    let hedge_mode = snapshot.get_str("default_position_mode").map(|m| m == "hedge").unwrap_or(false);
    let now = TickBus::now_ts();

    let symbol = position.symbol.clone();
    let side = match position.side {
        Side::Long => PositionSide::Long,
        Side::Short => PositionSide::Short,
    };
    let still_open_check = async move { venue.closable_qty(&symbol, side).await.map(|qty| qty > 0.0) };
    let outcome = position_monitor::ensure_exits(venue, &mut position, hedge_mode, still_open_check).await;
    log::debug!("layer A outcome for position {}: {outcome:?}", position.id);
    PositionRepository::update(store, position.clone());
    if position_monitor::is_emergency(&position, now, emergency_ttl) {
        notifier.risk_alert(&format!("position {} still missing exits past emergency TTL", position.id)).await;
    }
}

/// Layer B worker: fill detection (software SL) and TP trailing. The
/// trailing target's DB field is persisted every cycle it advances; only
/// the venue-side cancel/replace is gated by the replacement threshold.
async fn process_layer_b<V: VenueAdapter>(venue: &V, store: &InMemoryStore, notifier: &Arc<dyn Notifier>, config: &ConfigStore, position_id: PositionId) {
    let Some(mut position) = PositionRepository::get(store, position_id) else { return };
    if !position.is_open() || !position.has_both_exits() {
        return;
    }
    let now = TickBus::now_ts();

    let mark = venue.price(&position.symbol).await.unwrap_or(position.entry_price);
    if position_monitor::software_sl_triggered(&position, mark) {
        let pnl = position_monitor::realized_pnl(&position, mark);
        PositionRepository::close(store, position.id, mark, pnl, CloseReason::SlHit, now);
        notifier.position_closed(&position.symbol, position.side, position.entry_price, mark, pnl, CloseReason::SlHit).await;
        return;
    }

    let Some(strategy) = StrategyRepository::get(store, position.strategy_id) else { return };
    if position.opened_at <= 0 {
        return;
    }
    let minutes_elapsed = ((now - position.opened_at) / 60).max(0) as u64;
    if minutes_elapsed <= position.minutes_elapsed {
        return;
    }

    let delta = minutes_elapsed - position.minutes_elapsed;
    let (new_tp, kind) = position_monitor::trail_take_profit_with_rates(&position, strategy.trail_reduce_pct, strategy.trail_up_reduce_pct, delta);
    position.minutes_elapsed = minutes_elapsed;
    let prev_tp = position.tp_price;
    position.tp_price = new_tp;
    position.tp_order_kind = kind;

    let snapshot = config.snapshot();
    if snapshot.get_bool("adv_tpsl_trailing_enabled").unwrap_or(true) {
        let tick_size = venue.symbol_meta(&position.symbol).await.map(|m| m.tick_size).unwrap_or(0.01);
        let min_tick_count = snapshot.get_i64("tp_update_threshold_ticks").unwrap_or(5) as f64;
        let min_price_change_pct = snapshot.get_f64("exit_order_min_price_change_pct").unwrap_or(0.05);
        if position_monitor::should_replace_exit_order(prev_tp, new_tp, tick_size, min_tick_count, min_price_change_pct) {
            let hedge_mode = snapshot.get_str("default_position_mode").map(|m| m == "hedge").unwrap_or(false);
            if let Some(old_id) = position.tp_order_id.take() {
                if let Err(e) = venue.cancel_order(&position.symbol, &old_id).await {
                    log::warn!("failed to cancel stale tp order {old_id} for {}: {e}", position.symbol);
                }
            }
            match position_monitor::attach_take_profit(venue, &position, hedge_mode).await {
                Ok((id, k)) => {
                    position.tp_order_id = Some(id);
                    position.tp_order_kind = k;
                }
                Err(e) => log::warn!("failed to replace tp order for position {}: {e}", position.id),
            }
        }
    }
    PositionRepository::update(store, position);
}

async fn run_reconciliation_cycle<V: VenueAdapter>(
    venue: &V,
    store: &InMemoryStore,
    notifier: &Arc<dyn Notifier>,
    config: &ConfigStore,
    next_position_id: &AtomicU64,
    next_entry_order_id: &AtomicU64,
) {
    let venue_positions = match venue.open_positions().await {
        Ok(p) => p,
        Err(e) => {
            log::warn!("reconciler: open_positions failed: {e}");
            return;
        }
    };
    let book_positions = PositionRepository::open_positions(store);
    let (venue_only, book_only, both) = reconciler::classify(&venue_positions, &book_positions);

    for position in book_only {
        let mark = venue.price(&position.symbol).await.unwrap_or(position.entry_price);
        let (close_price, pnl, reason) = reconciler::close_book_only(&position, mark);
        PositionRepository::close(store, position.id, close_price, pnl, reason, TickBus::now_ts());
        notifier.reconciler_anomaly(&format!("{} closed: not found on venue", position.symbol)).await;
    }

    let bot_id = BotId(1);
    let open_entry_orders = EntryOrderRepository::open_orders(store);
    let strategies = StrategyRepository::all_active(store);
    for vp in &venue_only {
        let resolution = reconciler::resolve_venue_only(vp, bot_id, &open_entry_orders, &strategies, TickBus::now_ts());
        match resolution {
            VenueOnlyResolution::MatchesOpenEntryOrder(order_id) => {
                if let Some(order) = EntryOrderRepository::get(store, order_id) {
                    let position_id = PositionId(next_position_id.fetch_add(1, Ordering::SeqCst));
                    confirm_entry_order(venue, store, notifier, &order, position_id).await;
                }
            }
            VenueOnlyResolution::Synthesize { entry_price, synthetic_order_id } => {
                synthesize_venue_only_position(
                    store,
                    notifier,
                    bot_id,
                    vp,
                    entry_price,
                    &synthetic_order_id,
                    &strategies,
                    next_position_id,
                    next_entry_order_id,
                )
                .await;
            }
            VenueOnlyResolution::Unattributable => {
                log::warn!("reconciler: venue-only {} unattributable, no open order or active strategy", vp.symbol);
            }
        }
    }

    let open_orders = match venue.open_orders(None).await {
        Ok(orders) => orders,
        Err(e) => {
            log::warn!("reconciler: open_orders failed: {e}");
            Vec::new()
        }
    };

    let drift_tolerance_pct = config.snapshot().get_f64("position_drift_tolerance_pct").unwrap_or(5.0);
    let (live_tp_ids, live_sl_ids) = reconciler::live_exit_id_sets(&open_orders);
    for (vp, mut bp) in both {
        let mut changed = false;
        if reconciler::drift_exceeds_tolerance(vp.qty, bp.position_size, drift_tolerance_pct) {
            notifier
                .reconciler_anomaly(&format!("{} size drift: venue={:.6} book={:.6}, correcting book to venue", bp.symbol, vp.qty, bp.position_size))
                .await;
            bp.position_size = vp.qty;
            changed = true;
        }
        if reconciler::clear_stale_exit_if_missing(&mut bp, &live_tp_ids, &live_sl_ids) {
            changed = true;
        }
        if changed {
            PositionRepository::update(store, bp);
        }
    }

    if !open_orders.is_empty() {
        let orphans = reconciler::find_orphan_orders(&open_orders, &book_positions);
        for order in orphans {
            if let Err(e) = venue.cancel_order(&order.symbol, &order.venue_order_id).await {
                log::warn!("reconciler: failed to cancel orphan order {}: {e}", order.venue_order_id);
            }
        }
    }
}
