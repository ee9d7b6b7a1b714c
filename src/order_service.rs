//! Converts Entry Intents into venue orders: a keyed, venue-neutral service
//! with explicit sizing, tick rounding, and failure policy.

use crate::errors::VenueError;
use crate::types::{EntryOrder, EntryOrderId, EntryOrderStatus, EntryIntent, Side};
use crate::venue::{round_to_step, round_to_tick, OrderRequest, OrderSide, OrderType, PositionSide, VenueAdapter};
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// One mutex per (bot, symbol, side), so unrelated keys never block each
/// other while an order for one key is in flight.
#[derive(Default)]
pub struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<(u64, String, bool), Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        KeyedLocks::default()
    }

    fn key_for(bot_id: u64, symbol: &str, side: Side) -> (u64, String, bool) {
        (bot_id, symbol.to_string(), side == Side::Long)
    }

    pub fn get(&self, bot_id: u64, symbol: &str, side: Side) -> Arc<AsyncMutex<()>> {
        let key = Self::key_for(bot_id, symbol, side);
        self.locks.lock().unwrap().entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Entry order row created; order still open on the venue (counter-trend
    /// LIMIT path resolved later by the Entry Confirmation Monitor).
    Submitted(EntryOrder),
    /// Intent dropped before reaching the venue (size below minimum, etc.);
    /// never retried.
    RejectedNoRetry(String),
    /// Retries exhausted; abandoned with the last error logged by the caller.
    Abandoned(VenueError),
}

impl PartialEq for SubmitOutcome {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SubmitOutcome::Submitted(a), SubmitOutcome::Submitted(b)) => a.id == b.id,
            (SubmitOutcome::RejectedNoRetry(a), SubmitOutcome::RejectedNoRetry(b)) => a == b,
            (SubmitOutcome::Abandoned(_), SubmitOutcome::Abandoned(_)) => true,
            _ => false,
        }
    }
}

fn side_to_order_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Buy,
        Side::Short => OrderSide::Sell,
    }
}

fn side_to_position_side(side: Side) -> PositionSide {
    match side {
        Side::Long => PositionSide::Long,
        Side::Short => PositionSide::Short,
    }
}

/// Computes the step-rounded order quantity from a notional amount, and
/// validates it against `min_notional`.
pub fn compute_qty(amount: f64, entry_price: f64, step_size: f64, min_notional: f64) -> Result<f64, VenueError> {
    let qty = round_to_step(amount / entry_price, step_size);
    if qty <= 0.0 || qty * entry_price < min_notional {
        return Err(VenueError::InvalidSize);
    }
    Ok(qty)
}

pub struct OrderService<V: VenueAdapter> {
    venue: Arc<V>,
    locks: Arc<KeyedLocks>,
    next_id: Arc<AtomicU64>,
    leverage_cache: std::sync::Mutex<HashMap<String, u32>>,
    position_mode_set: std::sync::Mutex<bool>,
    max_retries: u32,
}

impl<V: VenueAdapter> OrderService<V> {
    /// `next_id` is shared with every other minter of `EntryOrderId`s (e.g.
    /// the Position Reconciler's venue-only synthesis path) so ids never
    /// collide across call sites.
    pub fn new(venue: Arc<V>, locks: Arc<KeyedLocks>, next_id: Arc<AtomicU64>, max_retries: u32) -> Self {
        OrderService {
            venue,
            locks,
            next_id,
            leverage_cache: std::sync::Mutex::new(HashMap::new()),
            position_mode_set: std::sync::Mutex::new(false),
            max_retries,
        }
    }

    fn fresh_entry_order_id(&self) -> EntryOrderId {
        EntryOrderId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }

    async fn ensure_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        {
            let cache = self.leverage_cache.lock().unwrap();
            if cache.get(symbol) == Some(&leverage) {
                return Ok(());
            }
        }
        self.venue.set_leverage(symbol, leverage).await?;
        self.leverage_cache.lock().unwrap().insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn ensure_position_mode(&self, hedge_mode: bool) -> Result<(), VenueError> {
        {
            let set = self.position_mode_set.lock().unwrap();
            if *set {
                return Ok(());
            }
        }
        self.venue.set_position_mode(hedge_mode).await?;
        *self.position_mode_set.lock().unwrap() = true;
        Ok(())
    }

    fn client_token(&self, intent: &EntryIntent, attempt: u32) -> String {
        format!("oc-{}-{}-{}-{}-{}", intent.bot_id, intent.strategy_id, intent.symbol, intent.side.sign() as i64, attempt)
    }

    /// Runs the full submission pipeline for one Entry Intent, serialized on
    /// this intent's (bot, symbol, side) key.
    pub async fn submit(&self, intent: EntryIntent, leverage: u32, now: i64) -> SubmitOutcome {
        let lock = self.locks.get(intent.bot_id.0, &intent.symbol, intent.side);
        let _guard = lock.lock().await;

        let meta = match self.venue.symbol_meta(&intent.symbol).await {
            Ok(m) => m,
            Err(e) => return SubmitOutcome::Abandoned(e),
        };

        let entry_price = round_to_tick(intent.entry_price, meta.tick_size);
        let qty = match compute_qty(intent.notional_amount, entry_price, meta.step_size, meta.min_notional) {
            Ok(q) => q,
            Err(_) => return SubmitOutcome::RejectedNoRetry("qty below venue minimum notional".into()),
        };

        if let Err(e) = self.ensure_leverage(&intent.symbol, leverage).await {
            return SubmitOutcome::Abandoned(e);
        }
        if let Err(e) = self.ensure_position_mode(meta.hedge_mode).await {
            return SubmitOutcome::Abandoned(e);
        }

        let mut order_type = if intent.is_market { OrderType::Market } else { OrderType::Limit };
        let mut price = if intent.is_market { None } else { Some(entry_price) };
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            let mut req = OrderRequest::new(intent.symbol.clone(), self.client_token(&intent, attempt));
            req.side = Some(side_to_order_side(intent.side));
            req.order_type = Some(order_type);
            req.qty = qty;
            req.price = price;
            req.position_side = if meta.hedge_mode { Some(side_to_position_side(intent.side)) } else { None };

            match self.venue.submit_order(req).await {
                Ok(venue_order_id) => {
                    return SubmitOutcome::Submitted(EntryOrder {
                        id: self.fresh_entry_order_id(),
                        strategy_id: intent.strategy_id,
                        bot_id: intent.bot_id,
                        venue_order_id,
                        symbol: intent.symbol.clone(),
                        side: intent.side,
                        notional_amount: intent.notional_amount,
                        target_entry_price: entry_price,
                        status: EntryOrderStatus::Open,
                        reservation_token: Some(self.client_token(&intent, attempt)),
                        created_at: now,
                    });
                }
                Err(VenueError::InvalidSize) | Err(VenueError::InvalidPrice) => {
                    return SubmitOutcome::RejectedNoRetry("venue rejected size or price".into());
                }
                Err(e) if e.is_price_too_close_to_market() => {
                    if intent.is_market {
                        return SubmitOutcome::RejectedNoRetry("already market, cannot convert further".into());
                    }
                    order_type = OrderType::Market;
                    price = None;
                    last_err = Some(e);
                }
                Err(e) if e.is_transient() => {
                    last_err = Some(e);
                    let backoff = std::time::Duration::from_millis(200 * 2u64.pow(attempt.min(6)));
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return SubmitOutcome::Abandoned(e),
            }
        }

        SubmitOutcome::Abandoned(last_err.unwrap_or(VenueError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BotId, StrategyId};
    use crate::venue::{OpenOrder, OpenPosition, OrderStatus, SymbolMeta};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeVenue {
        meta: SymbolMeta,
        reject_limit_close_to_market: AtomicU32,
        submitted: std::sync::Mutex<Vec<OrderRequest>>,
    }

    #[async_trait]
    impl VenueAdapter for FakeVenue {
        async fn price(&self, _symbol: &str) -> Result<f64, VenueError> {
            Ok(30000.0)
        }

        async fn submit_order(&self, req: OrderRequest) -> Result<String, VenueError> {
            if req.order_type == Some(OrderType::Limit) && self.reject_limit_close_to_market.load(Ordering::SeqCst) > 0 {
                self.reject_limit_close_to_market.fetch_sub(1, Ordering::SeqCst);
                return Err(VenueError::VenueRejected { code: 30208, msg: "too close to market".into() });
            }
            self.submitted.lock().unwrap().push(req);
            Ok("venue-order-1".into())
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
            Ok(self.meta.clone())
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), VenueError> {
            Ok(())
        }

        async fn set_position_mode(&self, _hedge_mode: bool) -> Result<(), VenueError> {
            Ok(())
        }
    }

    fn sample_meta() -> SymbolMeta {
        SymbolMeta { tick_size: 0.01, step_size: 0.001, min_notional: 5.0, hedge_mode: false, price_precision: 2, qty_precision: 3 }
    }

    fn sample_intent(is_market: bool) -> EntryIntent {
        EntryIntent {
            strategy_id: StrategyId(1),
            bot_id: BotId(1),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 30000.0,
            is_market,
            notional_amount: 100.0,
            oc_pct: 0.6,
        }
    }

    #[tokio::test]
    async fn submit_creates_open_entry_order_for_limit_intent() {
        let venue = Arc::new(FakeVenue {
            meta: sample_meta(),
            reject_limit_close_to_market: AtomicU32::new(0),
            submitted: std::sync::Mutex::new(vec![]),
        });
        let svc = OrderService::new(venue, Arc::new(KeyedLocks::new()), Arc::new(AtomicU64::new(1)), 3);
        let outcome = svc.submit(sample_intent(false), 10, 1000).await;
        match outcome {
            SubmitOutcome::Submitted(order) => {
                assert_eq!(order.status, EntryOrderStatus::Open);
                assert_eq!(order.venue_order_id, "venue-order-1");
            }
            other => panic!("expected Submitted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn qty_below_min_notional_is_rejected_without_retry() {
        let mut meta = sample_meta();
        meta.min_notional = 10_000.0;
        let venue = Arc::new(FakeVenue {
            meta,
            reject_limit_close_to_market: AtomicU32::new(0),
            submitted: std::sync::Mutex::new(vec![]),
        });
        let svc = OrderService::new(venue, Arc::new(KeyedLocks::new()), Arc::new(AtomicU64::new(1)), 3);
        let outcome = svc.submit(sample_intent(true), 10, 1000).await;
        assert!(matches!(outcome, SubmitOutcome::RejectedNoRetry(_)));
    }

    #[tokio::test]
    async fn price_too_close_to_market_converts_limit_to_market_and_retries() {
        let venue = Arc::new(FakeVenue {
            meta: sample_meta(),
            reject_limit_close_to_market: AtomicU32::new(1),
            submitted: std::sync::Mutex::new(vec![]),
        });
        let svc = OrderService::new(venue.clone(), Arc::new(KeyedLocks::new()), Arc::new(AtomicU64::new(1)), 3);
        let outcome = svc.submit(sample_intent(false), 10, 1000).await;
        assert!(matches!(outcome, SubmitOutcome::Submitted(_)));
        let submitted = venue.submitted.lock().unwrap();
        assert_eq!(submitted.last().unwrap().order_type, Some(OrderType::Market));
    }

    #[test]
    fn compute_qty_rejects_below_min_notional() {
        assert!(compute_qty(1.0, 30000.0, 0.001, 5.0).is_err());
    }

    #[test]
    fn compute_qty_step_rounds_and_accepts_above_min_notional() {
        let qty = compute_qty(100.0, 30000.0, 0.001, 5.0).unwrap();
        assert!((qty - 0.003).abs() < 1e-9);
    }
}
