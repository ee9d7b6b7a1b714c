//! Persistence boundary. Production deployments back these traits with a
//! database; this crate ships an in-memory implementation sufficient for
//! tests and the CLI binaries' dry paths. An explicit repository seam keeps
//! engine components from ever touching storage directly.

use crate::types::{
    Bot, BotId, CloseReason, EntryOrder, EntryOrderId, EntryOrderStatus, Position, PositionId,
    Side, Strategy, StrategyId,
};
use std::collections::HashMap;
use std::sync::Mutex;

pub trait BotRepository: Send + Sync {
    fn all_active(&self) -> Vec<Bot>;
    fn get(&self, id: BotId) -> Option<Bot>;
}

pub trait StrategyRepository: Send + Sync {
    fn all_active(&self) -> Vec<Strategy>;
    fn get(&self, id: StrategyId) -> Option<Strategy>;
}

pub trait EntryOrderRepository: Send + Sync {
    fn insert(&self, order: EntryOrder);
    fn get(&self, id: EntryOrderId) -> Option<EntryOrder>;
    fn open_orders(&self) -> Vec<EntryOrder>;
    fn set_status(&self, id: EntryOrderId, status: EntryOrderStatus);
}

pub trait PositionRepository: Send + Sync {
    fn insert(&self, position: Position);
    fn get(&self, id: PositionId) -> Option<Position>;
    fn open_positions(&self) -> Vec<Position>;
    fn has_open_exposure(&self, bot_id: BotId, symbol: &str, side: Side) -> bool;
    fn update(&self, position: Position);
    fn close(&self, id: PositionId, close_price: f64, realized_pnl: f64, reason: CloseReason, closed_at: i64);
}

/// Creates the `Position` row and marks the originating `EntryOrder` filled
/// as one logical unit: a fill can never be recorded without its position,
/// or vice versa.
pub trait FillTransaction: Send + Sync {
    fn confirm_fill(&self, entry_order_id: EntryOrderId, position: Position);
}

#[derive(Default)]
struct Tables {
    bots: HashMap<BotId, Bot>,
    strategies: HashMap<StrategyId, Strategy>,
    entry_orders: HashMap<EntryOrderId, EntryOrder>,
    positions: HashMap<PositionId, Position>,
}

/// Single in-memory store implementing all four repository traits plus the
/// fill transaction, guarded by one mutex. Sufficient for tests and single
/// process deployments; a real deployment swaps this for a database-backed
/// implementation without the engine code changing.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore::default()
    }

    pub fn seed_bot(&self, bot: Bot) {
        self.tables.lock().unwrap().bots.insert(bot.id, bot);
    }

    pub fn seed_strategy(&self, strategy: Strategy) {
        self.tables.lock().unwrap().strategies.insert(strategy.id, strategy);
    }
}

impl BotRepository for InMemoryStore {
    fn all_active(&self) -> Vec<Bot> {
        self.tables.lock().unwrap().bots.values().filter(|b| b.active).cloned().collect()
    }

    fn get(&self, id: BotId) -> Option<Bot> {
        self.tables.lock().unwrap().bots.get(&id).cloned()
    }
}

impl StrategyRepository for InMemoryStore {
    fn all_active(&self) -> Vec<Strategy> {
        self.tables.lock().unwrap().strategies.values().filter(|s| s.active).cloned().collect()
    }

    fn get(&self, id: StrategyId) -> Option<Strategy> {
        self.tables.lock().unwrap().strategies.get(&id).cloned()
    }
}

impl EntryOrderRepository for InMemoryStore {
    fn insert(&self, order: EntryOrder) {
        self.tables.lock().unwrap().entry_orders.insert(order.id, order);
    }

    fn get(&self, id: EntryOrderId) -> Option<EntryOrder> {
        self.tables.lock().unwrap().entry_orders.get(&id).cloned()
    }

    fn open_orders(&self) -> Vec<EntryOrder> {
        self.tables
            .lock()
            .unwrap()
            .entry_orders
            .values()
            .filter(|o| o.status == EntryOrderStatus::Open)
            .cloned()
            .collect()
    }

    fn set_status(&self, id: EntryOrderId, status: EntryOrderStatus) {
        if let Some(order) = self.tables.lock().unwrap().entry_orders.get_mut(&id) {
            order.status = status;
        }
    }
}

impl PositionRepository for InMemoryStore {
    fn insert(&self, position: Position) {
        self.tables.lock().unwrap().positions.insert(position.id, position);
    }

    fn get(&self, id: PositionId) -> Option<Position> {
        self.tables.lock().unwrap().positions.get(&id).cloned()
    }

    fn open_positions(&self) -> Vec<Position> {
        self.tables.lock().unwrap().positions.values().filter(|p| p.is_open()).cloned().collect()
    }

    fn has_open_exposure(&self, bot_id: BotId, symbol: &str, side: Side) -> bool {
        self.tables
            .lock()
            .unwrap()
            .positions
            .values()
            .any(|p| p.is_open() && p.bot_id == bot_id && p.symbol == symbol && p.side == side)
    }

    fn update(&self, position: Position) {
        self.tables.lock().unwrap().positions.insert(position.id, position);
    }

    fn close(&self, id: PositionId, close_price: f64, realized_pnl: f64, reason: CloseReason, closed_at: i64) {
        if let Some(pos) = self.tables.lock().unwrap().positions.get_mut(&id) {
            pos.status = crate::types::PositionStatus::Closed;
            pos.close_price = Some(close_price);
            pos.realized_pnl = Some(realized_pnl);
            pos.close_reason = Some(reason);
            pos.closed_at = Some(closed_at);
        }
    }
}

impl FillTransaction for InMemoryStore {
    fn confirm_fill(&self, entry_order_id: EntryOrderId, position: Position) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(order) = tables.entry_orders.get_mut(&entry_order_id) {
            order.status = EntryOrderStatus::Filled;
        }
        tables.positions.insert(position.id, position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryOrderStatus, ExitOrderKind, PositionStatus};

    fn sample_entry_order() -> EntryOrder {
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
            reservation_token: Some("tok-1".into()),
            created_at: 0,
        }
    }

    fn sample_position() -> Position {
        Position {
            id: PositionId(1),
            strategy_id: StrategyId(1),
            bot_id: BotId(1),
            entry_order_id: EntryOrderId(1),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
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

    #[test]
    fn confirm_fill_atomically_marks_order_and_creates_position() {
        let store = InMemoryStore::new();
        EntryOrderRepository::insert(&store, sample_entry_order());
        store.confirm_fill(EntryOrderId(1), sample_position());

        assert_eq!(EntryOrderRepository::get(&store, EntryOrderId(1)).unwrap().status, EntryOrderStatus::Filled);
        assert!(PositionRepository::get(&store, PositionId(1)).is_some());
    }

    #[test]
    fn has_open_exposure_ignores_closed_positions() {
        let store = InMemoryStore::new();
        let mut pos = sample_position();
        PositionRepository::insert(&store, pos.clone());
        assert!(store.has_open_exposure(BotId(1), "BTCUSDT", Side::Long));

        pos.status = PositionStatus::Closed;
        store.update(pos);
        assert!(!store.has_open_exposure(BotId(1), "BTCUSDT", Side::Long));
    }

    #[test]
    fn close_sets_terminal_fields() {
        let store = InMemoryStore::new();
        PositionRepository::insert(&store, sample_position());
        store.close(PositionId(1), 31500.0, 50.0, CloseReason::TpHit, 1000);
        let pos = PositionRepository::get(&store, PositionId(1)).unwrap();
        assert!(!pos.is_open());
        assert_eq!(pos.close_reason, Some(CloseReason::TpHit));
        assert_eq!(pos.realized_pnl, Some(50.0));
    }
}
