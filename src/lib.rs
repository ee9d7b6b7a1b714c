//! Signal-driven leveraged futures trading engine. See each module for the
//! component of the design it implements.

pub mod config;
pub mod entry_confirmation;
pub mod errors;
pub mod notifier;
pub mod order_service;
pub mod position_monitor;
pub mod queue;
pub mod reconciler;
pub mod repository;
pub mod signal_scanner;
pub mod tick_bus;
pub mod timer;
pub mod types;
pub mod venue;

use config::ConfigStore;
use notifier::Notifier;
use order_service::KeyedLocks;
use repository::{BotRepository, EntryOrderRepository, FillTransaction, PositionRepository, StrategyRepository};
use std::sync::Arc;
use tick_bus::TickBus;
use venue::VenueAdapter;

/// Shared dependencies every component is constructed with: no component
/// reaches for a global, everything comes in through this struct.
pub struct Context<V: VenueAdapter, S> {
    pub config: ConfigStore,
    pub store: Arc<S>,
    pub venue: Arc<V>,
    pub tick_bus: TickBus,
    pub notifier: Arc<dyn Notifier>,
    pub locks: Arc<KeyedLocks>,
}

impl<V, S> Context<V, S>
where
    V: VenueAdapter,
    S: BotRepository + StrategyRepository + EntryOrderRepository + PositionRepository + FillTransaction,
{
    pub fn new(config: ConfigStore, store: Arc<S>, venue: Arc<V>, notifier: Arc<dyn Notifier>) -> Self {
        Context {
            config,
            store,
            venue,
            tick_bus: TickBus::new(),
            notifier,
            locks: Arc::new(KeyedLocks::new()),
        }
    }
}
