//! Single-threaded fan-out of last-trade ticks to subscribers keyed by
//! normalized symbol; also emits "candle closed" events per (symbol,
//! interval). A venue-neutral dispatcher that builds its own 1-minute
//! candles from raw ticks rather than relying on exchange kline frames.

use crate::types::Candle;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type TickHandler = Arc<dyn Fn(f64, i64) + Send + Sync>;

struct MinuteAccumulator {
    minute_start: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl MinuteAccumulator {
    fn new(minute_start: i64, price: f64) -> Self {
        MinuteAccumulator { minute_start, open: price, high: price, low: price, close: price, volume: 0.0 }
    }

    fn push(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    fn into_candle(self, close_time: i64) -> Candle {
        Candle {
            open_time: self.minute_start,
            close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

fn minute_floor(ts: i64) -> i64 {
    ts - (ts % 60)
}

pub type CandleCloseHandler = Arc<dyn Fn(&str, Candle) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    tick_handlers: HashMap<String, Vec<TickHandler>>,
    candle_handlers: Vec<CandleCloseHandler>,
    accumulators: HashMap<String, MinuteAccumulator>,
}

/// Cooperative dispatcher. Subscribers must not block in their handler;
/// long work should be `tokio::spawn`'d by the handler itself.
#[derive(Clone)]
pub struct TickBus {
    inner: Arc<Mutex<Subscribers>>,
}

impl TickBus {
    pub fn new() -> Self {
        TickBus { inner: Arc::new(Mutex::new(Subscribers::default())) }
    }

    pub fn subscribe(&self, symbol: &str, handler: TickHandler) {
        let mut inner = self.inner.lock().unwrap();
        inner.tick_handlers.entry(symbol.to_string()).or_default().push(handler);
    }

    pub fn on_candle_closed(&self, handler: CandleCloseHandler) {
        self.inner.lock().unwrap().candle_handlers.push(handler);
    }

    /// Feed one trade tick. Fans out to subscribers, then folds the price
    /// into the symbol's open 1-minute candle, closing and emitting the
    /// previous minute if the tick crosses a boundary.
    pub fn publish_tick(&self, symbol: &str, price: f64, ts: i64) {
        let (handlers, closed) = {
            let mut inner = self.inner.lock().unwrap();
            let handlers = inner.tick_handlers.get(symbol).cloned().unwrap_or_default();

            let minute = minute_floor(ts);
            let mut closed: Option<Candle> = None;
            let acc = inner.accumulators.entry(symbol.to_string()).or_insert_with(|| MinuteAccumulator::new(minute, price));
            if acc.minute_start != minute {
                let finished = std::mem::replace(acc, MinuteAccumulator::new(minute, price));
                closed = Some(finished.into_candle(minute));
            }
            acc.push(price);
            acc.volume += 0.0; // volume accrues via `publish_trade_volume`, kept separate from price ticks
            (handlers, closed)
        };

        for h in handlers {
            h(price, ts);
        }
        if let Some(candle) = closed {
            let candle_handlers = self.inner.lock().unwrap().candle_handlers.clone();
            for h in candle_handlers {
                h(symbol, candle.clone());
            }
        }
    }

    /// Accrue traded volume into the current open minute for `symbol`.
    pub fn publish_trade_volume(&self, symbol: &str, qty: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(acc) = inner.accumulators.get_mut(symbol) {
            acc.volume += qty;
        }
    }

    pub fn now_ts() -> i64 {
        Utc::now().timestamp()
    }
}

impl Default for TickBus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_minute(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|d| d.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}
