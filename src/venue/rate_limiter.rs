//! Per-venue request scheduler: minimum inter-request gaps, an adaptive
//! throttle driven by a rolling error window, and a timeout circuit
//! breaker, kept as a standing scheduler instance shared by all calls on
//! one venue connection.

use crate::config::ConfigSnapshot;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestClass {
    Unsigned,
    Signed,
    MarketData,
}

struct Inner {
    last_request: Option<Instant>,
    error_window_start: Instant,
    error_count: u32,
    throttle_multiplier: f64,
    last_error: Option<Instant>,
    circuit_open_until: Option<Instant>,
}

/// Tunables mirror the `binance_*`-named configuration keys (kept
/// venue-neutral internally; the config keys retain the legacy venue-family
/// naming they were first documented under).
pub struct RateLimiterConfig {
    pub min_request_interval: Duration,
    pub signed_request_interval: Duration,
    pub market_data_interval: Duration,
    pub error_window: Duration,
    pub error_threshold: u32,
    pub max_throttle_multiplier: f64,
    pub throttle_decay: Duration,
    pub circuit_cooldown: Duration,
}

impl RateLimiterConfig {
    /// Builds the scheduler tunables from the `binance_*` config keys,
    /// falling back to `Default` for anything missing or mistyped.
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        let d = RateLimiterConfig::default();
        let ms = |key: &str, default: Duration| {
            snapshot
                .get_i64(key)
                .map(|v| Duration::from_millis(v.max(0) as u64))
                .unwrap_or(default)
        };
        RateLimiterConfig {
            min_request_interval: ms("binance_min_request_interval_ms", d.min_request_interval),
            signed_request_interval: ms("binance_signed_request_interval_ms", d.signed_request_interval),
            market_data_interval: ms("binance_market_data_min_interval_ms", d.market_data_interval),
            error_window: ms("binance_timeout_window_ms", d.error_window),
            error_threshold: snapshot.get_i64("binance_timeout_threshold").map(|v| v.max(0) as u32).unwrap_or(d.error_threshold),
            max_throttle_multiplier: snapshot.get_f64("binance_max_throttle_multiplier").unwrap_or(d.max_throttle_multiplier),
            throttle_decay: ms("binance_throttle_decay_ms", d.throttle_decay),
            circuit_cooldown: ms("binance_timeout_circuit_cooldown_ms", d.circuit_cooldown),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            min_request_interval: Duration::from_millis(50),
            signed_request_interval: Duration::from_millis(100),
            market_data_interval: Duration::from_millis(20),
            error_window: Duration::from_secs(60),
            error_threshold: 5,
            max_throttle_multiplier: 4.0,
            throttle_decay: Duration::from_secs(30),
            circuit_cooldown: Duration::from_secs(15),
        }
    }
}

pub struct RateScheduler {
    cfg: RateLimiterConfig,
    state: Mutex<Inner>,
}

impl RateScheduler {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        RateScheduler {
            cfg,
            state: Mutex::new(Inner {
                last_request: None,
                error_window_start: Instant::now(),
                error_count: 0,
                throttle_multiplier: 1.0,
                last_error: None,
                circuit_open_until: None,
            }),
        }
    }

    /// Returns `Some(remaining)` if non-emergency work should be rejected
    /// due to an open circuit breaker.
    pub fn circuit_rejects(&self, emergency: bool) -> Option<Duration> {
        if emergency {
            return None;
        }
        let state = self.state.lock().unwrap();
        match state.circuit_open_until {
            Some(until) if until > Instant::now() => Some(until - Instant::now()),
            _ => None,
        }
    }

    /// Blocks (via `tokio::time::sleep`) until the next request in this
    /// class is allowed to go out, accounting for the adaptive multiplier.
    pub async fn wait_turn(&self, class: RequestClass) {
        let sleep_for = {
            let mut state = self.state.lock().unwrap();
            self.decay_locked(&mut state);
            let base = match class {
                RequestClass::Unsigned => self.cfg.min_request_interval,
                RequestClass::Signed => self.cfg.signed_request_interval,
                RequestClass::MarketData => self.cfg.market_data_interval,
            };
            let gap = base.mul_f64(state.throttle_multiplier);
            let now = Instant::now();
            let wait = match state.last_request {
                Some(last) if now.duration_since(last) < gap => gap - now.duration_since(last),
                _ => Duration::ZERO,
            };
            state.last_request = Some(now + wait);
            wait
        };
        if !sleep_for.is_zero() {
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Records a transient failure (timeout / 5xx); bumps the throttle
    /// multiplier once the rolling error count crosses the threshold, and
    /// opens the circuit breaker on saturation.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        self.decay_locked(&mut state);
        let now = Instant::now();
        if now.duration_since(state.error_window_start) > self.cfg.error_window {
            state.error_window_start = now;
            state.error_count = 0;
        }
        state.error_count += 1;
        state.last_error = Some(now);

        if state.error_count > self.cfg.error_threshold {
            state.throttle_multiplier =
                (state.throttle_multiplier * 2.0).min(self.cfg.max_throttle_multiplier);
        }
        if state.error_count > self.cfg.error_threshold * 2 {
            state.circuit_open_until = Some(now + self.cfg.circuit_cooldown);
        }
    }

    pub fn record_success(&self) {
        // Successes don't immediately reset the multiplier; decay handles
        // that after a quiet period, not on next success.
    }

    fn decay_locked(&self, state: &mut Inner) {
        if let Some(last_error) = state.last_error {
            if Instant::now().duration_since(last_error) > self.cfg.throttle_decay
                && state.throttle_multiplier > 1.0
            {
                state.throttle_multiplier = (state.throttle_multiplier / 2.0).max(1.0);
                state.error_count = 0;
            }
        }
    }

    pub fn current_multiplier(&self) -> f64 {
        self.state.lock().unwrap().throttle_multiplier
    }
}
