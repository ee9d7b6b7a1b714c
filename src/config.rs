//! Typed, hot-reloadable key/value configuration. Every component reads
//! through `ConfigStore` rather than hardcoded constants: the store is
//! constructed once in `Context` and shared by `Arc`.

use crate::errors::ConfigError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl ConfigValue {
    fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(v) => Some(*v),
            _ => None,
        }
    }
    fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
    fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
    fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// Default values for every recognized key.
fn defaults() -> HashMap<&'static str, ConfigValue> {
    use ConfigValue::*;
    HashMap::from([
        ("position_monitor_interval_ms", Int(3_000)),
        ("position_sync_interval_minutes", Int(5)),
        ("entry_order_monitor_cron", Str("*/30 * * * * *".into())),
        ("tp_update_threshold_ticks", Int(5)),
        ("sl_update_threshold_ticks", Int(5)),
        ("exit_order_min_price_change_pct", Float(0.05)),
        ("adv_tpsl_trailing_enabled", Bool(true)),
        ("position_drift_tolerance_pct", Float(5.0)),
        ("binance_min_request_interval_ms", Int(50)),
        ("binance_signed_request_interval_ms", Int(100)),
        ("binance_market_data_min_interval_ms", Int(20)),
        ("binance_timeout_window_ms", Int(60_000)),
        ("binance_timeout_threshold", Int(5)),
        ("binance_max_throttle_multiplier", Float(4.0)),
        ("binance_throttle_decay_ms", Int(30_000)),
        ("binance_timeout_circuit_cooldown_ms", Int(15_000)),
        ("tp_sl_update_batch_size", Int(10)),
        ("tp_sl_update_delay_ms", Int(200)),
        ("tp_sl_max_retries", Int(3)),
        ("tp_sl_retry_backoff_ms", Int(500)),
        ("candles_retention_days", Int(30)),
        ("candles_keep_last_per_interval", Int(500)),
        ("candles_prune_mode", Str("both".into())),
        ("emergency_ttl_secs", Int(30)),
        ("default_position_mode", Str("one_way".into())),
        ("venue_call_deadline_secs", Int(5)),
        ("emergency_call_deadline_secs", Int(10)),
        ("shutdown_drain_timeout_secs", Int(15)),
    ])
}

/// Copy-on-write snapshot: readers see a consistent view for the duration of
/// a cycle by cloning the `Arc<HashMap<..>>` once at cycle start.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Arc<HashMap<String, ConfigValue>>>>,
}

impl ConfigStore {
    pub fn with_defaults() -> Self {
        let map: HashMap<String, ConfigValue> = defaults()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        ConfigStore {
            inner: Arc::new(RwLock::new(Arc::new(map))),
        }
    }

    /// A consistent snapshot for one control-loop cycle.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            map: self.inner.read().unwrap().clone(),
        }
    }

    /// Hot-reload a single key (what an eventual HTTP/operator layer would
    /// call; this crate just exposes the mechanism).
    pub fn set(&self, key: &str, value: ConfigValue) {
        let mut guard = self.inner.write().unwrap();
        let mut next = (**guard).clone();
        next.insert(key.to_string(), value);
        *guard = Arc::new(next);
    }

    pub fn reload(&self, values: HashMap<String, ConfigValue>) {
        let mut merged = (**self.inner.read().unwrap()).clone();
        merged.extend(values);
        *self.inner.write().unwrap() = Arc::new(merged);
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub struct ConfigSnapshot {
    map: Arc<HashMap<String, ConfigValue>>,
}

impl ConfigSnapshot {
    pub fn get_i64(&self, key: &str) -> Result<i64, ConfigError> {
        self.map
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?
            .as_i64()
            .ok_or(ConfigError::TypeMismatch { key: key.to_string(), expected: "int" })
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, ConfigError> {
        self.map
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?
            .as_f64()
            .ok_or(ConfigError::TypeMismatch { key: key.to_string(), expected: "float" })
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        self.map
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?
            .as_bool()
            .ok_or(ConfigError::TypeMismatch { key: key.to_string(), expected: "bool" })
    }

    pub fn get_str(&self, key: &str) -> Result<&str, ConfigError> {
        self.map
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?
            .as_str()
            .ok_or(ConfigError::TypeMismatch { key: key.to_string(), expected: "str" })
    }

    pub fn duration_ms(&self, key: &str) -> std::time::Duration {
        std::time::Duration::from_millis(self.get_i64(key).unwrap_or(0).max(0) as u64)
    }
}
