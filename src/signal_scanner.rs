//! Consumes ticks and closed candles, evaluates per-strategy signal
//! conditions based on open-close percent movement, and emits candidate
//! Entry Intents.

use crate::types::{EntryIntent, OcDirection, Side, Strategy, StrategyMode};

/// `oc = (close - open) / open * 100`. Symmetric under swap up to sign
/// (spec P5): `calc_oc(open, close) == -calc_oc(close, open)`.
pub fn calc_oc(open: f64, close: f64) -> f64 {
    (close - open) / open * 100.0
}

pub fn oc_direction(open: f64, close: f64) -> OcDirection {
    if close >= open {
        OcDirection::Bullish
    } else {
        OcDirection::Bearish
    }
}

fn trend_following_side(direction: OcDirection) -> Side {
    match direction {
        OcDirection::Bullish => Side::Long,
        OcDirection::Bearish => Side::Short,
    }
}

fn counter_trend_side(direction: OcDirection) -> Side {
    match direction {
        OcDirection::Bullish => Side::Short,
        OcDirection::Bearish => Side::Long,
    }
}

/// Counter-trend entry price:
/// `delta = |current - open|`, `r = extend/100`;
/// long: `entry = current - r*delta`, short: `entry = current + r*delta`.
pub fn counter_trend_entry_price(current: f64, open: f64, extend_pct: f64, side: Side) -> f64 {
    let delta = (current - open).abs();
    let r = extend_pct / 100.0;
    match side {
        Side::Long => current - r * delta,
        Side::Short => current + r * delta,
    }
}

/// Guards against entries already overtaken by further price movement:
/// for long, current must still be >= entry; for short, current <= entry.
pub fn extend_condition_met(current: f64, entry: f64, side: Side) -> bool {
    match side {
        Side::Long => current >= entry,
        Side::Short => current <= entry,
    }
}

/// Checks whether a candle's OC move past `strategy.oc_threshold_pct`
/// produces a candidate `EntryIntent` at `current_price`, without yet
/// deduping against the open book (the caller owns that, since it needs a
/// view across all strategies on this (symbol, interval)).
pub fn evaluate_strategy(
    strategy: &Strategy,
    candle_open: f64,
    candle_close: f64,
    current_price: f64,
) -> Vec<EntryIntent> {
    let oc = calc_oc(candle_open, candle_close);
    if oc.abs() < strategy.oc_threshold_pct {
        return Vec::new();
    }
    let direction = oc_direction(candle_open, candle_close);

    let candidate_side = match strategy.mode {
        StrategyMode::TrendFollowing => trend_following_side(direction),
        StrategyMode::CounterTrend => counter_trend_side(direction),
    };
    if !strategy.side_policy.allows(candidate_side) {
        return Vec::new();
    }

    let (entry_price, is_market) = match strategy.mode {
        StrategyMode::TrendFollowing => (current_price, true),
        StrategyMode::CounterTrend => {
            let entry = counter_trend_entry_price(current_price, candle_open, strategy.extend_pct, candidate_side);
            if !extend_condition_met(current_price, entry, candidate_side) {
                return Vec::new();
            }
            (entry, false)
        }
    };

    vec![EntryIntent {
        strategy_id: strategy.id,
        bot_id: strategy.bot_id,
        symbol: strategy.symbol.clone(),
        side: candidate_side,
        entry_price,
        is_market,
        notional_amount: strategy.notional_amount,
        oc_pct: oc,
    }]
}

/// Open-book membership the scanner checks before emitting an intent
/// (invariant I1). The caller provides a closure so the scanner stays
/// decoupled from the concrete repository implementation.
pub trait OpenBookView {
    fn has_open_exposure(&self, bot_id: crate::types::BotId, symbol: &str, side: Side) -> bool;
}

/// Scans all active strategies triggered on this (symbol, interval) closed
/// candle, tie-breaking by ascending strategy id and re-checking dedup
/// after each emission.
pub fn scan_candle<B: OpenBookView>(
    mut strategies: Vec<&Strategy>,
    candle_open: f64,
    candle_close: f64,
    current_price: f64,
    book: &B,
) -> Vec<EntryIntent> {
    strategies.sort_by_key(|s| s.id);
    let mut survivors = Vec::new();
    for strategy in strategies {
        if !strategy.active {
            continue;
        }
        for intent in evaluate_strategy(strategy, candle_open, candle_close, current_price) {
            if book.has_open_exposure(intent.bot_id, &intent.symbol, intent.side) {
                continue;
            }
            survivors.push(intent);
        }
    }
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BotId, SidePolicy, StrategyId};

    fn strategy(mode: StrategyMode, side_policy: SidePolicy, oc_threshold: f64, extend: f64) -> Strategy {
        Strategy {
            id: StrategyId(1),
            bot_id: BotId(1),
            symbol: "BTCUSDT".into(),
            interval: "5m".into(),
            side_policy,
            mode,
            oc_threshold_pct: oc_threshold,
            extend_pct: extend,
            notional_amount: 100.0,
            tp_pct: 5.0,
            sl_pct: None,
            trail_reduce_pct: 1.0,
            trail_up_reduce_pct: 1.0,
            active: true,
        }
    }

    struct EmptyBook;
    impl OpenBookView for EmptyBook {
        fn has_open_exposure(&self, _bot_id: BotId, _symbol: &str, _side: Side) -> bool {
            false
        }
    }

    #[test]
    fn oc_is_symmetric_under_swap() {
        // P5
        let oc1 = calc_oc(30000.0, 30180.0);
        let oc2 = calc_oc(30180.0, 30000.0);
        assert!((oc1 + oc2).abs() < 1e-9);
    }

    #[test]
    fn trend_following_long_on_bullish_candle() {
        // S1: candle open=30000 close=30180, oc=+0.60%, trend-following.
        let strat = strategy(StrategyMode::TrendFollowing, SidePolicy::Both, 0.5, 0.0);
        let intents = evaluate_strategy(&strat, 30000.0, 30180.0, 30180.0);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Long);
        assert!(intents[0].is_market);
        assert_eq!(intents[0].entry_price, 30180.0);
    }

    #[test]
    fn counter_trend_short_with_extend_condition_met() {
        // S2: open=3000 current=3060 oc=+2.0% bullish => counter-trend short.
        // entry = 3060 + 0.6*60 = 3096; current(3060) <= entry(3096) => met.
        let strat = strategy(StrategyMode::CounterTrend, SidePolicy::Both, 1.0, 60.0);
        let intents = evaluate_strategy(&strat, 3000.0, 3060.0, 3060.0);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Short);
        assert!(!intents[0].is_market);
        assert!((intents[0].entry_price - 3096.0).abs() < 1e-9);
    }

    #[test]
    fn counter_trend_entry_already_overtaken_drops_candidate() {
        // If current price already moved past the computed entry in the
        // unfavorable direction, the extend condition fails.
        let strat = strategy(StrategyMode::CounterTrend, SidePolicy::Both, 1.0, 60.0);
        // current far below open so computed short entry < current -> condition fails
        let intents = evaluate_strategy(&strat, 3000.0, 3060.0, 3200.0);
        assert!(intents.is_empty());
    }

    #[test]
    fn below_threshold_produces_no_intent() {
        let strat = strategy(StrategyMode::TrendFollowing, SidePolicy::Both, 5.0, 0.0);
        let intents = evaluate_strategy(&strat, 30000.0, 30180.0, 30180.0);
        assert!(intents.is_empty());
    }

    #[test]
    fn side_policy_filters_candidate_side() {
        let strat = strategy(StrategyMode::TrendFollowing, SidePolicy::ShortOnly, 0.5, 0.0);
        // bullish candle -> trend-following long, but policy forbids long
        let intents = evaluate_strategy(&strat, 30000.0, 30180.0, 30180.0);
        assert!(intents.is_empty());
    }

    #[test]
    fn counter_trend_entry_differs_from_current_in_expected_direction() {
        let strat = strategy(StrategyMode::CounterTrend, SidePolicy::Both, 1.0, 60.0);
        let intents = evaluate_strategy(&strat, 3000.0, 3060.0, 3060.0);
        assert_eq!(intents.len(), 1);
        // short side: entry should be strictly above current
        assert!(intents[0].entry_price > 3060.0);
    }

    #[test]
    fn scan_candle_tie_breaks_by_ascending_id_and_rechecks_dedup() {
        struct OneShotBook {
            taken: std::sync::Mutex<std::collections::HashSet<(BotId, String, Side)>>,
        }
        impl OpenBookView for OneShotBook {
            fn has_open_exposure(&self, bot_id: BotId, symbol: &str, side: Side) -> bool {
                let mut taken = self.taken.lock().unwrap();
                let key = (bot_id, symbol.to_string(), side);
                if taken.contains(&key) {
                    true
                } else {
                    taken.insert(key);
                    false
                }
            }
        }

        let mut s1 = strategy(StrategyMode::TrendFollowing, SidePolicy::Both, 0.1, 0.0);
        s1.id = StrategyId(2);
        let mut s2 = strategy(StrategyMode::TrendFollowing, SidePolicy::Both, 0.1, 0.0);
        s2.id = StrategyId(1);

        let book = OneShotBook { taken: std::sync::Mutex::new(std::collections::HashSet::new()) };
        let survivors = scan_candle(vec![&s1, &s2], 30000.0, 30180.0, 30180.0, &book);
        // Both strategies target the same (bot, symbol, side); only the
        // first processed (ascending id: s2 with id=1) survives.
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].strategy_id, StrategyId(1));
    }
}
