//! Operator CLI: sweeps open Positions missing a stop-loss order and
//! attaches one. `fix-missing-sl [--apply]` — without `--apply`, only
//! reports what is missing.

use oc_trader::position_monitor::attach_stop_loss;
use oc_trader::repository::{InMemoryStore, PositionRepository};
use oc_trader::venue::bybit::BybitVenue;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let apply = std::env::args().any(|a| a == "--apply");

    let base_url = std::env::var("BYBIT_BASE_URL").unwrap_or_else(|_| "https://api-demo.bybit.com".into());
    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    let venue = BybitVenue::new(base_url, api_key, api_secret, oc_trader::venue::RateLimiterConfig::default());
    let store = Arc::new(InMemoryStore::new());

    let missing: Vec<_> = PositionRepository::open_positions(store.as_ref())
        .into_iter()
        .filter(|p| p.sl_order_id.is_none() && !p.software_sl)
        .collect();

    if missing.is_empty() {
        log::info!("fix-missing-sl: every open position already has a stop-loss");
        return ExitCode::from(2);
    }

    log::info!("fix-missing-sl: {} positions missing a stop-loss", missing.len());
    if !apply {
        for p in &missing {
            log::info!("  {} {} sl_target={}", p.symbol, p.id, p.sl_price.unwrap_or(p.entry_price));
        }
        return ExitCode::SUCCESS;
    }

    let mut failures = 0;
    for mut position in missing {
        let sl_price = position.sl_price.unwrap_or(position.entry_price);
        match attach_stop_loss(&venue, &position, sl_price, false).await {
            Ok(Some(id)) => {
                position.sl_order_id = Some(id);
                PositionRepository::update(store.as_ref(), position);
            }
            Ok(None) => {
                position.software_sl = true;
                PositionRepository::update(store.as_ref(), position);
            }
            Err(e) => {
                log::error!("failed to attach stop-loss: {e}");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
