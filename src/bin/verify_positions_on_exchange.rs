//! Operator CLI: cross-checks the internal book against venue-reported
//! positions for one bot without mutating anything.
//! `verify-positions-on-exchange --bot-id N`.

use oc_trader::reconciler;
use oc_trader::repository::{InMemoryStore, PositionRepository};
use oc_trader::venue::bybit::BybitVenue;
use oc_trader::venue::VenueAdapter;
use std::process::ExitCode;
use std::sync::Arc;

fn parse_bot_id(args: &[String]) -> Option<u64> {
    args.iter()
        .position(|a| a == "--bot-id")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse::<u64>().ok())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    let Some(bot_id) = parse_bot_id(&args) else {
        log::error!("usage: verify-positions-on-exchange --bot-id N");
        return ExitCode::from(1);
    };

    let base_url = std::env::var("BYBIT_BASE_URL").unwrap_or_else(|_| "https://api-demo.bybit.com".into());
    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    let venue = BybitVenue::new(base_url, api_key, api_secret, oc_trader::venue::RateLimiterConfig::default());
    let store = Arc::new(InMemoryStore::new());

    let venue_positions = match venue.open_positions().await {
        Ok(p) => p,
        Err(e) => {
            log::error!("failed to fetch venue positions for bot {bot_id}: {e}");
            return ExitCode::from(1);
        }
    };
    let book_positions = PositionRepository::open_positions(store.as_ref());
    let (venue_only, book_only, both) = reconciler::classify(&venue_positions, &book_positions);

    log::info!("bot {bot_id}: {} matched, {} venue-only, {} book-only", both.len(), venue_only.len(), book_only.len());
    for vp in &venue_only {
        log::warn!("venue-only: {} {:?} qty={}", vp.symbol, vp.side, vp.qty);
    }
    for bp in &book_only {
        log::warn!("book-only: {} {:?} size={}", bp.symbol, bp.side, bp.position_size);
    }

    if venue_only.is_empty() && book_only.is_empty() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}
