//! Operator CLI: closes internal Positions that have had no matching venue
//! exposure for longer than `--max-age-hours`. Close reason
//! `ghost_cleanup_script`.

use oc_trader::position_monitor;
use oc_trader::repository::{InMemoryStore, PositionRepository};
use oc_trader::types::CloseReason;
use oc_trader::venue::bybit::BybitVenue;
use oc_trader::venue::VenueAdapter;
use std::process::ExitCode;
use std::sync::Arc;

fn parse_max_age_hours(args: &[String]) -> i64 {
    args.iter()
        .position(|a| a == "--max-age-hours")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(24)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    let max_age_hours = parse_max_age_hours(&args);
    let dry_run = args.iter().any(|a| a == "--dry-run");

    let base_url = std::env::var("BYBIT_BASE_URL").unwrap_or_else(|_| "https://api-demo.bybit.com".into());
    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    let venue = BybitVenue::new(base_url, api_key, api_secret, oc_trader::venue::RateLimiterConfig::default());
    let store = Arc::new(InMemoryStore::new());

    let venue_positions = match venue.open_positions().await {
        Ok(p) => p,
        Err(e) => {
            log::error!("failed to fetch venue positions: {e}");
            return ExitCode::from(1);
        }
    };

    let now = chrono::Utc::now().timestamp();
    let max_age_secs = max_age_hours * 3600;
    let ghosts: Vec<_> = PositionRepository::open_positions(store.as_ref())
        .into_iter()
        .filter(|p| now - p.opened_at > max_age_secs)
        .filter(|p| !venue_positions.iter().any(|vp| vp.symbol == p.symbol))
        .collect();

    if ghosts.is_empty() {
        log::info!("cleanup-ghost-positions: none found older than {max_age_hours}h with no venue match");
        return ExitCode::from(2);
    }

    for ghost in &ghosts {
        log::info!("ghost candidate: {} opened_at={} symbol={}", ghost.id, ghost.opened_at, ghost.symbol);
    }

    if dry_run {
        log::info!("dry run: {} ghost positions would be closed", ghosts.len());
        return ExitCode::SUCCESS;
    }

    for ghost in ghosts {
        let mark = venue.price(&ghost.symbol).await.unwrap_or(ghost.entry_price);
        let pnl = position_monitor::realized_pnl(&ghost, mark);
        PositionRepository::close(store.as_ref(), ghost.id, mark, pnl, CloseReason::GhostCleanupScript, now);
    }

    ExitCode::SUCCESS
}
