//! Operator CLI: market-closes every open Position for a bot, or all bots
//! if `--bot-id` is omitted. Close reason recorded as
//! `force_close_from_api`.

use oc_trader::position_monitor;
use oc_trader::repository::{InMemoryStore, PositionRepository};
use oc_trader::types::{BotId, CloseReason};
use oc_trader::venue::bybit::BybitVenue;
use oc_trader::venue::{OrderRequest, OrderSide, OrderType, VenueAdapter};
use std::process::ExitCode;
use std::sync::Arc;

fn parse_bot_id(args: &[String]) -> Option<BotId> {
    args.iter()
        .position(|a| a == "--bot-id")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse::<u64>().ok())
        .map(BotId)
}

fn exit_side(side: oc_trader::types::Side) -> OrderSide {
    match side {
        oc_trader::types::Side::Long => OrderSide::Sell,
        oc_trader::types::Side::Short => OrderSide::Buy,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    let target_bot = parse_bot_id(&args);

    let base_url = std::env::var("BYBIT_BASE_URL").unwrap_or_else(|_| "https://api-demo.bybit.com".into());
    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    let venue = BybitVenue::new(base_url, api_key, api_secret, oc_trader::venue::RateLimiterConfig::default());
    let store = Arc::new(InMemoryStore::new());

    let positions: Vec<_> = PositionRepository::open_positions(store.as_ref())
        .into_iter()
        .filter(|p| target_bot.map(|id| id == p.bot_id).unwrap_or(true))
        .collect();

    if positions.is_empty() {
        log::info!("force-close-all: no open positions to close");
        return ExitCode::from(2);
    }

    let mut failures = 0;
    for position in positions {
        let mut req = OrderRequest::new(position.symbol.clone(), format!("force-close-{}", position.id));
        req.side = Some(exit_side(position.side));
        req.order_type = Some(OrderType::Market);
        req.qty = position.position_size;
        req.reduce_only = true;

        match venue.submit_order(req).await {
            Ok(_) => {
                let mark = venue.price(&position.symbol).await.unwrap_or(position.entry_price);
                let pnl = position_monitor::realized_pnl(&position, mark);
                PositionRepository::close(store.as_ref(), position.id, mark, pnl, CloseReason::ForceCloseFromApi, 0);
                log::info!("force-closed {} pnl={pnl:.4}", position.symbol);
            }
            Err(e) => {
                log::error!("failed to close {}: {e}", position.symbol);
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
