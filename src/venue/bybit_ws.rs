//! Bybit V5 WebSocket streams: public trades and the authenticated
//! execution/order/position feed, decoded into the venue-neutral
//! [`TickBus`] and [`AccountStreamEvent`] channel instead of
//! exchange-shaped buffers.

use crate::tick_bus::TickBus;
use crate::venue::bybit::decode_account_stream_message;
use crate::venue::AccountStreamEvent;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type HmacSha256 = Hmac<Sha256>;

const PING_INTERVAL_SECS: u64 = 20;

/// Runs the public trade stream until the connection drops, then returns
/// `Err` so the caller can back off and reconnect.
pub async fn connect_public_ticks(
    ws_url: &str,
    symbols: &[String],
    tick_bus: TickBus,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws_stream, _) = connect_async(ws_url).await?;
    log::info!("public WS connected to {ws_url}");

    let (mut write, mut read) = ws_stream.split();

    let args: Vec<String> = symbols.iter().map(|s| format!("publicTrade.{s}")).collect();
    write.send(Message::Text(json!({ "op": "subscribe", "args": args }).to_string())).await?;
    log::info!("public WS subscribed: {args:?}");

    let mut ping_timer = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping_timer.tick().await;

    let mut drop_reason: Option<String> = None;
    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if let Err(e) = write.send(Message::Text(json!({"op": "ping"}).to_string())).await {
                    drop_reason = Some(format!("ping failed: {e}"));
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(data) = serde_json::from_str::<serde_json::Value>(&text) {
                            if data["op"].as_str() == Some("pong") {
                                continue;
                            }
                            if let Some(topic) = data["topic"].as_str() {
                                let symbol = topic.splitn(2, '.').nth(1).unwrap_or("").to_string();
                                if let Some(trades) = data["data"].as_array() {
                                    for t in trades {
                                        let price: f64 = t["p"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                                        let qty: f64 = t["v"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                                        let ts_ms = t["T"].as_i64().unwrap_or(0);
                                        if price == 0.0 { continue; }
                                        tick_bus.publish_tick(&symbol, price, ts_ms / 1000);
                                        tick_bus.publish_trade_volume(&symbol, qty);
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        drop_reason = Some("closed by server".into());
                        break;
                    }
                    Some(Err(e)) => {
                        drop_reason = Some(format!("{e}"));
                        break;
                    }
                    None => {
                        drop_reason = Some("stream ended".into());
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    Err(drop_reason.unwrap_or_else(|| "connection dropped".into()).into())
}

fn sign_auth(api_key: &str, api_secret: &str) -> (String, String, String) {
    let expires = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64 + 5000;
    let payload = format!("GET/realtime{expires}");
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes()).expect("HMAC init");
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    (api_key.to_string(), expires.to_string(), signature)
}

/// Runs the authenticated account stream until the connection drops.
/// Decoded events are forwarded on `tx`; the caller applies them to the
/// book.
pub async fn connect_account_stream(
    ws_url: &str,
    api_key: &str,
    api_secret: &str,
    tx: mpsc::Sender<AccountStreamEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws_stream, _) = connect_async(ws_url).await?;
    log::info!("account WS connected to {ws_url}");

    let (mut write, mut read) = ws_stream.split();

    let (key, expires, signature) = sign_auth(api_key, api_secret);
    write.send(Message::Text(json!({"op": "auth", "args": [key, expires, signature]}).to_string())).await?;

    let sub_msg = json!({"op": "subscribe", "args": ["execution", "order", "position"]}).to_string();
    let mut ping_timer = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping_timer.tick().await;

    let mut authed = false;
    let mut drop_reason: Option<String> = None;
    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if let Err(e) = write.send(Message::Text(json!({"op": "ping"}).to_string())).await {
                    drop_reason = Some(format!("ping failed: {e}"));
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(data) = serde_json::from_str::<serde_json::Value>(&text) {
                            if data["op"].as_str() == Some("auth") {
                                if data["success"].as_bool() == Some(true) {
                                    log::info!("account WS authenticated");
                                    authed = true;
                                    if let Err(e) = write.send(Message::Text(sub_msg.clone())).await {
                                        drop_reason = Some(format!("subscribe failed: {e}"));
                                        break;
                                    }
                                } else {
                                    drop_reason = Some("auth failed".into());
                                    break;
                                }
                                continue;
                            }
                            if !authed {
                                continue;
                            }
                            let topic = data["topic"].as_str().unwrap_or("");
                            for event in decode_account_stream_message(topic, &data["data"]) {
                                if tx.send(event).await.is_err() {
                                    return Ok(()); // receiver dropped, caller is shutting down
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        drop_reason = Some("closed by server".into());
                        break;
                    }
                    Some(Err(e)) => {
                        drop_reason = Some(format!("{e}"));
                        break;
                    }
                    None => {
                        drop_reason = Some("stream ended".into());
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = tx.send(AccountStreamEvent::ListenKeyExpired).await;
    Err(drop_reason.unwrap_or_else(|| "connection dropped".into()).into())
}

/// Reconnects `connect` with exponential backoff, capped at 300s, until it
/// succeeds (returns `Ok`, which only happens on graceful shutdown) or
/// `max_retries` is exhausted.
pub async fn reconnect_with_backoff<F, Fut>(
    mut connect: F,
    max_retries: u32,
    initial_delay_secs: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>,
{
    let mut retries = 0;
    let mut delay = initial_delay_secs;
    loop {
        match connect().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                retries += 1;
                if retries >= max_retries {
                    return Err(format!("WS failed after {retries} retries: {e}").into());
                }
                log::warn!("WS error: {e}. Reconnect in {delay}s... ({retries}/{max_retries})");
                tokio::time::sleep(Duration::from_secs(delay)).await;
                delay = (delay * 2).min(300);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_auth_produces_hex_signature_and_future_expiry() {
        let (key, expires, sig) = sign_auth("k", "s");
        assert_eq!(key, "k");
        assert!(expires.parse::<u64>().unwrap() > 0);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig.len(), 64);
    }
}
