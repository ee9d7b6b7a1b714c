//! Best-effort lifecycle event publication behind a `Notifier` trait, so
//! the engine depends on an interface rather than a concrete chat backend.

use crate::types::{CloseReason, Side};
use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn entry_filled(&self, symbol: &str, side: Side, qty: f64, entry: f64, tp: f64, sl: Option<f64>);
    async fn exits_attached(&self, symbol: &str, tp_order_id: Option<&str>, sl_order_id: Option<&str>);
    async fn position_closed(&self, symbol: &str, side: Side, entry: f64, exit: f64, pnl: f64, reason: CloseReason);
    async fn reconciler_anomaly(&self, message: &str);
    async fn risk_alert(&self, message: &str);
}

const BASE_URL: &str = "https://api.telegram.org";

#[derive(Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: &str) -> Self {
        TelegramNotifier {
            client: reqwest::Client::new(),
            url: format!("{BASE_URL}/bot{token}/sendMessage"),
            chat_id: chat_id.to_string(),
        }
    }

    async fn send(&self, text: &str) {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                log::info!("notifier: sent ({})", preview.replace('\n', " "));
            }
            Ok(resp) => log::warn!("notifier: non-success status {}", resp.status()),
            Err(e) => log::warn!("notifier: send failed: {e}"),
        }
    }
}

fn side_label(side: Side) -> &'static str {
    match side {
        Side::Long => "Long",
        Side::Short => "Short",
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn entry_filled(&self, symbol: &str, side: Side, qty: f64, entry: f64, tp: f64, sl: Option<f64>) {
        let emoji = if side == Side::Long { "🟢" } else { "🔴" };
        let sl_line = sl.map(|v| format!("SL: <code>{v:.4}</code>\n")).unwrap_or_default();
        let msg = format!(
            "{emoji} <b>Entry filled — {} {symbol}</b>\nQty: <code>{qty:.6}</code>\nEntry: <code>{entry:.4}</code>\n{sl_line}TP: <code>{tp:.4}</code>",
            side_label(side)
        );
        self.send(&msg).await;
    }

    async fn exits_attached(&self, symbol: &str, tp_order_id: Option<&str>, sl_order_id: Option<&str>) {
        let msg = format!(
            "🛡 <b>Exits attached — {symbol}</b>\nTP: <code>{}</code>\nSL: <code>{}</code>",
            tp_order_id.unwrap_or("-"),
            sl_order_id.unwrap_or("-")
        );
        self.send(&msg).await;
    }

    async fn position_closed(&self, symbol: &str, side: Side, entry: f64, exit: f64, pnl: f64, reason: CloseReason) {
        let emoji = if pnl >= 0.0 { "✅" } else { "❌" };
        let msg = format!(
            "{emoji} <b>Position closed — {} {symbol}</b>\nEntry: <code>{entry:.4}</code>  Exit: <code>{exit:.4}</code>\nPnL: <code>{pnl:+.4}</code>\nReason: {}",
            side_label(side),
            reason.as_str()
        );
        self.send(&msg).await;
    }

    async fn reconciler_anomaly(&self, message: &str) {
        self.send(&format!("🔎 <b>Reconciler</b>\n{message}")).await;
    }

    async fn risk_alert(&self, message: &str) {
        self.send(&format!("⚠️ <b>Risk alert</b>\n{message}")).await;
    }
}

/// No-op implementation for tests and deployments with no configured
/// notification channel.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn entry_filled(&self, _symbol: &str, _side: Side, _qty: f64, _entry: f64, _tp: f64, _sl: Option<f64>) {}
    async fn exits_attached(&self, _symbol: &str, _tp_order_id: Option<&str>, _sl_order_id: Option<&str>) {}
    async fn position_closed(&self, _symbol: &str, _side: Side, _entry: f64, _exit: f64, _pnl: f64, _reason: CloseReason) {}
    async fn reconciler_anomaly(&self, _message: &str) {}
    async fn risk_alert(&self, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_notifier_never_panics_on_any_call() {
        let n = NullNotifier;
        n.entry_filled("BTCUSDT", Side::Long, 0.01, 30000.0, 31500.0, Some(29000.0)).await;
        n.exits_attached("BTCUSDT", Some("tp-1"), None).await;
        n.position_closed("BTCUSDT", Side::Long, 30000.0, 31500.0, 15.0, CloseReason::TpHit).await;
        n.reconciler_anomaly("drift detected").await;
        n.risk_alert("daily loss cap hit").await;
    }
}
