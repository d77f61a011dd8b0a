// =============================================================================
// Broker User-Event Stream — one long-lived WebSocket per account
// =============================================================================
//
// Frames are newline-delimited JSON. The client authorizes with the account's
// access token immediately after connect and then sends a heartbeat frame
// every 2.5 s. Reconnection uses exponential backoff with full jitter (base
// 1 s, cap 30 s). Events missed during a gap are recovered by the consumer:
// a `Connected` marker is emitted on every (re)connect so it can poll orders
// and positions and diff.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::broker::models::UserEvent;
use crate::broker::token::TokenCache;
use crate::config::EngineConfig;
use crate::directory::BrokerAccount;

/// Heartbeat cadence required by the broker.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);

/// What the stream task forwards to its consumer.
#[derive(Debug)]
pub enum StreamEvent {
    /// Emitted after each successful authorize, including the first. The
    /// consumer should resync orders/positions via REST on this marker.
    Connected,
    Event(UserEvent),
}

/// Exponential backoff with full jitter. `roll` is uniform in [0, 1).
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64, roll: f64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(cap_ms);
    // Jitter over [capped/2, capped] keeps a floor so reconnect storms still
    // spread without collapsing to zero delay.
    let low = capped / 2;
    let span = capped - low;
    Duration::from_millis(low + (span as f64 * roll) as u64)
}

/// Run the user-event stream for one account until shutdown. Reconnects
/// forever; individual connection errors are logged, never fatal.
pub async fn run_user_stream(
    account: BrokerAccount,
    tokens: std::sync::Arc<TokenCache>,
    config: EngineConfig,
    out: mpsc::Sender<(String, StreamEvent)>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let url = super::ws_base(account.environment);
    let mut attempt: u32 = 0;

    info!(account_id = %account.id, url, "user-event stream task started");

    loop {
        match connect_once(&account, &tokens, url, &out).await {
            Ok(()) => {
                // Clean close; reset the backoff.
                attempt = 0;
            }
            Err(e) => {
                warn!(account_id = %account.id, error = %e, "user-event stream error");
                attempt = attempt.saturating_add(1);
            }
        }

        let roll: f64 = rand::thread_rng().gen();
        let delay = backoff_delay(
            attempt,
            config.ws_reconnect_base_ms,
            config.ws_reconnect_cap_ms,
            roll,
        );
        debug!(account_id = %account.id, delay_ms = delay.as_millis() as u64, "reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                info!(account_id = %account.id, "user-event stream stopping");
                return;
            }
        }
    }
}

/// One connection lifetime: connect, authorize, heartbeat + read until the
/// stream ends or errors.
async fn connect_once(
    account: &BrokerAccount,
    tokens: &TokenCache,
    url: &str,
    out: &mpsc::Sender<(String, StreamEvent)>,
) -> Result<()> {
    let token = tokens
        .access_token(&account.id)
        .map_err(|e| anyhow::anyhow!("no usable token: {e}"))?;

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect user-event WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    // Newline-framed authorize, first frame on the wire.
    write
        .send(Message::Text(format!("authorize\n{token}")))
        .await
        .context("failed to send authorize frame")?;

    info!(account_id = %account.id, "user-event WebSocket authorized");

    if out
        .send((account.id.clone(), StreamEvent::Connected))
        .await
        .is_err()
    {
        return Ok(()); // consumer gone; treat as clean close
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                write
                    .send(Message::Text("[]".to_string()))
                    .await
                    .context("failed to send heartbeat")?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // A frame may batch several newline-delimited events.
                        for line in text.lines().filter(|l| !l.trim().is_empty()) {
                            if let Some(event) = UserEvent::parse(line) {
                                if out
                                    .send((account.id.clone(), StreamEvent::Event(event)))
                                    .await
                                    .is_err()
                                {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        write.send(Message::Pong(payload)).await.ok();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(account_id = %account.id, "user-event WebSocket closed");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(e).context("user-event WebSocket read error");
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_until_cap() {
        // roll = 1.0 gives the upper edge of the jitter window.
        assert_eq!(backoff_delay(0, 1000, 30000, 0.999).as_millis() as u64 / 100, 9);
        let d1 = backoff_delay(1, 1000, 30000, 0.999);
        let d3 = backoff_delay(3, 1000, 30000, 0.999);
        assert!(d3 > d1);
        // Far attempts are capped at 30 s.
        let capped = backoff_delay(12, 1000, 30000, 0.999);
        assert!(capped.as_millis() <= 30000);
        assert!(capped.as_millis() >= 15000);
    }

    #[test]
    fn backoff_jitter_stays_above_half() {
        for attempt in 0..8 {
            let low = backoff_delay(attempt, 1000, 30000, 0.0);
            let high = backoff_delay(attempt, 1000, 30000, 0.9999);
            assert!(low <= high);
            assert!(low.as_millis() * 2 >= high.as_millis());
        }
    }

    #[test]
    fn backoff_shift_does_not_overflow_on_huge_attempts() {
        let d = backoff_delay(u32::MAX, 1000, 30000, 0.5);
        assert!(d.as_millis() <= 30000);
    }
}
