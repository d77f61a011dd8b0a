// =============================================================================
// Signal Intake — webhook parsing, normalization, dedupe, handoff
// =============================================================================
//
// The webhook handler must answer fast: parse, gate, dedupe, persist, enqueue,
// 200. Everything that can take real time (broker calls) happens downstream
// in the execution pipeline, and downstream failures never change the 200 —
// they show up on the event stream instead.
// =============================================================================

pub mod contract_map;
pub mod dedupe;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::client::BrokerRouter;
use crate::bus::{EngineEvent, EventBus};
use crate::directory::{Directory, Recorder};
use crate::error::{EngineError, EngineResult};
use crate::intake::contract_map::ContractMap;
use crate::intake::dedupe::DedupeIndex;
use crate::risk_gate::RiskGate;
use crate::store::{SignalRow, TradeStore};
use crate::types::SignalAction;

// =============================================================================
// Payload
// =============================================================================

/// The webhook body as chart services send it. Only `ticker` is strictly
/// required; the action is either literal or derived from the
/// market-position transition.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub ticker: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub market_position: Option<String>,
    #[serde(default)]
    pub position_size: Option<f64>,
    #[serde(default)]
    pub prev_position_size: Option<f64>,
    #[serde(default)]
    pub strategy_name: Option<String>,
}

/// Derive the canonical action from a payload.
///
/// Order of precedence: a literal `action` field wins; otherwise the
/// market-position transition is interpreted; anything else is unparseable.
pub fn derive_action(payload: &WebhookPayload) -> EngineResult<SignalAction> {
    if let Some(action) = payload.action.as_deref() {
        return match action.to_ascii_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "close" => Ok(SignalAction::Close),
            other => Err(EngineError::UnparseableSignal(format!(
                "unknown action '{other}'"
            ))),
        };
    }

    let Some(market_position) = payload.market_position.as_deref() else {
        return Err(EngineError::UnparseableSignal(
            "neither action nor market_position present".into(),
        ));
    };
    let prev = payload.prev_position_size.unwrap_or(0.0);

    match market_position.to_ascii_lowercase().as_str() {
        "flat" if prev != 0.0 => Ok(SignalAction::Close),
        "flat" => Err(EngineError::UnparseableSignal(
            "flat -> flat transition carries no action".into(),
        )),
        // Entering or flipping into the side. Same-side size increases keep
        // the same action and fall through to the DCA path downstream.
        "long" if prev <= 0.0 => Ok(SignalAction::Buy),
        "short" if prev >= 0.0 => Ok(SignalAction::Sell),
        other => Err(EngineError::UnparseableSignal(format!(
            "unsupported market_position transition '{other}' from {prev}"
        ))),
    }
}

/// Quantity hint from the payload: an explicit `quantity`, else the size
/// delta implied by the market-position fields.
pub fn derive_qty(payload: &WebhookPayload) -> Option<f64> {
    if let Some(q) = payload.quantity.filter(|q| *q > 0.0) {
        return Some(q);
    }
    match (payload.position_size, payload.prev_position_size) {
        (Some(now), Some(prev)) => {
            let delta = (now - prev).abs();
            (delta > 0.0).then_some(delta)
        }
        _ => None,
    }
}

// =============================================================================
// Accepted signal handoff
// =============================================================================

/// A parsed, gated, deduped signal on its way to the execution pipeline.
#[derive(Debug, Clone)]
pub struct AcceptedSignal {
    pub signal_id: String,
    pub recorder: Recorder,
    /// Broker-format contract name.
    pub ticker: String,
    pub action: SignalAction,
    pub price: Option<f64>,
    pub qty: f64,
    pub received_at: DateTime<Utc>,
}

/// What the HTTP layer should answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookReply {
    /// 200 {status: "accepted", signal_id}
    Accepted { signal_id: String },
    /// 200 {status: "duplicate"}
    Duplicate,
    /// 200 {status: "rejected", reason} — parsed fine, gate dropped it.
    Rejected { kind: String, reason: String },
    /// 400 — the webhook token matches no recorder.
    InvalidToken,
    /// 400 — body could not be parsed into a signal.
    Unparseable { reason: String },
}

// =============================================================================
// Intake
// =============================================================================

pub struct SignalIntake {
    directory: Arc<dyn Directory>,
    store: Arc<TradeStore>,
    gate: Arc<RiskGate>,
    dedupe: DedupeIndex,
    contracts: ContractMap,
    router: Arc<BrokerRouter>,
    bus: EventBus,
    pipeline_tx: mpsc::Sender<AcceptedSignal>,
}

impl SignalIntake {
    pub fn new(
        directory: Arc<dyn Directory>,
        store: Arc<TradeStore>,
        gate: Arc<RiskGate>,
        router: Arc<BrokerRouter>,
        bus: EventBus,
        pipeline_tx: mpsc::Sender<AcceptedSignal>,
    ) -> Self {
        Self {
            directory,
            store,
            gate,
            dedupe: DedupeIndex::new(),
            contracts: ContractMap::new(),
            router,
            bus,
            pipeline_tx,
        }
    }

    /// Handle one webhook delivery end to end. Always returns promptly; no
    /// broker calls happen on this path beyond the cached contract lookup.
    pub async fn handle_webhook(&self, webhook_token: &str, body: &str) -> WebhookReply {
        let received_at = Utc::now();

        let Some(recorder) = self.directory.recorder_by_webhook_token(webhook_token) else {
            warn!("webhook with unknown token");
            return WebhookReply::InvalidToken;
        };

        let payload: WebhookPayload = match serde_json::from_str(body) {
            Ok(p) => p,
            Err(e) => {
                return WebhookReply::Unparseable {
                    reason: format!("invalid JSON: {e}"),
                };
            }
        };

        let action = match derive_action(&payload) {
            Ok(a) => a,
            Err(e) => {
                return WebhookReply::Unparseable {
                    reason: e.to_string(),
                };
            }
        };

        let ticker = match self.resolve_ticker(&recorder, &payload.ticker).await {
            Ok(t) => t,
            Err(e) => {
                return WebhookReply::Unparseable {
                    reason: e.to_string(),
                };
            }
        };

        // A zero price from the chart means "omitted".
        let price = payload.price.filter(|p| *p > 0.0);
        let qty_hint = derive_qty(&payload);

        // Dedupe before anything is persisted so a retry makes exactly one row.
        let fp = dedupe::fingerprint(&recorder.id, &ticker, action, received_at, body);
        if self.dedupe.is_duplicate(&recorder.id, &fp, received_at) {
            info!(recorder_id = %recorder.id, %ticker, "duplicate webhook dropped");
            return WebhookReply::Duplicate;
        }

        if !recorder.enabled {
            self.record_rejected(
                &recorder, &ticker, action, qty_hint, price, body, &fp, received_at,
                "recorder_disabled", "recorder is disabled",
            );
            return WebhookReply::Rejected {
                kind: "recorder_disabled".into(),
                reason: "recorder is disabled".into(),
            };
        }

        // Risk gate, in filter-chain order.
        let pass = match self
            .gate
            .evaluate(&recorder, &ticker, action, qty_hint, received_at)
        {
            Ok(pass) => pass,
            Err(e) => {
                let kind = e.kind().to_string();
                let reason = e.to_string();
                self.record_rejected(
                    &recorder, &ticker, action, qty_hint, price, body, &fp, received_at,
                    e.kind(), &reason,
                );
                return WebhookReply::Rejected { kind, reason };
            }
        };

        // Persist the accepted row, publish, enqueue.
        let signal_id = Uuid::new_v4().to_string();
        self.store.record_signal(SignalRow {
            id: signal_id.clone(),
            recorder_id: recorder.id.clone(),
            received_at,
            ticker: ticker.clone(),
            action,
            qty: pass.qty,
            price,
            raw_payload: body.to_string(),
            fingerprint: fp,
            accepted: true,
            reject_reason: None,
        });
        self.bus.publish(EngineEvent::SignalAccepted {
            signal_id: signal_id.clone(),
            recorder_id: recorder.id.clone(),
            ticker: ticker.clone(),
            action: action.to_string(),
        });

        let accepted = AcceptedSignal {
            signal_id: signal_id.clone(),
            recorder,
            ticker,
            action,
            price,
            qty: pass.qty,
            received_at,
        };
        if let Err(e) = self.pipeline_tx.try_send(accepted) {
            // The pipeline queue is saturated or gone; the row and event
            // already exist, so operators can see the drop.
            warn!(error = %e, "failed to enqueue accepted signal");
        }

        WebhookReply::Accepted { signal_id }
    }

    /// Normalize an alert-format ticker using the first routable account for
    /// the dynamic lookup, the static map otherwise.
    async fn resolve_ticker(&self, recorder: &Recorder, ticker: &str) -> EngineResult<String> {
        let lookup_account = self
            .directory
            .traders_for_recorder(&recorder.id)
            .into_iter()
            .filter(|t| t.enabled)
            .find_map(|t| self.directory.account(&t.account_id));

        match lookup_account {
            Some(account) => {
                let client = self.router.client_for(account.environment);
                self.contracts
                    .resolve(ticker, Some((client, &account.id)))
                    .await
            }
            None => self.contracts.resolve(ticker, None).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_rejected(
        &self,
        recorder: &Recorder,
        ticker: &str,
        action: SignalAction,
        qty: Option<f64>,
        price: Option<f64>,
        body: &str,
        fp: &str,
        received_at: DateTime<Utc>,
        kind: &str,
        reason: &str,
    ) {
        self.store.record_signal(SignalRow {
            id: Uuid::new_v4().to_string(),
            recorder_id: recorder.id.clone(),
            received_at,
            ticker: ticker.to_string(),
            action,
            qty: qty.unwrap_or(recorder.base_qty),
            price,
            raw_payload: body.to_string(),
            fingerprint: fp.to_string(),
            accepted: false,
            reject_reason: Some(reason.to_string()),
        });
        self.bus.publish(EngineEvent::SignalRejected {
            recorder_id: recorder.id.clone(),
            ticker: ticker.to_string(),
            kind: kind.to_string(),
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for SignalIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalIntake").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::token::TokenCache;
    use crate::directory::{FileDirectory, FilterConfig};

    fn payload(json: &str) -> WebhookPayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn literal_actions_win() {
        assert_eq!(
            derive_action(&payload(r#"{"ticker":"MNQ1!","action":"buy"}"#)).unwrap(),
            SignalAction::Buy
        );
        assert_eq!(
            derive_action(&payload(r#"{"ticker":"MNQ1!","action":"SELL"}"#)).unwrap(),
            SignalAction::Sell
        );
        assert_eq!(
            derive_action(&payload(r#"{"ticker":"MNQ1!","action":"close"}"#)).unwrap(),
            SignalAction::Close
        );
    }

    #[test]
    fn market_position_flat_with_prev_is_close() {
        let p = payload(
            r#"{"ticker":"MNQ1!","market_position":"flat","prev_position_size":2,"position_size":0}"#,
        );
        assert_eq!(derive_action(&p).unwrap(), SignalAction::Close);
    }

    #[test]
    fn market_position_transitions_to_sides() {
        let long = payload(
            r#"{"ticker":"MNQ1!","market_position":"long","prev_position_size":0,"position_size":1}"#,
        );
        assert_eq!(derive_action(&long).unwrap(), SignalAction::Buy);

        // Flip from long into short is a SELL.
        let flip = payload(
            r#"{"ticker":"MNQ1!","market_position":"short","prev_position_size":2,"position_size":-1}"#,
        );
        assert_eq!(derive_action(&flip).unwrap(), SignalAction::Sell);
    }

    #[test]
    fn unparseable_payloads_are_rejected() {
        assert!(derive_action(&payload(r#"{"ticker":"MNQ1!"}"#)).is_err());
        assert!(derive_action(&payload(r#"{"ticker":"MNQ1!","action":"hold"}"#)).is_err());
        let flat_flat = payload(
            r#"{"ticker":"MNQ1!","market_position":"flat","prev_position_size":0}"#,
        );
        assert!(derive_action(&flat_flat).is_err());
    }

    #[test]
    fn qty_prefers_explicit_quantity() {
        let p = payload(
            r#"{"ticker":"MNQ1!","quantity":3,"position_size":5,"prev_position_size":0}"#,
        );
        assert_eq!(derive_qty(&p), Some(3.0));

        let delta = payload(
            r#"{"ticker":"MNQ1!","position_size":-1,"prev_position_size":2}"#,
        );
        assert_eq!(derive_qty(&delta), Some(3.0));

        assert_eq!(derive_qty(&payload(r#"{"ticker":"MNQ1!"}"#)), None);
    }

    // -------------------------------------------------------------------------
    // End-to-end intake
    // -------------------------------------------------------------------------

    fn intake_fixture() -> (SignalIntake, mpsc::Receiver<AcceptedSignal>, Arc<TradeStore>) {
        let directory = Arc::new(FileDirectory::empty("unused.json"));
        directory.insert_recorder(Recorder {
            id: "r-1".into(),
            webhook_token: "good-token".into(),
            symbol: "MNQ1!".into(),
            base_qty: 1.0,
            add_qty: 1.0,
            tp_ticks: 10,
            sl_ticks: 20,
            sl_enabled: false,
            enabled: true,
            private: false,
            filters: FilterConfig::default(),
        });

        directory.insert_recorder(Recorder {
            id: "r-2".into(),
            webhook_token: "short-only-token".into(),
            symbol: "MNQ1!".into(),
            base_qty: 1.0,
            add_qty: 1.0,
            tp_ticks: 10,
            sl_ticks: 20,
            sl_enabled: false,
            enabled: true,
            private: false,
            filters: FilterConfig {
                allow_long: false,
                ..Default::default()
            },
        });

        let store_path =
            std::env::temp_dir().join(format!("jettrade-intake-{}.json", Uuid::new_v4()));
        let store = Arc::new(TradeStore::open(store_path).unwrap());
        let gate = Arc::new(RiskGate::new(
            store.clone(),
            chrono_tz::America::Chicago,
            17,
        ));
        let bus = EventBus::new();
        let tokens = Arc::new(TokenCache::new(directory.clone(), bus.clone()));
        let router = Arc::new(BrokerRouter::new(tokens));
        let (tx, rx) = mpsc::channel(16);

        let intake = SignalIntake::new(directory, store.clone(), gate, router, bus, tx);
        (intake, rx, store)
    }

    #[tokio::test]
    async fn accepted_webhook_persists_and_enqueues() {
        let (intake, mut rx, store) = intake_fixture();
        let body = r#"{"ticker":"MNQ1!","action":"buy","price":25600}"#;

        let reply = intake.handle_webhook("good-token", body).await;
        let WebhookReply::Accepted { signal_id } = reply else {
            panic!("expected accepted, got {reply:?}");
        };

        let accepted = rx.recv().await.unwrap();
        assert_eq!(accepted.signal_id, signal_id);
        assert_eq!(accepted.action, SignalAction::Buy);
        assert_eq!(accepted.price, Some(25600.0));
        assert!(accepted.ticker.starts_with("MNQ"));
        assert_eq!(store.accepted_total("r-1"), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_makes_one_row() {
        let (intake, _rx, store) = intake_fixture();
        let body = r#"{"ticker":"MNQ1!","action":"buy","price":25600}"#;

        let before = Utc::now();
        let first = intake.handle_webhook("good-token", body).await;
        let second = intake.handle_webhook("good-token", body).await;
        let after = Utc::now();
        assert!(matches!(first, WebhookReply::Accepted { .. }));

        // The fingerprint truncates received-at to the second; only assert
        // the dedupe when both deliveries landed in the same second.
        if before.timestamp() == after.timestamp() {
            assert_eq!(second, WebhookReply::Duplicate);
            assert_eq!(store.accepted_total("r-1"), 1);
        }
    }

    #[tokio::test]
    async fn invalid_token_is_rejected_without_rows() {
        let (intake, _rx, store) = intake_fixture();
        let reply = intake
            .handle_webhook("bad-token", r#"{"ticker":"MNQ1!","action":"buy"}"#)
            .await;
        assert_eq!(reply, WebhookReply::InvalidToken);
        assert_eq!(store.accepted_total("r-1"), 0);
    }

    #[tokio::test]
    async fn gate_rejection_records_reason() {
        let (intake, mut rx, store) = intake_fixture();
        let reply = intake
            .handle_webhook(
                "short-only-token",
                r#"{"ticker":"MNQ1!","action":"buy","price":25600}"#,
            )
            .await;
        match reply {
            WebhookReply::Rejected { kind, .. } => assert_eq!(kind, "filter_blocked"),
            other => panic!("expected rejected, got {other:?}"),
        }
        // A rejected row is persisted, nothing reaches the pipeline.
        assert_eq!(store.accepted_total("r-2"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unparseable_body_is_a_400_without_rows() {
        let (intake, _rx, store) = intake_fixture();
        let reply = intake
            .handle_webhook("good-token", r#"{"ticker":"MNQ1!","action":"hold"}"#)
            .await;
        assert!(matches!(reply, WebhookReply::Unparseable { .. }));
        assert_eq!(store.accepted_total("r-1"), 0);
    }
}
