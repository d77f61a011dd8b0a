// =============================================================================
// Event Bus — in-process pub/sub for engine observers
// =============================================================================
//
// A single `tokio::sync::broadcast` channel carries every engine event;
// subscribers filter by topic. The channel is bounded and lagging receivers
// lose the oldest messages, so a slow subscriber can never stall the trading
// path. Publishing with zero subscribers is fine and simply drops the event.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{ExitReason, OrderRole, Side, Transition};

/// Per-subscriber queue depth. Lagging subscribers drop oldest.
const BUS_CAPACITY: usize = 1024;

// =============================================================================
// Events
// =============================================================================

/// Every observable state change in the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SignalAccepted {
        signal_id: String,
        recorder_id: String,
        ticker: String,
        action: String,
    },
    SignalRejected {
        recorder_id: String,
        ticker: String,
        kind: String,
        reason: String,
    },
    OrderPlaced {
        broker_order_id: i64,
        account_id: String,
        ticker: String,
        role: OrderRole,
        qty: f64,
        price: Option<f64>,
        tag: String,
    },
    OrderModified {
        broker_order_id: i64,
        account_id: String,
        ticker: String,
        role: OrderRole,
        qty: f64,
        price: f64,
    },
    OrderCanceled {
        broker_order_id: i64,
        account_id: String,
        ticker: String,
    },
    OrderRejected {
        account_id: String,
        ticker: String,
        role: OrderRole,
        reason: String,
    },
    PositionOpened {
        recorder_id: String,
        ticker: String,
        side: Side,
        qty: f64,
        avg_price: f64,
    },
    PositionUpdated {
        recorder_id: String,
        ticker: String,
        side: Side,
        qty: f64,
        avg_price: f64,
        transition: Transition,
    },
    PositionClosed {
        recorder_id: String,
        ticker: String,
        exit_price: f64,
        pnl_usd: f64,
        reason: ExitReason,
    },
    ExitTransition {
        trader_id: String,
        ticker: String,
        from: String,
        to: String,
        reason: ExitReason,
    },
    FlattenFailed {
        trader_id: String,
        ticker: String,
        budget_ms: u64,
    },
    ReconcileDrift {
        recorder_id: String,
        ticker: String,
        detail: String,
    },
    ReconcileAction {
        recorder_id: String,
        ticker: String,
        action: String,
    },
    TokenRefreshed {
        account_id: String,
        expires_at: DateTime<Utc>,
    },
    TokenRefreshFailed {
        account_id: String,
        error: String,
    },
}

impl EngineEvent {
    /// Dotted topic string, used by subscribers to filter.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::SignalAccepted { .. } => "signal.accepted",
            Self::SignalRejected { .. } => "signal.rejected",
            Self::OrderPlaced { .. } => "order.placed",
            Self::OrderModified { .. } => "order.modified",
            Self::OrderCanceled { .. } => "order.canceled",
            Self::OrderRejected { .. } => "order.rejected",
            Self::PositionOpened { .. } => "position.opened",
            Self::PositionUpdated { .. } => "position.updated",
            Self::PositionClosed { .. } => "position.closed",
            Self::ExitTransition { .. } => "exit.transition",
            Self::FlattenFailed { .. } => "exit.flatten_failed",
            Self::ReconcileDrift { .. } => "reconcile.drift",
            Self::ReconcileAction { .. } => "reconcile.action",
            Self::TokenRefreshed { .. } => "token.refreshed",
            Self::TokenRefreshFailed { .. } => "token.refresh_failed",
        }
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Cloneable handle to the engine-wide broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A zero-subscriber bus drops the event silently.
    pub fn publish(&self, event: EngineEvent) {
        debug!(topic = event.topic(), "bus publish");
        let _ = self.tx.send(event);
    }

    /// Subscribe to the full event stream. Filter by `EngineEvent::topic`.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Log every event as a structured tracing line. Spawned once at startup so
/// the event stream is always observable even with no external subscribers.
pub async fn run_log_subscriber(bus: EventBus) {
    let mut rx = bus.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                tracing::info!(
                    topic = event.topic(),
                    payload = %serde_json::to_string(&event).unwrap_or_default(),
                    "engine event"
                );
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(dropped = n, "event log subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
