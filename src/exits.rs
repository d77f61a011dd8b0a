// =============================================================================
// Exit State Machine — deterministic flatten protocol with confirmation
// =============================================================================
//
// Per (trader, ticker):
//
//   IDLE -> PREPARE_EXIT  cancel working brackets; place market opposite
//   PREPARE_EXIT -> WORKING_EXIT
//   WORKING_EXIT -> CONFIRM_FLAT on fill; retry place on 5 s timeout
//                   (3 attempts) then KILL
//   CONFIRM_FLAT -> IDLE once the broker reports net zero; KILL after 3 s
//   KILL: bounded-latency force flatten (750 ms budget); stays KILL for the
//         operator when the budget is blown
//
// Exits ALWAYS use market orders. A TP or SL fill means the close already
// happened at the broker, so those triggers cancel the surviving bracket and
// fast-track to CONFIRM_FLAT. Fill-driven triggers are deduped by broker
// order id, which also makes the second event of a simultaneous TP+SL fill
// a no-op.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::broker::client::{BrokerRouter, OrderTicket};
use crate::broker::models::OrderTag;
use crate::bus::{EngineEvent, EventBus};
use crate::config::EngineConfig;
use crate::directory::BrokerAccount;
use crate::error::{EngineError, EngineResult};
use crate::intake::contract_map::tick_spec;
use crate::scheduler::RateGovernor;
use crate::store::{BrokerOrderRow, TradeStore};
use crate::tracker::PositionTracker;
use crate::types::{ExitReason, OrderAction, OrderRole, OrderStatus, PositionKey, Side};

/// Poll cadence while waiting for the exit fill.
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Poll cadence while confirming flat.
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Poll cadence on the kill-switch path.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Exit placement attempts before arming the kill switch.
const MAX_EXIT_ATTEMPTS: u32 = 3;

/// Machine states, reported on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitState {
    Idle,
    PrepareExit,
    WorkingExit,
    ConfirmFlat,
    Kill,
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::PrepareExit => "PREPARE_EXIT",
            Self::WorkingExit => "WORKING_EXIT",
            Self::ConfirmFlat => "CONFIRM_FLAT",
            Self::Kill => "KILL",
        };
        write!(f, "{s}")
    }
}

/// Everything an exit run needs to know about its position.
#[derive(Debug, Clone)]
pub struct ExitContext {
    pub trader_id: String,
    pub account: BrokerAccount,
    pub recorder_id: String,
    pub ticker: String,
    pub side: Side,
    pub qty: f64,
    pub reason: ExitReason,
}

impl ExitContext {
    fn key(&self) -> PositionKey {
        PositionKey::new(self.recorder_id.clone(), self.ticker.clone())
    }

    fn state_key(&self) -> (String, String) {
        (self.trader_id.clone(), self.ticker.clone())
    }
}

pub struct ExitMachine {
    router: Arc<BrokerRouter>,
    governor: Arc<RateGovernor>,
    store: Arc<TradeStore>,
    tracker: Arc<PositionTracker>,
    bus: EventBus,
    config: EngineConfig,
    states: Mutex<HashMap<(String, String), ExitState>>,
    /// Broker order ids whose fill already drove a transition.
    processed_fills: Mutex<HashSet<i64>>,
}

impl ExitMachine {
    pub fn new(
        router: Arc<BrokerRouter>,
        governor: Arc<RateGovernor>,
        store: Arc<TradeStore>,
        tracker: Arc<PositionTracker>,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            router,
            governor,
            store,
            tracker,
            bus,
            config,
            states: Mutex::new(HashMap::new()),
            processed_fills: Mutex::new(HashSet::new()),
        }
    }

    pub fn state(&self, trader_id: &str, ticker: &str) -> ExitState {
        self.states
            .lock()
            .get(&(trader_id.to_string(), ticker.to_string()))
            .copied()
            .unwrap_or(ExitState::Idle)
    }

    fn transition(&self, ctx: &ExitContext, to: ExitState) {
        let from = {
            let mut states = self.states.lock();
            states.insert(ctx.state_key(), to).unwrap_or(ExitState::Idle)
        };
        info!(
            trader_id = %ctx.trader_id,
            ticker = %ctx.ticker,
            %from,
            %to,
            reason = %ctx.reason,
            "exit transition"
        );
        self.bus.publish(EngineEvent::ExitTransition {
            trader_id: ctx.trader_id.clone(),
            ticker: ctx.ticker.clone(),
            from: from.to_string(),
            to: to.to_string(),
            reason: ctx.reason,
        });
    }

    /// Whether this fill order id has already driven a transition. Marks it
    /// processed when fresh.
    pub fn claim_fill(&self, broker_order_id: i64) -> bool {
        self.processed_fills.lock().insert(broker_order_id)
    }

    // -------------------------------------------------------------------------
    // Full exit run (signal-driven and reconciler-driven closes)
    // -------------------------------------------------------------------------

    /// Drive IDLE -> ... -> IDLE for a close that must be executed at the
    /// broker. Must be called from the per-key serialized queue.
    pub async fn run_exit(&self, ctx: &ExitContext) -> EngineResult<()> {
        let client = self.router.client_for(ctx.account.environment);

        // PREPARE_EXIT: cancel brackets, then market out.
        self.transition(ctx, ExitState::PrepareExit);
        self.cancel_working_brackets(ctx).await;

        let close_action = OrderAction::closing(ctx.side);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let seq = self.store.next_seq(&ctx.account.id, &ctx.ticker, OrderRole::Entry);
            let tag = OrderTag::new(
                ctx.account.id.clone(),
                ctx.ticker.clone(),
                ctx.recorder_id.clone(),
                OrderRole::Entry,
                seq,
            );
            // Exits are market orders, always.
            let ticket =
                OrderTicket::market(close_action, ctx.ticker.clone(), ctx.qty, tag.to_string());

            self.governor.acquire(&ctx.account.id).await;
            let order_id = match client.place_order(&ctx.account.id, &ticket).await {
                Ok((id, status)) => {
                    self.record_exit_order(ctx, id, close_action, ctx.qty, &tag, seq, status);
                    id
                }
                Err(e) if attempt < MAX_EXIT_ATTEMPTS && e.is_transient() => {
                    warn!(
                        trader_id = %ctx.trader_id,
                        ticker = %ctx.ticker,
                        attempt,
                        error = %e,
                        "exit placement failed — retrying"
                    );
                    continue;
                }
                Err(e) => {
                    error!(
                        trader_id = %ctx.trader_id,
                        ticker = %ctx.ticker,
                        error = %e,
                        "exit placement failed — arming kill switch"
                    );
                    return self.kill(ctx).await;
                }
            };

            self.transition(ctx, ExitState::WorkingExit);
            if self.await_fill(ctx, order_id).await {
                break;
            }
            if attempt >= MAX_EXIT_ATTEMPTS {
                warn!(
                    trader_id = %ctx.trader_id,
                    ticker = %ctx.ticker,
                    attempts = attempt,
                    "exit never confirmed filled — arming kill switch"
                );
                return self.kill(ctx).await;
            }
            // Cancel the stale attempt before re-placing.
            self.governor.acquire(&ctx.account.id).await;
            let _ = client.cancel_order(&ctx.account.id, order_id).await;
        }

        self.confirm_flat(ctx).await
    }

    /// Fast path for a TP or SL fill: the position is already closed at the
    /// broker, so cancel the surviving bracket and go straight to
    /// confirmation. Must run on the per-key queue.
    pub async fn on_bracket_fill(&self, ctx: &ExitContext) -> EngineResult<()> {
        self.transition(ctx, ExitState::PrepareExit);
        self.cancel_working_brackets(ctx).await;
        self.confirm_flat(ctx).await
    }

    /// Keep a projection of an engine-placed exit order so the user-event
    /// stream and fill polling can see it.
    fn record_exit_order(
        &self,
        ctx: &ExitContext,
        order_id: i64,
        action: OrderAction,
        qty: f64,
        tag: &OrderTag,
        seq: u64,
        status: OrderStatus,
    ) {
        let now = chrono::Utc::now();
        self.store.record_order(BrokerOrderRow {
            id: uuid::Uuid::new_v4().to_string(),
            broker_order_id: order_id,
            account_id: ctx.account.id.clone(),
            ticker: ctx.ticker.clone(),
            role: OrderRole::Entry,
            action,
            qty,
            price: None,
            tag: tag.to_string(),
            seq,
            status,
            placed_at: now,
            updated_at: now,
        });
        self.bus.publish(EngineEvent::OrderPlaced {
            broker_order_id: order_id,
            account_id: ctx.account.id.clone(),
            ticker: ctx.ticker.clone(),
            role: OrderRole::Entry,
            qty,
            price: None,
            tag: tag.to_string(),
        });
    }

    // -------------------------------------------------------------------------
    // Stages
    // -------------------------------------------------------------------------

    /// Cancel every bracket the engine still believes is working.
    async fn cancel_working_brackets(&self, ctx: &ExitContext) {
        let client = self.router.client_for(ctx.account.environment);
        let working: Vec<BrokerOrderRow> = self
            .store
            .working_orders(&ctx.account.id, &ctx.ticker)
            .into_iter()
            .filter(|o| matches!(o.role, OrderRole::Tp | OrderRole::Sl))
            .collect();

        for order in working {
            self.governor.acquire(&ctx.account.id).await;
            match client.cancel_order(&ctx.account.id, order.broker_order_id).await {
                Ok(()) => {
                    self.store
                        .update_order(order.broker_order_id, OrderStatus::Canceled, None, None);
                    self.bus.publish(EngineEvent::OrderCanceled {
                        broker_order_id: order.broker_order_id,
                        account_id: ctx.account.id.clone(),
                        ticker: ctx.ticker.clone(),
                    });
                }
                Err(e) => {
                    // Already terminal at the broker is fine; anything else
                    // the reconciler will find.
                    warn!(
                        broker_order_id = order.broker_order_id,
                        error = %e,
                        "bracket cancel failed"
                    );
                }
            }
        }
    }

    /// Wait for the exit order to fill, bounded by the configured timeout.
    /// The projection row is updated by the user-event stream; polling the
    /// broker covers stream gaps.
    async fn await_fill(&self, ctx: &ExitContext, order_id: i64) -> bool {
        let client = self.router.client_for(ctx.account.environment);
        let deadline = Instant::now() + Duration::from_millis(self.config.exit_fill_timeout_ms);

        loop {
            if let Some(row) = self.store.order_by_broker_id(order_id) {
                if row.status == OrderStatus::Filled {
                    return true;
                }
            }

            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(FILL_POLL_INTERVAL).await;

            self.governor.acquire(&ctx.account.id).await;
            if let Ok(view) = client.get_order(&ctx.account.id, order_id).await {
                let status = view.status();
                self.store.update_order(order_id, status, None, None);
                if status == OrderStatus::Filled {
                    return true;
                }
            }
        }
    }

    /// CONFIRM_FLAT: the broker must report net zero within the timeout.
    async fn confirm_flat(&self, ctx: &ExitContext) -> EngineResult<()> {
        self.transition(ctx, ExitState::ConfirmFlat);
        let client = self.router.client_for(ctx.account.environment);
        let deadline =
            Instant::now() + Duration::from_millis(self.config.exit_confirm_timeout_ms);

        loop {
            self.governor.acquire(&ctx.account.id).await;
            match client.list_positions(&ctx.account.id).await {
                Ok(positions) => {
                    let net = positions
                        .iter()
                        .find(|p| p.symbol == ctx.ticker)
                        .map(|p| p.net_pos)
                        .unwrap_or(0.0);
                    if net == 0.0 {
                        self.finalize_flat(ctx);
                        self.transition(ctx, ExitState::Idle);
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "position query failed during confirm"),
            }

            if Instant::now() >= deadline {
                warn!(
                    trader_id = %ctx.trader_id,
                    ticker = %ctx.ticker,
                    "broker not flat within confirm window — arming kill switch"
                );
                return self.kill(ctx).await;
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
        }
    }

    /// Close the virtual position and publish once the broker is flat.
    fn finalize_flat(&self, ctx: &ExitContext) {
        let key = ctx.key();
        let tick = tick_spec(&ctx.ticker);
        match self.tracker.close(&key, None, ctx.reason, tick) {
            Ok(Some(trade)) => {
                self.store
                    .close_position(&ctx.recorder_id, &ctx.ticker, trade.exit_price, ctx.reason);
                self.store.record_trade((&trade).into());
                self.bus.publish(EngineEvent::PositionClosed {
                    recorder_id: ctx.recorder_id.clone(),
                    ticker: ctx.ticker.clone(),
                    exit_price: trade.exit_price,
                    pnl_usd: trade.pnl_usd,
                    reason: ctx.reason,
                });
            }
            Ok(None) => {
                // Virtual was already flat (e.g. CLOSE after flat); nothing
                // to realize.
            }
            Err(e) => error!(error = %e, "failed to close virtual position"),
        }
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    /// Bounded-latency force flatten. Cancels everything and markets out,
    /// then polls the broker inside the budget. Emits `FlattenFailed`
    /// exactly once when the budget is blown and stays in KILL.
    pub async fn kill(&self, ctx: &ExitContext) -> EngineResult<()> {
        self.transition(ctx, ExitState::Kill);
        let client = self.router.client_for(ctx.account.environment);
        let budget = Duration::from_millis(self.config.kill_switch_budget_ms);
        let deadline = Instant::now() + budget;

        // Cancel every working order for the symbol, in parallel.
        let to_cancel: Vec<i64> = match client.list_orders(&ctx.account.id).await {
            Ok(orders) => orders
                .iter()
                .filter(|o| o.symbol == ctx.ticker && o.status().is_working())
                .map(|o| o.id)
                .collect(),
            Err(e) => {
                warn!(error = %e, "order listing failed during kill — using projections");
                self.store
                    .working_orders(&ctx.account.id, &ctx.ticker)
                    .iter()
                    .map(|o| o.broker_order_id)
                    .collect()
            }
        };
        join_all(
            to_cancel
                .iter()
                .map(|id| client.cancel_order(&ctx.account.id, *id)),
        )
        .await;

        // Market out the remainder, if any.
        let net = match client.list_positions(&ctx.account.id).await {
            Ok(positions) => positions
                .iter()
                .find(|p| p.symbol == ctx.ticker)
                .map(|p| p.net_pos)
                .unwrap_or(0.0),
            Err(_) => match ctx.side {
                Side::Long => ctx.qty,
                Side::Short => -ctx.qty,
                Side::Flat => 0.0,
            },
        };
        if net != 0.0 {
            let action = if net > 0.0 {
                OrderAction::Sell
            } else {
                OrderAction::Buy
            };
            let seq = self.store.next_seq(&ctx.account.id, &ctx.ticker, OrderRole::Entry);
            let tag = OrderTag::new(
                ctx.account.id.clone(),
                ctx.ticker.clone(),
                ctx.recorder_id.clone(),
                OrderRole::Entry,
                seq,
            );
            let ticket =
                OrderTicket::market(action, ctx.ticker.clone(), net.abs(), tag.to_string());
            match client.place_order(&ctx.account.id, &ticket).await {
                Ok((id, status)) => {
                    self.record_exit_order(ctx, id, action, net.abs(), &tag, seq, status);
                }
                Err(e) => error!(error = %e, "kill-switch market close failed"),
            }
        }

        // Poll the broker inside the budget.
        loop {
            if let Ok(positions) = client.list_positions(&ctx.account.id).await {
                let net = positions
                    .iter()
                    .find(|p| p.symbol == ctx.ticker)
                    .map(|p| p.net_pos)
                    .unwrap_or(0.0);
                if net == 0.0 {
                    info!(
                        trader_id = %ctx.trader_id,
                        ticker = %ctx.ticker,
                        "kill switch confirmed flat"
                    );
                    self.finalize_flat(ctx);
                    self.transition(ctx, ExitState::Idle);
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(KILL_POLL_INTERVAL).await;
        }

        // Budget blown: alert exactly once and hold KILL for the operator.
        error!(
            trader_id = %ctx.trader_id,
            ticker = %ctx.ticker,
            budget_ms = self.config.kill_switch_budget_ms,
            "FLATTEN FAILED — operator intervention required"
        );
        self.bus.publish(EngineEvent::FlattenFailed {
            trader_id: ctx.trader_id.clone(),
            ticker: ctx.ticker.clone(),
            budget_ms: self.config.kill_switch_budget_ms,
        });
        Err(EngineError::FlattenFailed {
            key: format!("{}/{}", ctx.trader_id, ctx.ticker),
            budget_ms: self.config.kill_switch_budget_ms,
        })
    }
}

impl std::fmt::Debug for ExitMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitMachine")
            .field("tracked_states", &self.states.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::token::TokenCache;
    use crate::directory::{FileDirectory, LastPriceCache};
    use crate::types::Environment;
    use uuid::Uuid;

    fn machine() -> ExitMachine {
        let directory = Arc::new(FileDirectory::empty("unused.json"));
        let bus = EventBus::new();
        let tokens = Arc::new(TokenCache::new(directory, bus.clone()));
        let router = Arc::new(BrokerRouter::new(tokens));
        let store_path =
            std::env::temp_dir().join(format!("jettrade-exit-{}.json", Uuid::new_v4()));
        let store = Arc::new(TradeStore::open(store_path).unwrap());
        let tracker = Arc::new(PositionTracker::new(Arc::new(LastPriceCache::new())));
        ExitMachine::new(
            router,
            Arc::new(RateGovernor::new(70, 10)),
            store,
            tracker,
            bus,
            EngineConfig::default(),
        )
    }

    fn ctx(reason: ExitReason) -> ExitContext {
        ExitContext {
            trader_id: "t-1".into(),
            account: BrokerAccount {
                id: "a-1".into(),
                environment: Environment::Demo,
                client_id: "cid".into(),
                client_secret: "sec".into(),
                refresh_token: "ref".into(),
                access_token: None,
                token_expires_at: None,
            },
            recorder_id: "r-1".into(),
            ticker: "MNQU5".into(),
            side: Side::Long,
            qty: 1.0,
            reason,
        }
    }

    #[test]
    fn unknown_key_is_idle() {
        let m = machine();
        assert_eq!(m.state("t-1", "MNQU5"), ExitState::Idle);
    }

    #[test]
    fn transitions_are_tracked_and_published() {
        let m = machine();
        let mut rx = m.bus.subscribe();
        let c = ctx(ExitReason::CloseSignal);

        m.transition(&c, ExitState::PrepareExit);
        assert_eq!(m.state("t-1", "MNQU5"), ExitState::PrepareExit);

        m.transition(&c, ExitState::WorkingExit);
        assert_eq!(m.state("t-1", "MNQU5"), ExitState::WorkingExit);

        let first = rx.try_recv().unwrap();
        match first {
            EngineEvent::ExitTransition { from, to, .. } => {
                assert_eq!(from, "IDLE");
                assert_eq!(to, "PREPARE_EXIT");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn fill_claims_are_at_most_once() {
        let m = machine();
        assert!(m.claim_fill(42));
        assert!(!m.claim_fill(42));
        assert!(m.claim_fill(43));
    }

    #[test]
    fn finalize_flat_realizes_open_virtual_position() {
        let m = machine();
        let key = PositionKey::new("r-1", "MNQU5");
        m.tracker
            .apply_signal(
                &key,
                crate::types::SignalAction::Buy,
                Some(25600.0),
                1.0,
                tick_spec("MNQU5"),
            )
            .unwrap();

        let mut rx = m.bus.subscribe();
        m.finalize_flat(&ctx(ExitReason::ManualBrokerClose));

        assert!(m.tracker.get(&key).is_none());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic(), "position.closed");
    }

    #[test]
    fn finalize_flat_on_flat_virtual_is_noop() {
        let m = machine();
        let mut rx = m.bus.subscribe();
        m.finalize_flat(&ctx(ExitReason::CloseSignal));
        assert!(rx.try_recv().is_err());
    }
}
