// =============================================================================
// Execution Pipeline — accepted signals become broker orders with brackets
// =============================================================================
//
// Order of operations is fixed: the virtual position is updated BEFORE any
// broker call (the engine is signal-authoritative), then the market ENTRY,
// then the brackets. The single-TP invariant is enforced by modifying the
// known TP in place while it is WORKING; a fresh TP is only placed after the
// old one is terminal, and any other working TP found on the account for the
// symbol is cancelled first. DCA therefore never stacks TPs.
//
// Per-trader broker work fans out in batches (default 25 accounts / 500 ms)
// and every request passes the per-account governor. All of it runs inside
// the per-(recorder, ticker) queue, so signals for one key never interleave.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::broker::client::{BrokerClient, BrokerRouter, OrderTicket};
use crate::broker::models::OrderTag;
use crate::broker::ws::StreamEvent;
use crate::bus::{EngineEvent, EventBus};
use crate::config::EngineConfig;
use crate::broker::models::UserEvent;
use crate::broker::token::TokenCache;
use crate::directory::{
    BrokerAccount, Directory, LastPriceCache, MarketData, TradeParams, Trader,
};
use crate::error::EngineError;
use crate::exits::{ExitContext, ExitMachine};
use crate::intake::contract_map::tick_spec;
use crate::intake::AcceptedSignal;
use crate::scheduler::{fan_out_batched, KeyedSerializer, RateGovernor};
use crate::store::{BrokerOrderRow, TradeStore};
use crate::tracker::{ApplyOutcome, PositionTracker, VirtualPosition};
use crate::types::{
    ExitReason, OrderAction, OrderRole, OrderStatus, PositionKey, Side, SignalAction, TickSpec,
    Transition,
};

/// Delay before retrying a TP skipped by the marketability guard.
const TP_RETRY_DELAY: Duration = Duration::from_secs(2);

// =============================================================================
// Pure planning helpers
// =============================================================================

/// Desired bracket prices for a position: TP on the profitable side of the
/// average entry, SL on the losing side.
pub fn bracket_prices(
    side: Side,
    avg_price: f64,
    tp_ticks: u32,
    sl_ticks: u32,
    tick: TickSpec,
) -> (f64, f64) {
    let tp_offset = tp_ticks as f64 * tick.tick_size;
    let sl_offset = sl_ticks as f64 * tick.tick_size;
    match side {
        Side::Long => (avg_price + tp_offset, avg_price - sl_offset),
        Side::Short => (avg_price - tp_offset, avg_price + sl_offset),
        Side::Flat => (avg_price, avg_price),
    }
}

/// Marketability guard: a TP limit must sit at least one tick beyond the
/// current market in the profitable direction, otherwise it would fill the
/// instant it is placed.
pub fn tp_is_marketable(side: Side, tp_price: f64, market_price: f64, tick: TickSpec) -> bool {
    match side {
        Side::Long => tp_price >= market_price + tick.tick_size,
        Side::Short => tp_price <= market_price - tick.tick_size,
        Side::Flat => false,
    }
}

/// Per-trader order quantity: a pinned override wins over the signal's size.
pub fn effective_entry_qty(transition: Transition, signal_qty: f64, trader: &Trader, params: &TradeParams) -> f64 {
    match transition {
        Transition::Opened | Transition::Flipped => {
            if trader.overrides.base_qty.is_some() {
                params.base_qty
            } else {
                signal_qty
            }
        }
        Transition::Dca => {
            if trader.overrides.add_qty.is_some() {
                params.add_qty
            } else {
                signal_qty
            }
        }
        _ => signal_qty,
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct ExecutionPipeline {
    directory: Arc<dyn Directory>,
    tracker: Arc<PositionTracker>,
    store: Arc<TradeStore>,
    router: Arc<BrokerRouter>,
    tokens: Arc<TokenCache>,
    governor: Arc<RateGovernor>,
    serializer: Arc<KeyedSerializer>,
    exits: Arc<ExitMachine>,
    market: Arc<LastPriceCache>,
    bus: EventBus,
    config: EngineConfig,
}

impl ExecutionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn Directory>,
        tracker: Arc<PositionTracker>,
        store: Arc<TradeStore>,
        router: Arc<BrokerRouter>,
        tokens: Arc<TokenCache>,
        governor: Arc<RateGovernor>,
        serializer: Arc<KeyedSerializer>,
        exits: Arc<ExitMachine>,
        market: Arc<LastPriceCache>,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            directory,
            tracker,
            store,
            router,
            tokens,
            governor,
            serializer,
            exits,
            market,
            bus,
            config,
        }
    }

    /// Consume accepted signals until shutdown, dispatching each onto its
    /// per-key queue.
    pub async fn run(
        self: Arc<Self>,
        mut rx: tokio::sync::mpsc::Receiver<AcceptedSignal>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        info!("execution pipeline started");
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(signal) => self.clone().dispatch(signal),
                        None => return,
                    }
                }
                _ = shutdown.recv() => {
                    info!("execution pipeline stopping");
                    return;
                }
            }
        }
    }

    /// Queue a signal's full processing on its (recorder, ticker) key.
    pub fn dispatch(self: Arc<Self>, signal: AcceptedSignal) {
        let key = PositionKey::new(signal.recorder.id.clone(), signal.ticker.clone());
        let serializer = self.serializer.clone();
        serializer.submit(key, async move { self.process_signal(signal).await });
    }

    // -------------------------------------------------------------------------
    // Per-signal processing (runs on the per-key queue)
    // -------------------------------------------------------------------------

    async fn process_signal(self: Arc<Self>, signal: AcceptedSignal) {
        let key = PositionKey::new(signal.recorder.id.clone(), signal.ticker.clone());
        let tick = tick_spec(&signal.ticker);

        // 1. Virtual position first. The broker sees nothing until this holds.
        let outcome = match self.tracker.apply_signal(
            &key,
            signal.action,
            signal.price,
            signal.qty,
            tick,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(key = %key, error = %e, "signal dropped before broker");
                self.bus.publish(EngineEvent::SignalRejected {
                    recorder_id: signal.recorder.id.clone(),
                    ticker: signal.ticker.clone(),
                    kind: e.kind().to_string(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        self.mirror_position(&key, &outcome, signal.action);

        // 2. Fan the broker work out over the recorder's traders.
        let traders: Vec<Trader> = self
            .directory
            .traders_for_recorder(&signal.recorder.id)
            .into_iter()
            .filter(|t| t.enabled)
            .filter(|t| {
                if self.tokens.needs_reauth(&t.account_id) {
                    warn!(
                        trader_id = %t.id,
                        account_id = %t.account_id,
                        "skipping trader — account needs re-authentication"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();

        if traders.is_empty() {
            debug!(key = %key, "no routable traders for signal");
            return;
        }

        let mut handles = Vec::with_capacity(traders.len());
        let batch_delay = Duration::from_millis(self.config.batch_delay_ms);
        let signal = Arc::new(signal);
        let outcome = Arc::new(outcome);

        fan_out_batched(traders, self.config.batch_size, batch_delay, |trader| {
            let this = self.clone();
            let signal = signal.clone();
            let outcome = outcome.clone();
            handles.push(tokio::spawn(async move {
                this.trade_for(&trader, &signal, &outcome).await;
            }));
        })
        .await;

        join_all(handles).await;
    }

    /// Keep the store's open-position mirror and events in sync with one
    /// tracker outcome.
    fn mirror_position(&self, key: &PositionKey, outcome: &ApplyOutcome, action: SignalAction) {
        if let Some(trade) = &outcome.closed {
            self.store.record_trade(trade.into());
            if outcome.position_after.is_none() {
                self.store
                    .close_position(&key.recorder_id, &key.ticker, trade.exit_price, trade.reason);
            }
        }

        match (&outcome.position_after, outcome.transition) {
            (Some(pos), Transition::Opened) => {
                self.store.upsert_open_position(pos);
                self.bus.publish(EngineEvent::PositionOpened {
                    recorder_id: pos.recorder_id.clone(),
                    ticker: pos.ticker.clone(),
                    side: pos.side,
                    qty: pos.total_qty,
                    avg_price: pos.avg_price,
                });
            }
            (Some(pos), transition) => {
                self.store.upsert_open_position(pos);
                self.bus.publish(EngineEvent::PositionUpdated {
                    recorder_id: pos.recorder_id.clone(),
                    ticker: pos.ticker.clone(),
                    side: pos.side,
                    qty: pos.total_qty,
                    avg_price: pos.avg_price,
                    transition,
                });
            }
            (None, _) => {
                // Close with nothing realized: CLOSE on an already-flat key.
                if outcome.closed.is_none() && action == SignalAction::Close {
                    debug!(key = %key, "close on flat — nothing to do");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Per-trader broker work
    // -------------------------------------------------------------------------

    async fn trade_for(
        &self,
        trader: &Trader,
        signal: &AcceptedSignal,
        outcome: &ApplyOutcome,
    ) {
        let Some(account) = self.directory.account(&trader.account_id) else {
            warn!(trader_id = %trader.id, "trader references unknown account");
            return;
        };
        let params = TradeParams::resolve(&signal.recorder, trader);
        let client = self.router.client_for(account.environment);
        let tick = tick_spec(&signal.ticker);

        match outcome.transition {
            Transition::Opened => {
                let qty =
                    effective_entry_qty(Transition::Opened, signal.qty, trader, &params);
                let pos = outcome.position_after.as_ref().expect("opened has position");
                let action = OrderAction::opening(pos.side);
                if self
                    .place_entry(client, &account, signal, action, qty)
                    .await
                    .is_some()
                {
                    self.sync_brackets(client, &account, signal, pos, &params, tick)
                        .await;
                }
            }
            Transition::Dca => {
                let qty = effective_entry_qty(Transition::Dca, signal.qty, trader, &params);
                let pos = outcome.position_after.as_ref().expect("dca has position");
                let action = OrderAction::opening(pos.side);
                if self
                    .place_entry(client, &account, signal, action, qty)
                    .await
                    .is_some()
                {
                    // Hard rule: DCA re-prices the existing TP, it never
                    // stacks a second one.
                    self.sync_brackets(client, &account, signal, pos, &params, tick)
                        .await;
                }
            }
            Transition::Trimmed => {
                let trade = outcome.closed.as_ref().expect("trim has a realized leg");
                let pos = outcome.position_after.as_ref().expect("trim leaves a position");
                let action = OrderAction::closing(trade.side);
                if self
                    .place_entry(client, &account, signal, action, trade.qty)
                    .await
                    .is_some()
                {
                    self.sync_brackets(client, &account, signal, pos, &params, tick)
                        .await;
                }
            }
            Transition::Closed => {
                let reason = if signal.action == SignalAction::Close {
                    ExitReason::CloseSignal
                } else {
                    ExitReason::OppositeSignal
                };
                let Some(trade) = outcome.closed.as_ref() else {
                    // CLOSE on flat: accepted, logged, no broker action.
                    return;
                };
                let ctx = ExitContext {
                    trader_id: trader.id.clone(),
                    account: account.clone(),
                    recorder_id: signal.recorder.id.clone(),
                    ticker: signal.ticker.clone(),
                    side: trade.side,
                    qty: trade.qty,
                    reason,
                };
                match self.exits.run_exit(&ctx).await {
                    Ok(()) => {
                        self.bus.publish(EngineEvent::PositionClosed {
                            recorder_id: signal.recorder.id.clone(),
                            ticker: signal.ticker.clone(),
                            exit_price: trade.exit_price,
                            pnl_usd: trade.pnl_usd,
                            reason,
                        });
                    }
                    Err(e) => {
                        error!(trader_id = %trader.id, error = %e, "exit run failed");
                    }
                }
            }
            Transition::Flipped => {
                let trade = outcome.closed.as_ref().expect("flip has a realized leg");
                let pos = outcome.position_after.as_ref().expect("flip opens a position");

                // Brackets from the old side are gone before any new leg.
                self.cancel_all_brackets(client, &account, &signal.ticker).await;

                // Leg (a): market out of the old position.
                let close_action = OrderAction::closing(trade.side);
                self.place_entry(client, &account, signal, close_action, trade.qty)
                    .await;

                // Leg (b): market into the new side, then fresh brackets.
                let qty =
                    effective_entry_qty(Transition::Flipped, pos.total_qty, trader, &params);
                let open_action = OrderAction::opening(pos.side);
                if self
                    .place_entry(client, &account, signal, open_action, qty)
                    .await
                    .is_some()
                {
                    self.sync_brackets(client, &account, signal, pos, &params, tick)
                        .await;
                }
            }
        }
    }

    /// Place one market order, record its projection, publish. Returns the
    /// broker order id, or None when the order did not go in.
    async fn place_entry(
        &self,
        client: &BrokerClient,
        account: &BrokerAccount,
        signal: &AcceptedSignal,
        action: OrderAction,
        qty: f64,
    ) -> Option<i64> {
        let seq = self
            .store
            .next_seq(&account.id, &signal.ticker, OrderRole::Entry);
        let tag = OrderTag::new(
            account.id.clone(),
            signal.ticker.clone(),
            signal.recorder.id.clone(),
            OrderRole::Entry,
            seq,
        );
        let ticket = OrderTicket::market(action, signal.ticker.clone(), qty, tag.to_string());

        self.governor.acquire(&account.id).await;
        match client.place_order(&account.id, &ticket).await {
            Ok((order_id, status)) => {
                self.record_order(account, signal, OrderRole::Entry, action, qty, None, &tag, seq, status, order_id);
                Some(order_id)
            }
            Err(EngineError::RateLimited(_)) => {
                // The broker's own limiter fired despite the governor; one
                // polite retry after a pause.
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.governor.acquire(&account.id).await;
                match client.place_order(&account.id, &ticket).await {
                    Ok((order_id, status)) => {
                        self.record_order(account, signal, OrderRole::Entry, action, qty, None, &tag, seq, status, order_id);
                        Some(order_id)
                    }
                    Err(e) => {
                        self.publish_order_failure(account, signal, OrderRole::Entry, &e);
                        None
                    }
                }
            }
            Err(e) => {
                self.publish_order_failure(account, signal, OrderRole::Entry, &e);
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_order(
        &self,
        account: &BrokerAccount,
        signal: &AcceptedSignal,
        role: OrderRole,
        action: OrderAction,
        qty: f64,
        price: Option<f64>,
        tag: &OrderTag,
        seq: u64,
        status: OrderStatus,
        order_id: i64,
    ) {
        let now = chrono::Utc::now();
        self.store.record_order(BrokerOrderRow {
            id: uuid::Uuid::new_v4().to_string(),
            broker_order_id: order_id,
            account_id: account.id.clone(),
            ticker: signal.ticker.clone(),
            role,
            action,
            qty,
            price,
            tag: tag.to_string(),
            seq,
            status,
            placed_at: now,
            updated_at: now,
        });
        self.bus.publish(EngineEvent::OrderPlaced {
            broker_order_id: order_id,
            account_id: account.id.clone(),
            ticker: signal.ticker.clone(),
            role,
            qty,
            price,
            tag: tag.to_string(),
        });
    }

    fn publish_order_failure(
        &self,
        account: &BrokerAccount,
        signal: &AcceptedSignal,
        role: OrderRole,
        e: &EngineError,
    ) {
        error!(
            account_id = %account.id,
            ticker = %signal.ticker,
            %role,
            error = %e,
            "order placement failed"
        );
        self.bus.publish(EngineEvent::OrderRejected {
            account_id: account.id.clone(),
            ticker: signal.ticker.clone(),
            role,
            reason: e.to_string(),
        });
    }

    // -------------------------------------------------------------------------
    // Bracket management
    // -------------------------------------------------------------------------

    /// Bring TP (and SL when enabled) in line with the position: one working
    /// TP at the desired price and quantity, same for SL.
    async fn sync_brackets(
        &self,
        client: &BrokerClient,
        account: &BrokerAccount,
        signal: &AcceptedSignal,
        pos: &VirtualPosition,
        params: &TradeParams,
        tick: TickSpec,
    ) {
        let (tp_price, sl_price) =
            bracket_prices(pos.side, pos.avg_price, params.tp_ticks, params.sl_ticks, tick);

        self.sync_one_bracket(
            client,
            account,
            signal,
            pos,
            params,
            OrderRole::Tp,
            tp_price,
            pos.total_qty,
            tick,
        )
        .await;

        if params.sl_enabled {
            self.sync_one_bracket(
                client,
                account,
                signal,
                pos,
                params,
                OrderRole::Sl,
                sl_price,
                pos.total_qty,
                tick,
            )
            .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_one_bracket(
        &self,
        client: &BrokerClient,
        account: &BrokerAccount,
        signal: &AcceptedSignal,
        pos: &VirtualPosition,
        params: &TradeParams,
        role: OrderRole,
        price: f64,
        qty: f64,
        tick: TickSpec,
    ) {
        // Marketability guard: a TP that would cross the market fills on
        // placement and instantly flips the position. Skip and retry shortly.
        if role == OrderRole::Tp {
            if let Some((market_price, _)) = self.market.last_price(&signal.ticker) {
                if !tp_is_marketable(pos.side, price, market_price, tick) {
                    warn!(
                        ticker = %signal.ticker,
                        tp_price = price,
                        market_price,
                        "TP not marketable — retrying in {}s",
                        TP_RETRY_DELAY.as_secs()
                    );
                    self.schedule_bracket_retry(account, signal, *params, role, tick);
                    return;
                }
            }
        }

        let known = self.store.latest_order(&account.id, &signal.ticker, role);
        match known {
            Some(row) if row.status.is_working() => {
                // Modify in place. Cancel-and-replace here has raced duplicate
                // TPs into the book before; it is not an option.
                self.governor.acquire(&account.id).await;
                match client
                    .modify_order(&account.id, row.broker_order_id, Some(qty), Some(price))
                    .await
                {
                    Ok(()) => {
                        self.store
                            .update_order(row.broker_order_id, OrderStatus::Working, Some(qty), Some(price));
                        self.bus.publish(EngineEvent::OrderModified {
                            broker_order_id: row.broker_order_id,
                            account_id: account.id.clone(),
                            ticker: signal.ticker.clone(),
                            role,
                            qty,
                            price,
                        });
                    }
                    Err(e) => {
                        // The order went terminal between our snapshot and the
                        // modify; fall through to the sweep-and-place path.
                        warn!(error = %e, "bracket modify failed — placing fresh");
                        self.store.update_order(
                            row.broker_order_id,
                            OrderStatus::Expired,
                            None,
                            None,
                        );
                        self.sweep_and_place(client, account, signal, pos, role, price, qty)
                            .await;
                    }
                }
            }
            _ => {
                self.sweep_and_place(client, account, signal, pos, role, price, qty)
                    .await;
            }
        }
    }

    /// The fresh-placement path: cancel any working same-role order the
    /// broker still has for this (account, symbol), then place a new one with
    /// a fresh sequence.
    #[allow(clippy::too_many_arguments)]
    async fn sweep_and_place(
        &self,
        client: &BrokerClient,
        account: &BrokerAccount,
        signal: &AcceptedSignal,
        pos: &VirtualPosition,
        role: OrderRole,
        price: f64,
        qty: f64,
    ) {
        self.governor.acquire(&account.id).await;
        match client.list_orders(&account.id).await {
            Ok(orders) => {
                for order in orders {
                    if order.symbol != signal.ticker || !order.status().is_working() {
                        continue;
                    }
                    let Some(tag) = order.tag() else { continue };
                    if tag.role != role || tag.account_id != account.id {
                        continue;
                    }
                    self.governor.acquire(&account.id).await;
                    if let Err(e) = client.cancel_order(&account.id, order.id).await {
                        warn!(order_id = order.id, error = %e, "stale bracket cancel failed");
                    } else {
                        self.store
                            .update_order(order.id, OrderStatus::Canceled, None, None);
                        self.bus.publish(EngineEvent::OrderCanceled {
                            broker_order_id: order.id,
                            account_id: account.id.clone(),
                            ticker: signal.ticker.clone(),
                        });
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "order sweep failed before bracket placement");
            }
        }

        let close_action = OrderAction::closing(pos.side);
        let seq = self.store.next_seq(&account.id, &signal.ticker, role);
        let tag = OrderTag::new(
            account.id.clone(),
            signal.ticker.clone(),
            signal.recorder.id.clone(),
            role,
            seq,
        );
        let ticket = match role {
            OrderRole::Tp => {
                OrderTicket::limit(close_action, signal.ticker.clone(), qty, price, tag.to_string())
            }
            OrderRole::Sl => {
                OrderTicket::stop(close_action, signal.ticker.clone(), qty, price, tag.to_string())
            }
            OrderRole::Entry => unreachable!("entries are placed by place_entry"),
        };

        self.governor.acquire(&account.id).await;
        match client.place_order(&account.id, &ticket).await {
            Ok((order_id, status)) => {
                self.record_order(
                    account, signal, role, close_action, qty, Some(price), &tag, seq, status,
                    order_id,
                );
            }
            Err(e) => {
                self.publish_order_failure(account, signal, role, &e);
            }
        }
    }

    /// Re-run bracket sync for this key after a short delay, through the same
    /// per-key queue so it cannot race a newer signal. The retry re-reads the
    /// position and the known order at fire time; the snapshot taken here
    /// would be 2 s stale by then.
    fn schedule_bracket_retry(
        &self,
        account: &BrokerAccount,
        signal: &AcceptedSignal,
        params: TradeParams,
        role: OrderRole,
        tick: TickSpec,
    ) {
        let key = PositionKey::new(signal.recorder.id.clone(), signal.ticker.clone());
        let serializer = self.serializer.clone();
        let account = account.clone();
        let signal = signal.clone();
        let this = ThisHandle {
            store: self.store.clone(),
            router: self.router.clone(),
            governor: self.governor.clone(),
            tracker: self.tracker.clone(),
            market: self.market.clone(),
            bus: self.bus.clone(),
        };

        tokio::spawn(async move {
            tokio::time::sleep(TP_RETRY_DELAY).await;
            serializer.submit(key, async move {
                this.retry_bracket(account, signal, params, role, tick).await;
            });
        });
    }

    /// Handle one event from an account's user stream.
    pub fn handle_stream_event(self: Arc<Self>, account_id: String, event: StreamEvent) {
        match event {
            StreamEvent::Connected => {
                tokio::spawn(async move { self.resync_account(&account_id).await });
            }
            StreamEvent::Event(user_event) => self.apply_user_event(&account_id, user_event),
        }
    }

    /// Recover events missed during a stream gap: pull the broker's working
    /// orders and reconcile projection statuses.
    async fn resync_account(&self, account_id: &str) {
        let Some(account) = self.directory.account(account_id) else {
            return;
        };
        let client = self.router.client_for(account.environment);

        self.governor.acquire(account_id).await;
        let listed = match client.list_orders(account_id).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(account_id, error = %e, "resync order listing failed");
                return;
            }
        };

        // Anything the broker reports updates our projection; any projection
        // we believe is working but the broker no longer lists is terminal.
        let live_ids: std::collections::HashSet<i64> = listed.iter().map(|o| o.id).collect();
        for order in &listed {
            self.store.update_order(order.id, order.status(), None, None);
        }
        for ticker in listed.iter().map(|o| o.symbol.clone()).collect::<std::collections::HashSet<_>>() {
            for row in self.store.working_orders(account_id, &ticker) {
                if !live_ids.contains(&row.broker_order_id) {
                    self.store
                        .update_order(row.broker_order_id, OrderStatus::Expired, None, None);
                }
            }
        }
        debug!(account_id, orders = listed.len(), "account resynced after (re)connect");
    }

    /// Apply one parsed user event: update projections and prices, and drive
    /// exit transitions for bracket fills (at most once per order id).
    fn apply_user_event(&self, account_id: &str, event: UserEvent) {
        match event {
            UserEvent::Fill {
                order_id,
                symbol,
                qty,
                price,
                ..
            } => {
                self.market.update(&symbol, price);
                self.store
                    .update_order(order_id, OrderStatus::Filled, Some(qty), Some(price));

                let Some(row) = self.store.order_by_broker_id(order_id) else {
                    debug!(order_id, "fill for unknown order — likely user-placed");
                    return;
                };
                let Some(tag) = OrderTag::parse(&row.tag) else {
                    return;
                };

                match row.role {
                    OrderRole::Entry => {
                        // Settle the newest virtual entry against the fill.
                        let key = PositionKey::new(tag.strategy_id.clone(), symbol.clone());
                        let tracker = self.tracker.clone();
                        let store = self.store.clone();
                        self.serializer.submit(key.clone(), async move {
                            if let Some(pos) = tracker.update_last_entry_price(&key, price) {
                                store.upsert_open_position(&pos);
                            }
                        });
                    }
                    OrderRole::Tp | OrderRole::Sl => {
                        if !self.exits.claim_fill(order_id) {
                            // Second fill event of a TP/SL pair on a gap, or
                            // a redelivery; the first one drove the exit.
                            return;
                        }
                        self.trigger_bracket_exit(account_id, &tag, &symbol, row.role);
                    }
                }
            }
            UserEvent::Order { order_id, status, .. } => {
                self.store.update_order(order_id, status, None, None);
            }
            UserEvent::Position { symbol, net_pos } => {
                debug!(account_id, %symbol, net_pos, "position snapshot from stream");
            }
        }
    }

    /// Queue the TP/SL-fill fast path on the position's key.
    fn trigger_bracket_exit(
        &self,
        account_id: &str,
        tag: &OrderTag,
        symbol: &str,
        role: OrderRole,
    ) {
        let Some(account) = self.directory.account(account_id) else {
            return;
        };
        let recorder_id = tag.strategy_id.clone();
        let trader = self
            .directory
            .traders_for_recorder(&recorder_id)
            .into_iter()
            .find(|t| t.account_id == account_id);
        let Some(trader) = trader else {
            warn!(account_id, recorder_id = %recorder_id, "bracket fill with no trader binding");
            return;
        };

        let key = PositionKey::new(recorder_id.clone(), symbol.to_string());
        let Some(pos) = self.tracker.get(&key) else {
            debug!(key = %key, "bracket fill for flat virtual position");
            return;
        };

        let reason = match role {
            OrderRole::Tp => ExitReason::TpFill,
            OrderRole::Sl => ExitReason::SlFill,
            OrderRole::Entry => return,
        };
        let ctx = ExitContext {
            trader_id: trader.id,
            account,
            recorder_id,
            ticker: symbol.to_string(),
            side: pos.side,
            qty: pos.total_qty,
            reason,
        };

        let exits = self.exits.clone();
        self.serializer.submit(key, async move {
            if let Err(e) = exits.on_bracket_fill(&ctx).await {
                error!(error = %e, "bracket-fill exit failed");
            }
        });
    }

    /// Cancel every working TP/SL projection for (account, symbol).
    async fn cancel_all_brackets(
        &self,
        client: &BrokerClient,
        account: &BrokerAccount,
        ticker: &str,
    ) {
        for row in self.store.working_orders(&account.id, ticker) {
            if !matches!(row.role, OrderRole::Tp | OrderRole::Sl) {
                continue;
            }
            self.governor.acquire(&account.id).await;
            match client.cancel_order(&account.id, row.broker_order_id).await {
                Ok(()) => {
                    self.store
                        .update_order(row.broker_order_id, OrderStatus::Canceled, None, None);
                    self.bus.publish(EngineEvent::OrderCanceled {
                        broker_order_id: row.broker_order_id,
                        account_id: account.id.clone(),
                        ticker: ticker.to_string(),
                    });
                }
                Err(e) => {
                    warn!(order_id = row.broker_order_id, error = %e, "bracket cancel failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPipeline").finish()
    }
}

// =============================================================================
// Bracket retry handle
// =============================================================================

/// The slice of pipeline state a scheduled bracket retry needs. Retries run
/// later on the key queue, after the pipeline call stack is long gone.
struct ThisHandle {
    store: Arc<TradeStore>,
    router: Arc<BrokerRouter>,
    governor: Arc<RateGovernor>,
    tracker: Arc<PositionTracker>,
    market: Arc<LastPriceCache>,
    bus: EventBus,
}

impl ThisHandle {
    /// Fire a deferred bracket sync. Everything is re-read at fire time: the
    /// position may have DCA'd, trimmed, flipped, or closed during the delay,
    /// and a newer signal may already have placed or modified the bracket.
    /// The single-TP discipline holds here exactly as on the normal path:
    /// a still-working known order is modified in place, never duplicated.
    async fn retry_bracket(
        &self,
        account: BrokerAccount,
        signal: AcceptedSignal,
        params: TradeParams,
        role: OrderRole,
        tick: TickSpec,
    ) {
        let key = PositionKey::new(signal.recorder.id.clone(), signal.ticker.clone());
        let Some(pos) = self.tracker.get(&key) else {
            debug!(key = %key, %role, "bracket retry: position closed — nothing to place");
            return;
        };

        let (tp_price, sl_price) =
            bracket_prices(pos.side, pos.avg_price, params.tp_ticks, params.sl_ticks, tick);
        let price = match role {
            OrderRole::Tp => tp_price,
            OrderRole::Sl => sl_price,
            OrderRole::Entry => return,
        };
        let qty = pos.total_qty;

        // Still not marketable: give up until the next position mutation
        // re-syncs brackets, rather than looping forever.
        if role == OrderRole::Tp {
            if let Some((market_price, _)) = self.market.last_price(&signal.ticker) {
                if !tp_is_marketable(pos.side, price, market_price, tick) {
                    warn!(
                        ticker = %signal.ticker,
                        tp_price = price,
                        market_price,
                        "TP still not marketable on retry — leaving unplaced"
                    );
                    return;
                }
            }
        }

        let client = self.router.client_for(account.environment);

        // A newer signal may have already brought the bracket up while this
        // retry sat waiting. Modify it in place rather than stacking a second.
        if let Some(row) = self
            .store
            .latest_order(&account.id, &signal.ticker, role)
            .filter(|o| o.status.is_working())
        {
            self.governor.acquire(&account.id).await;
            match client
                .modify_order(&account.id, row.broker_order_id, Some(qty), Some(price))
                .await
            {
                Ok(()) => {
                    self.store.update_order(
                        row.broker_order_id,
                        OrderStatus::Working,
                        Some(qty),
                        Some(price),
                    );
                    self.bus.publish(EngineEvent::OrderModified {
                        broker_order_id: row.broker_order_id,
                        account_id: account.id.clone(),
                        ticker: signal.ticker.clone(),
                        role,
                        qty,
                        price,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "bracket retry modify failed — leaving to next sync");
                    self.store
                        .update_order(row.broker_order_id, OrderStatus::Expired, None, None);
                }
            }
            return;
        }

        let close_action = OrderAction::closing(pos.side);
        let seq = self.store.next_seq(&account.id, &signal.ticker, role);
        let tag = OrderTag::new(
            account.id.clone(),
            signal.ticker.clone(),
            signal.recorder.id.clone(),
            role,
            seq,
        );
        let ticket = match role {
            OrderRole::Tp => {
                OrderTicket::limit(close_action, signal.ticker.clone(), qty, price, tag.to_string())
            }
            OrderRole::Sl => {
                OrderTicket::stop(close_action, signal.ticker.clone(), qty, price, tag.to_string())
            }
            OrderRole::Entry => return,
        };

        self.governor.acquire(&account.id).await;
        match client.place_order(&account.id, &ticket).await {
            Ok((order_id, status)) => {
                let now = chrono::Utc::now();
                self.store.record_order(BrokerOrderRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    broker_order_id: order_id,
                    account_id: account.id.clone(),
                    ticker: signal.ticker.clone(),
                    role,
                    action: close_action,
                    qty,
                    price: Some(price),
                    tag: tag.to_string(),
                    seq,
                    status,
                    placed_at: now,
                    updated_at: now,
                });
                self.bus.publish(EngineEvent::OrderPlaced {
                    broker_order_id: order_id,
                    account_id: account.id.clone(),
                    ticker: signal.ticker.clone(),
                    role,
                    qty,
                    price: Some(price),
                    tag: tag.to_string(),
                });
            }
            Err(e) => {
                error!(error = %e, "bracket retry placement failed");
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
    use crate::directory::TraderOverrides;

    const MNQ: TickSpec = TickSpec {
        tick_size: 0.25,
        tick_value: 0.50,
    };

    #[test]
    fn long_brackets_straddle_the_average() {
        let (tp, sl) = bracket_prices(Side::Long, 25600.0, 10, 20, MNQ);
        assert_eq!(tp, 25602.5);
        assert_eq!(sl, 25595.0);
    }

    #[test]
    fn short_brackets_mirror() {
        let (tp, sl) = bracket_prices(Side::Short, 25600.0, 10, 20, MNQ);
        assert_eq!(tp, 25597.5);
        assert_eq!(sl, 25605.0);
    }

    #[test]
    fn dca_vwap_reprices_tp() {
        // LONG 1 @ 25600 then +1 @ 25590 => avg 25595, TP 25597.5.
        let (tp, _) = bracket_prices(Side::Long, 25595.0, 10, 20, MNQ);
        assert_eq!(tp, 25597.5);
    }

    #[test]
    fn marketability_requires_one_tick_clearance() {
        // Long TP must sit at or above market + one tick.
        assert!(tp_is_marketable(Side::Long, 25602.5, 25600.25, MNQ));
        assert!(!tp_is_marketable(Side::Long, 25600.25, 25602.5, MNQ));
        assert!(!tp_is_marketable(Side::Long, 25600.4, 25600.25, MNQ));

        assert!(tp_is_marketable(Side::Short, 25597.5, 25600.0, MNQ));
        assert!(!tp_is_marketable(Side::Short, 25600.0, 25597.5, MNQ));
    }

    #[test]
    fn effective_qty_prefers_pinned_overrides() {
        let trader = Trader {
            id: "t-1".into(),
            recorder_id: "r-1".into(),
            account_id: "a-1".into(),
            enabled: true,
            overrides: TraderOverrides {
                base_qty: Some(3.0),
                ..Default::default()
            },
            enabled_accounts: 0,
        };
        let params = TradeParams {
            base_qty: 3.0,
            add_qty: 1.0,
            tp_ticks: 10,
            sl_ticks: 20,
            sl_enabled: false,
        };
        assert_eq!(
            effective_entry_qty(Transition::Opened, 1.0, &trader, &params),
            3.0
        );
        // No add override: the signal's quantity drives DCA size.
        assert_eq!(
            effective_entry_qty(Transition::Dca, 2.0, &trader, &params),
            2.0
        );

        let plain = Trader {
            overrides: TraderOverrides::default(),
            ..trader
        };
        assert_eq!(
            effective_entry_qty(Transition::Opened, 1.0, &plain, &params),
            1.0
        );
    }
}
