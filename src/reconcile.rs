// =============================================================================
// Reconciler — periodic comparison of virtual vs broker positions
// =============================================================================
//
// The tracker is signal-authoritative between sweeps; this module is where
// broker reality gets to disagree. Every 60 s each open (account, ticker) is
// compared against the broker, plus a full per-account sweep every 5 min to
// catch orphan broker positions the tracker knows nothing about.
//
// The decision table is a pure function (`plan`) so every row of it is
// testable without a broker. Corrective work runs through the same per-key
// queues as signals, so a sweep can never race a concurrent webhook.
//
// The broker client used here is bound to the account's environment; an
// empty position list from that base means FLAT and is acted on as such.
// There is no second base to "double-check" against.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::client::{BrokerClient, BrokerRouter, OrderTicket};
use crate::broker::models::OrderTag;
use crate::bus::{EngineEvent, EventBus};
use crate::config::EngineConfig;
use crate::directory::{BrokerAccount, Directory, LastPriceCache, MarketData, Trader};
use crate::exits::{ExitContext, ExitMachine};
use crate::intake::contract_map::tick_spec;
use crate::scheduler::{KeyedSerializer, RateGovernor};
use crate::store::TradeStore;
use crate::tracker::{PositionTracker, VirtualPosition};
use crate::types::{ExitReason, OrderAction, OrderRole, OrderStatus, PositionKey, Side, TickSpec};

// =============================================================================
// Decision table
// =============================================================================

/// What one (virtual, broker) comparison calls for.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    /// Consistent; nothing to do.
    Nothing,
    /// Broker is flat but the virtual position is open: the user closed it on
    /// the broker UI. Adopt the close.
    ManualClose,
    /// Broker holds fewer contracts on the same side: partial close outside
    /// the engine. Shrink the virtual position FIFO and re-size the TP.
    PartialShrink { broker_qty: f64 },
    /// Broker holds more than the virtual position. Entries the engine did
    /// not place; log loudly, never auto-adjust.
    OrphanExcess { broker_qty: f64 },
    /// Broker is on the opposite side of the signal history. Inconsistent;
    /// arm the kill switch.
    KillSwitch,
}

/// Signed broker net vs the virtual position. Positive net is long.
pub fn plan(r#virtual: &VirtualPosition, broker_net: f64) -> ReconcileAction {
    const EPS: f64 = 1e-9;
    let virtual_signed = match r#virtual.side {
        Side::Long => r#virtual.total_qty,
        Side::Short => -r#virtual.total_qty,
        Side::Flat => 0.0,
    };

    if broker_net.abs() < EPS {
        return ReconcileAction::ManualClose;
    }
    if (broker_net > 0.0) != (virtual_signed > 0.0) {
        return ReconcileAction::KillSwitch;
    }

    let broker_qty = broker_net.abs();
    let diff = broker_qty - r#virtual.total_qty;
    if diff.abs() < EPS {
        ReconcileAction::Nothing
    } else if diff < 0.0 {
        ReconcileAction::PartialShrink { broker_qty }
    } else {
        ReconcileAction::OrphanExcess { broker_qty }
    }
}

/// Average-price drift worth reporting: more than a tenth of a tick.
pub fn avg_drift_exceeds(virtual_avg: f64, broker_avg: f64, tick: TickSpec) -> bool {
    (virtual_avg - broker_avg).abs() > 0.1 * tick.tick_size
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct Reconciler {
    directory: Arc<dyn Directory>,
    tracker: Arc<PositionTracker>,
    store: Arc<TradeStore>,
    router: Arc<BrokerRouter>,
    governor: Arc<RateGovernor>,
    serializer: Arc<KeyedSerializer>,
    exits: Arc<ExitMachine>,
    market: Arc<LastPriceCache>,
    bus: EventBus,
    config: EngineConfig,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn Directory>,
        tracker: Arc<PositionTracker>,
        store: Arc<TradeStore>,
        router: Arc<BrokerRouter>,
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
            governor,
            serializer,
            exits,
            market,
            bus,
            config,
        }
    }

    /// Timer loop: per-position pass every `reconcile_interval_s`, full
    /// account sweep every `reconcile_full_sweep_s`.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.reconcile_interval_s));
        let sweep_every = (self.config.reconcile_full_sweep_s
            / self.config.reconcile_interval_s.max(1))
        .max(1);
        let mut cycles: u64 = 0;

        info!(
            interval_s = self.config.reconcile_interval_s,
            full_sweep_s = self.config.reconcile_full_sweep_s,
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    info!("reconciler stopping");
                    return;
                }
            }
            cycles += 1;
            self.clone().sweep_open_positions();
            if cycles % sweep_every == 0 {
                self.sweep_accounts().await;
            }
        }
    }

    /// Queue a reconcile job for every open (recorder, ticker) x trader.
    /// Also the body of the admin force-reconcile endpoint.
    pub fn sweep_open_positions(self: Arc<Self>) {
        for pos in self.tracker.open_positions() {
            let key = PositionKey::new(pos.recorder_id.clone(), pos.ticker.clone());
            for trader in self
                .directory
                .traders_for_recorder(&pos.recorder_id)
                .into_iter()
                .filter(|t| t.enabled)
            {
                let Some(account) = self.directory.account(&trader.account_id) else {
                    continue;
                };
                let this = self.clone();
                let key_for_job = key.clone();
                self.serializer.submit(key.clone(), async move {
                    this.reconcile_key(&key_for_job, &trader, &account).await;
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Per-key pass
    // -------------------------------------------------------------------------

    async fn reconcile_key(&self, key: &PositionKey, trader: &Trader, account: &BrokerAccount) {
        // The position may have closed while this job sat in the queue.
        let Some(virtual_pos) = self.tracker.get(key) else {
            return;
        };
        let client = self.router.client_for(account.environment);

        self.governor.acquire(&account.id).await;
        let positions = match client.list_positions(&account.id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %key, error = %e, "reconcile position query failed");
                return;
            }
        };
        let broker = positions.iter().find(|p| p.symbol == key.ticker);
        let broker_net = broker.map(|p| p.net_pos).unwrap_or(0.0);

        let action = plan(&virtual_pos, broker_net);
        debug!(key = %key, broker_net, ?action, "reconcile pass");

        match action {
            ReconcileAction::Nothing => {
                if let Some(broker_avg) = broker.and_then(|p| p.net_price) {
                    let tick = tick_spec(&key.ticker);
                    if avg_drift_exceeds(virtual_pos.avg_price, broker_avg, tick) {
                        self.bus.publish(EngineEvent::ReconcileDrift {
                            recorder_id: key.recorder_id.clone(),
                            ticker: key.ticker.clone(),
                            detail: format!(
                                "avg drift: virtual {:.4} vs broker {:.4}",
                                virtual_pos.avg_price, broker_avg
                            ),
                        });
                    }
                }
                self.ensure_tp(key, &virtual_pos, account, client).await;
            }
            ReconcileAction::ManualClose => {
                self.adopt_manual_close(key, account, client).await;
            }
            ReconcileAction::PartialShrink { broker_qty } => {
                self.adopt_partial_close(key, broker_qty, account, client).await;
            }
            ReconcileAction::OrphanExcess { broker_qty } => {
                warn!(
                    key = %key,
                    virtual_qty = virtual_pos.total_qty,
                    broker_qty,
                    "broker holds MORE than the signal history explains — operator required"
                );
                self.bus.publish(EngineEvent::ReconcileDrift {
                    recorder_id: key.recorder_id.clone(),
                    ticker: key.ticker.clone(),
                    detail: format!(
                        "orphan excess: broker {broker_qty} vs virtual {}",
                        virtual_pos.total_qty
                    ),
                });
            }
            ReconcileAction::KillSwitch => {
                warn!(key = %key, broker_net, "broker on OPPOSITE side — kill switch");
                let ctx = ExitContext {
                    trader_id: trader.id.clone(),
                    account: account.clone(),
                    recorder_id: key.recorder_id.clone(),
                    ticker: key.ticker.clone(),
                    side: virtual_pos.side,
                    qty: virtual_pos.total_qty,
                    reason: ExitReason::ReconcileFlatten,
                };
                let _ = self.exits.kill(&ctx).await;
            }
        }
    }

    /// Broker flat, virtual open: close the virtual position at the last
    /// known market price and clean up any lingering brackets. Not a kill.
    async fn adopt_manual_close(
        &self,
        key: &PositionKey,
        account: &BrokerAccount,
        client: &BrokerClient,
    ) {
        info!(key = %key, "broker reports flat — adopting manual close");
        let tick = tick_spec(&key.ticker);
        let exit_price = self.market.last_price(&key.ticker).map(|(p, _)| p);

        match self
            .tracker
            .close(key, exit_price, ExitReason::ManualBrokerClose, tick)
        {
            Ok(Some(trade)) => {
                self.store.close_position(
                    &key.recorder_id,
                    &key.ticker,
                    trade.exit_price,
                    ExitReason::ManualBrokerClose,
                );
                self.store.record_trade((&trade).into());
                self.bus.publish(EngineEvent::PositionClosed {
                    recorder_id: key.recorder_id.clone(),
                    ticker: key.ticker.clone(),
                    exit_price: trade.exit_price,
                    pnl_usd: trade.pnl_usd,
                    reason: ExitReason::ManualBrokerClose,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "manual-close adoption failed"),
        }

        // Lingering brackets would re-open exposure when they fill.
        for row in self.store.working_orders(&account.id, &key.ticker) {
            if !matches!(row.role, OrderRole::Tp | OrderRole::Sl) {
                continue;
            }
            self.governor.acquire(&account.id).await;
            if client
                .cancel_order(&account.id, row.broker_order_id)
                .await
                .is_ok()
            {
                self.store
                    .update_order(row.broker_order_id, OrderStatus::Canceled, None, None);
                self.bus.publish(EngineEvent::OrderCanceled {
                    broker_order_id: row.broker_order_id,
                    account_id: account.id.clone(),
                    ticker: key.ticker.clone(),
                });
            }
        }

        self.bus.publish(EngineEvent::ReconcileAction {
            recorder_id: key.recorder_id.clone(),
            ticker: key.ticker.clone(),
            action: "manual_broker_close".into(),
        });
    }

    /// Broker shrank the position outside the engine: mirror it FIFO and
    /// bring the TP quantity down to match.
    async fn adopt_partial_close(
        &self,
        key: &PositionKey,
        broker_qty: f64,
        account: &BrokerAccount,
        client: &BrokerClient,
    ) {
        info!(key = %key, broker_qty, "broker reports partial close — shrinking virtual");
        let Some(pos) = self.tracker.shrink_to(key, broker_qty) else {
            return;
        };
        self.store.upsert_open_position(&pos);

        if let Some(tp) = self
            .store
            .latest_order(&account.id, &key.ticker, OrderRole::Tp)
            .filter(|o| o.status.is_working())
        {
            self.governor.acquire(&account.id).await;
            match client
                .modify_order(&account.id, tp.broker_order_id, Some(broker_qty), tp.price)
                .await
            {
                Ok(()) => {
                    self.store.update_order(
                        tp.broker_order_id,
                        OrderStatus::Working,
                        Some(broker_qty),
                        None,
                    );
                    self.bus.publish(EngineEvent::OrderModified {
                        broker_order_id: tp.broker_order_id,
                        account_id: account.id.clone(),
                        ticker: key.ticker.clone(),
                        role: OrderRole::Tp,
                        qty: broker_qty,
                        price: tp.price.unwrap_or_default(),
                    });
                }
                Err(e) => warn!(error = %e, "TP re-size after partial close failed"),
            }
        }

        self.bus.publish(EngineEvent::ReconcileAction {
            recorder_id: key.recorder_id.clone(),
            ticker: key.ticker.clone(),
            action: format!("partial_close_to_{broker_qty}"),
        });
    }

    /// An open position with TP configured must have exactly one working TP
    /// at the broker; place one if it went missing (respecting the
    /// marketability guard).
    async fn ensure_tp(
        &self,
        key: &PositionKey,
        pos: &VirtualPosition,
        account: &BrokerAccount,
        client: &BrokerClient,
    ) {
        let Some(recorder) = self.directory.recorder_by_id(&key.recorder_id) else {
            return;
        };
        if recorder.tp_ticks == 0 {
            return;
        }

        self.governor.acquire(&account.id).await;
        let working_tp_at_broker = match client.list_orders(&account.id).await {
            Ok(orders) => orders.iter().any(|o| {
                o.symbol == key.ticker
                    && o.status().is_working()
                    && o.tag().map(|t| t.role == OrderRole::Tp).unwrap_or(false)
            }),
            Err(e) => {
                warn!(error = %e, "order listing failed during TP check");
                return;
            }
        };
        if working_tp_at_broker {
            return;
        }

        let tick = tick_spec(&key.ticker);
        let tp_price = crate::pipeline::bracket_prices(
            pos.side,
            pos.avg_price,
            recorder.tp_ticks,
            recorder.sl_ticks,
            tick,
        )
        .0;

        if let Some((market_price, _)) = self.market.last_price(&key.ticker) {
            if !crate::pipeline::tp_is_marketable(pos.side, tp_price, market_price, tick) {
                debug!(key = %key, tp_price, market_price, "missing TP not marketable yet");
                return;
            }
        }

        warn!(key = %key, tp_price, "open position has no working TP — placing");
        let action = OrderAction::closing(pos.side);
        let seq = self.store.next_seq(&account.id, &key.ticker, OrderRole::Tp);
        let tag = OrderTag::new(
            account.id.clone(),
            key.ticker.clone(),
            key.recorder_id.clone(),
            OrderRole::Tp,
            seq,
        );
        let ticket = OrderTicket::limit(
            action,
            key.ticker.clone(),
            pos.total_qty,
            tp_price,
            tag.to_string(),
        );

        self.governor.acquire(&account.id).await;
        match client.place_order(&account.id, &ticket).await {
            Ok((order_id, status)) => {
                let now = chrono::Utc::now();
                self.store.record_order(crate::store::BrokerOrderRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    broker_order_id: order_id,
                    account_id: account.id.clone(),
                    ticker: key.ticker.clone(),
                    role: OrderRole::Tp,
                    action,
                    qty: pos.total_qty,
                    price: Some(tp_price),
                    tag: tag.to_string(),
                    seq,
                    status,
                    placed_at: now,
                    updated_at: now,
                });
                self.bus.publish(EngineEvent::ReconcileAction {
                    recorder_id: key.recorder_id.clone(),
                    ticker: key.ticker.clone(),
                    action: format!("tp_replaced@{tp_price}"),
                });
            }
            Err(e) => warn!(error = %e, "missing-TP placement failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Full account sweep
    // -------------------------------------------------------------------------

    /// Look for broker positions with no virtual counterpart. Alert only;
    /// the engine never trades what it did not open.
    async fn sweep_accounts(&self) {
        let open = self.tracker.open_positions();
        for account in self.directory.all_accounts() {
            let client = self.router.client_for(account.environment);
            self.governor.acquire(&account.id).await;
            let positions = match client.list_positions(&account.id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "full sweep query failed");
                    continue;
                }
            };

            for bp in positions.iter().filter(|p| p.net_pos != 0.0) {
                // A broker position is only explained by a virtual position
                // whose recorder actually routes to THIS account. Recorders
                // on other accounts trading the same symbol do not count.
                let known = open.iter().any(|v| {
                    v.ticker == bp.symbol
                        && self
                            .directory
                            .traders_for_recorder(&v.recorder_id)
                            .iter()
                            .any(|t| t.account_id == account.id)
                });
                if !known {
                    warn!(
                        account_id = %account.id,
                        symbol = %bp.symbol,
                        net_pos = bp.net_pos,
                        "orphan broker position — no virtual counterpart, not trading it"
                    );
                    self.bus.publish(EngineEvent::ReconcileDrift {
                        recorder_id: String::new(),
                        ticker: bp.symbol.clone(),
                        detail: format!(
                            "orphan broker position net={} on account {}",
                            bp.net_pos, account.id
                        ),
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Entry;
    use chrono::Utc;

    fn virtual_pos(side: Side, qty: f64) -> VirtualPosition {
        VirtualPosition {
            id: "p-1".into(),
            recorder_id: "r-1".into(),
            ticker: "MNQU5".into(),
            side,
            total_qty: qty,
            avg_price: 25600.0,
            entries: vec![Entry {
                price: 25600.0,
                qty,
                ts: Utc::now(),
            }],
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn matching_position_needs_nothing() {
        assert_eq!(plan(&virtual_pos(Side::Long, 2.0), 2.0), ReconcileAction::Nothing);
        assert_eq!(plan(&virtual_pos(Side::Short, 3.0), -3.0), ReconcileAction::Nothing);
    }

    #[test]
    fn broker_flat_is_manual_close_not_kill() {
        assert_eq!(plan(&virtual_pos(Side::Long, 1.0), 0.0), ReconcileAction::ManualClose);
        assert_eq!(plan(&virtual_pos(Side::Short, 2.0), 0.0), ReconcileAction::ManualClose);
    }

    #[test]
    fn broker_smaller_same_side_is_partial_shrink() {
        assert_eq!(
            plan(&virtual_pos(Side::Long, 4.0), 1.0),
            ReconcileAction::PartialShrink { broker_qty: 1.0 }
        );
        assert_eq!(
            plan(&virtual_pos(Side::Short, 4.0), -1.0),
            ReconcileAction::PartialShrink { broker_qty: 1.0 }
        );
    }

    #[test]
    fn broker_larger_same_side_is_orphan_excess() {
        assert_eq!(
            plan(&virtual_pos(Side::Long, 1.0), 3.0),
            ReconcileAction::OrphanExcess { broker_qty: 3.0 }
        );
    }

    #[test]
    fn opposite_side_arms_kill_switch() {
        assert_eq!(plan(&virtual_pos(Side::Long, 2.0), -2.0), ReconcileAction::KillSwitch);
        assert_eq!(plan(&virtual_pos(Side::Short, 2.0), 1.0), ReconcileAction::KillSwitch);
    }

    #[test]
    fn avg_drift_threshold_is_a_tenth_of_a_tick() {
        let tick = TickSpec::new(0.25, 0.50);
        assert!(!avg_drift_exceeds(25600.0, 25600.02, tick));
        assert!(avg_drift_exceeds(25600.0, 25600.03, tick));
    }

    #[test]
    fn reconciler_converges_in_one_pass() {
        // With no new signals, applying the planned correction once always
        // yields Nothing (or an escalated/alerting state) on the next pass.
        let cases = [
            (Side::Long, 2.0, 2.0),
            (Side::Long, 2.0, 1.0),
            (Side::Short, 3.0, -2.0),
        ];
        for (side, vqty, net) in cases {
            let v = virtual_pos(side, vqty);
            match plan(&v, net) {
                ReconcileAction::Nothing => {}
                ReconcileAction::PartialShrink { broker_qty } => {
                    let shrunk = virtual_pos(side, broker_qty);
                    assert_eq!(plan(&shrunk, net), ReconcileAction::Nothing);
                }
                other => panic!("unexpected plan {other:?}"),
            }
        }
    }
}
