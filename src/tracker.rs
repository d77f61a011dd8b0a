// =============================================================================
// Position Tracker — signal-derived virtual positions
// =============================================================================
//
// The engine is signal-authoritative: the virtual position is computed from
// the accepted signal stream alone, never from broker state. Broker drift is
// handled out-of-band by the reconciler.
//
// Transition table (current side x action):
//   FLAT  + BUY   -> opened LONG
//   FLAT  + SELL  -> opened SHORT
//   LONG  + BUY   -> dca (append entry, recompute VWAP)
//   LONG  + SELL  -> trim (FIFO) | closed | flipped to SHORT
//   SHORT + SELL  -> dca
//   SHORT + BUY   -> mirror of LONG + SELL
//   any   + CLOSE -> closed
//
// Thread-safety: the map is behind `parking_lot::RwLock`, but all writes for
// a given (recorder, ticker) arrive through the per-key serialized queue, so
// the lock only guards cross-key map access.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::MarketData;
use crate::error::{EngineError, EngineResult};
use crate::types::{ExitReason, PositionKey, Side, SignalAction, TickSpec, Transition};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// One fill-sized slice of an open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub price: f64,
    pub qty: f64,
    pub ts: DateTime<Utc>,
}

/// Net position for one (recorder, ticker), derived from signals.
///
/// Invariants held at rest:
///   - `sum(entries.qty) == total_qty`
///   - `avg_price == sum(e.price * e.qty) / total_qty`
///   - `side == FLAT` implies the position has been removed from the map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualPosition {
    pub id: String,
    pub recorder_id: String,
    pub ticker: String,
    pub side: Side,
    pub total_qty: f64,
    pub avg_price: f64,
    pub entries: Vec<Entry>,
    pub opened_at: DateTime<Utc>,
}

impl VirtualPosition {
    fn recompute_avg(&mut self) {
        let total: f64 = self.entries.iter().map(|e| e.qty).sum();
        self.total_qty = total;
        self.avg_price = if total > 0.0 {
            self.entries.iter().map(|e| e.price * e.qty).sum::<f64>() / total
        } else {
            0.0
        };
    }
}

/// A realized close (full or partial), ready for the trades table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: String,
    pub recorder_id: String,
    pub ticker: String,
    pub side: Side,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub exit_price: f64,
    pub pnl_usd: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub reason: ExitReason,
}

/// Result of applying one signal to the tracker.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub transition: Transition,
    /// The open position after the signal, if any remains.
    pub position_after: Option<VirtualPosition>,
    /// The realized leg, present for trim/close/flip.
    pub closed: Option<ClosedTrade>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Owns every virtual position. One open position per (recorder, ticker).
pub struct PositionTracker {
    positions: RwLock<HashMap<PositionKey, VirtualPosition>>,
    market_data: Arc<dyn MarketData>,
}

impl PositionTracker {
    pub fn new(market_data: Arc<dyn MarketData>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            market_data,
        }
    }

    /// Rebuild the open-position map from persisted rows at startup.
    pub fn restore(&self, open: Vec<VirtualPosition>) {
        let mut map = self.positions.write();
        for pos in open {
            let key = PositionKey::new(pos.recorder_id.clone(), pos.ticker.clone());
            map.insert(key, pos);
        }
        info!(count = map.len(), "virtual positions restored");
    }

    pub fn get(&self, key: &PositionKey) -> Option<VirtualPosition> {
        self.positions.read().get(key).cloned()
    }

    pub fn open_positions(&self) -> Vec<VirtualPosition> {
        self.positions.read().values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Signal application
    // -------------------------------------------------------------------------

    /// Apply one accepted signal. Must be called from the per-key queue.
    ///
    /// `price` is the webhook's price hint; the fallback chain is last market
    /// price, then (for DCA only) the last entry's price, then NoPrice.
    pub fn apply_signal(
        &self,
        key: &PositionKey,
        action: SignalAction,
        price: Option<f64>,
        qty: f64,
        tick: TickSpec,
    ) -> EngineResult<ApplyOutcome> {
        if action == SignalAction::Close {
            let closed = self.close(key, price, ExitReason::CloseSignal, tick)?;
            return Ok(ApplyOutcome {
                transition: Transition::Closed,
                position_after: None,
                closed,
            });
        }

        if qty <= 0.0 {
            return Err(EngineError::UnparseableSignal(format!(
                "non-positive quantity {qty}"
            )));
        }

        let current = self.get(key);
        let price = self.resolve_price(key, price, current.as_ref())?;
        let signal_side = action.side();

        let outcome = match current {
            None => self.open_new(key, signal_side, price, qty),
            Some(pos) if pos.side == signal_side => self.dca(key, price, qty),
            Some(pos) => self.reduce_or_flip(key, pos, signal_side, price, qty, tick),
        };

        if let Ok(ref o) = outcome {
            debug!(
                key = %key,
                transition = %o.transition,
                qty_after = o.position_after.as_ref().map(|p| p.total_qty).unwrap_or(0.0),
                "signal applied"
            );
        }
        outcome
    }

    /// Close the open position at `exit_price` (or the best known price).
    /// Returns `None` when there is nothing to close - CLOSE on FLAT is a
    /// logged no-op, not an error.
    pub fn close(
        &self,
        key: &PositionKey,
        exit_price: Option<f64>,
        reason: ExitReason,
        tick: TickSpec,
    ) -> EngineResult<Option<ClosedTrade>> {
        let Some(pos) = self.positions.write().remove(key) else {
            info!(key = %key, %reason, "close on flat position — no-op");
            return Ok(None);
        };

        let exit_price = match exit_price.filter(|p| *p > 0.0) {
            Some(p) => p,
            None => match self.market_data.last_price(&key.ticker) {
                Some((p, _)) => p,
                // Position must still leave the books; fall back to its own
                // average so the realized row exists with zero P&L.
                None => {
                    warn!(key = %key, "no exit price available — realizing at avg entry");
                    pos.avg_price
                }
            },
        };

        let trade = realize(&pos, pos.total_qty, pos.avg_price, exit_price, reason, tick);
        info!(
            key = %key,
            exit_price,
            pnl_usd = trade.pnl_usd,
            %reason,
            "position closed"
        );
        Ok(Some(trade))
    }

    /// Replace the newest entry's price with the actual broker fill price and
    /// recompute the VWAP. Signals carry the chart's price; the fill is what
    /// P&L is settled against.
    pub fn update_last_entry_price(
        &self,
        key: &PositionKey,
        fill_price: f64,
    ) -> Option<VirtualPosition> {
        if fill_price <= 0.0 {
            return None;
        }
        let mut map = self.positions.write();
        let pos = map.get_mut(key)?;
        let last = pos.entries.last_mut()?;
        last.price = fill_price;
        pos.recompute_avg();
        debug!(key = %key, fill_price, avg_price = pos.avg_price, "entry repriced to fill");
        Some(pos.clone())
    }

    /// Shrink the position to `target_qty` contracts, FIFO, without realizing
    /// a trade row. Used by the reconciler when the broker reports a partial
    /// close the engine did not originate.
    pub fn shrink_to(&self, key: &PositionKey, target_qty: f64) -> Option<VirtualPosition> {
        let mut map = self.positions.write();
        let pos = map.get_mut(key)?;
        if target_qty <= 0.0 {
            map.remove(key);
            return None;
        }
        let excess = pos.total_qty - target_qty;
        if excess <= 0.0 {
            return Some(pos.clone());
        }
        consume_fifo(&mut pos.entries, excess);
        pos.recompute_avg();
        Some(pos.clone())
    }

    // -------------------------------------------------------------------------
    // Transition internals
    // -------------------------------------------------------------------------

    fn open_new(
        &self,
        key: &PositionKey,
        side: Side,
        price: f64,
        qty: f64,
    ) -> EngineResult<ApplyOutcome> {
        let now = Utc::now();
        let pos = VirtualPosition {
            id: Uuid::new_v4().to_string(),
            recorder_id: key.recorder_id.clone(),
            ticker: key.ticker.clone(),
            side,
            total_qty: qty,
            avg_price: price,
            entries: vec![Entry {
                price,
                qty,
                ts: now,
            }],
            opened_at: now,
        };
        self.positions.write().insert(key.clone(), pos.clone());
        info!(key = %key, %side, qty, price, "position opened");
        Ok(ApplyOutcome {
            transition: Transition::Opened,
            position_after: Some(pos),
            closed: None,
        })
    }

    fn dca(&self, key: &PositionKey, price: f64, qty: f64) -> EngineResult<ApplyOutcome> {
        let mut map = self.positions.write();
        let pos = map
            .get_mut(key)
            .expect("dca caller verified the position exists");
        pos.entries.push(Entry {
            price,
            qty,
            ts: Utc::now(),
        });
        pos.recompute_avg();
        let snapshot = pos.clone();
        drop(map);

        info!(
            key = %key,
            qty,
            price,
            total_qty = snapshot.total_qty,
            avg_price = snapshot.avg_price,
            "dca addition"
        );
        Ok(ApplyOutcome {
            transition: Transition::Dca,
            position_after: Some(snapshot),
            closed: None,
        })
    }

    fn reduce_or_flip(
        &self,
        key: &PositionKey,
        pos: VirtualPosition,
        signal_side: Side,
        price: f64,
        qty: f64,
        tick: TickSpec,
    ) -> EngineResult<ApplyOutcome> {
        const QTY_EPS: f64 = 1e-9;
        let remaining = pos.total_qty - qty;

        if remaining > QTY_EPS {
            // Partial trim: FIFO-consume entries, recompute VWAP from the
            // survivors so the invariant holds exactly.
            let mut map = self.positions.write();
            let live = map.get_mut(key).expect("trim caller verified existence");
            let consumed_avg = consume_fifo(&mut live.entries, qty);
            live.recompute_avg();
            let snapshot = live.clone();
            drop(map);

            let trade = realize(&pos, qty, consumed_avg, price, ExitReason::OppositeSignal, tick);
            info!(
                key = %key,
                trimmed = qty,
                remaining = snapshot.total_qty,
                pnl_usd = trade.pnl_usd,
                "position trimmed"
            );
            return Ok(ApplyOutcome {
                transition: Transition::Trimmed,
                position_after: Some(snapshot),
                closed: Some(trade),
            });
        }

        if remaining.abs() <= QTY_EPS {
            // Exact close.
            self.positions.write().remove(key);
            let trade = realize(
                &pos,
                pos.total_qty,
                pos.avg_price,
                price,
                ExitReason::OppositeSignal,
                tick,
            );
            info!(key = %key, pnl_usd = trade.pnl_usd, "position closed by opposite signal");
            return Ok(ApplyOutcome {
                transition: Transition::Closed,
                position_after: None,
                closed: Some(trade),
            });
        }

        // Flip: close the whole position, open the remainder on the new side.
        let flip_qty = -remaining;
        let trade = realize(
            &pos,
            pos.total_qty,
            pos.avg_price,
            price,
            ExitReason::OppositeSignal,
            tick,
        );
        let now = Utc::now();
        let new_pos = VirtualPosition {
            id: Uuid::new_v4().to_string(),
            recorder_id: key.recorder_id.clone(),
            ticker: key.ticker.clone(),
            side: signal_side,
            total_qty: flip_qty,
            avg_price: price,
            entries: vec![Entry {
                price,
                qty: flip_qty,
                ts: now,
            }],
            opened_at: now,
        };
        self.positions.write().insert(key.clone(), new_pos.clone());

        info!(
            key = %key,
            closed_qty = pos.total_qty,
            new_side = %signal_side,
            new_qty = flip_qty,
            pnl_usd = trade.pnl_usd,
            "position flipped"
        );
        Ok(ApplyOutcome {
            transition: Transition::Flipped,
            position_after: Some(new_pos),
            closed: Some(trade),
        })
    }

    fn resolve_price(
        &self,
        key: &PositionKey,
        hint: Option<f64>,
        current: Option<&VirtualPosition>,
    ) -> EngineResult<f64> {
        // A zero price from the chart strategy means "omitted", never "free".
        if let Some(p) = hint.filter(|p| *p > 0.0) {
            return Ok(p);
        }
        if let Some((p, _)) = self.market_data.last_price(&key.ticker) {
            return Ok(p);
        }
        if let Some(pos) = current {
            if let Some(last) = pos.entries.last() {
                return Ok(last.price);
            }
        }
        Err(EngineError::NoPrice(key.ticker.clone()))
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("open_positions", &self.positions.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Remove `qty` contracts from the front of `entries` (oldest first) and
/// return the volume-weighted average price of what was consumed.
fn consume_fifo(entries: &mut Vec<Entry>, qty: f64) -> f64 {
    let mut remaining = qty;
    let mut consumed_value = 0.0;
    let mut consumed_qty = 0.0;

    while remaining > 1e-9 && !entries.is_empty() {
        let head = &mut entries[0];
        let take = head.qty.min(remaining);
        consumed_value += head.price * take;
        consumed_qty += take;
        head.qty -= take;
        remaining -= take;
        if head.qty <= 1e-9 {
            entries.remove(0);
        }
    }

    if consumed_qty > 0.0 {
        consumed_value / consumed_qty
    } else {
        0.0
    }
}

fn realize(
    pos: &VirtualPosition,
    qty: f64,
    entry_avg: f64,
    exit_price: f64,
    reason: ExitReason,
    tick: TickSpec,
) -> ClosedTrade {
    let direction = match pos.side {
        Side::Long => 1.0,
        Side::Short => -1.0,
        Side::Flat => 0.0,
    };
    let pnl_usd = tick.pnl(direction * (exit_price - entry_avg), qty);
    ClosedTrade {
        position_id: pos.id.clone(),
        recorder_id: pos.recorder_id.clone(),
        ticker: pos.ticker.clone(),
        side: pos.side,
        qty,
        avg_entry_price: entry_avg,
        exit_price,
        pnl_usd,
        opened_at: pos.opened_at,
        closed_at: Utc::now(),
        reason,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MNQ: TickSpec = TickSpec {
        tick_size: 0.25,
        tick_value: 0.50,
    };

    struct NoMarket;
    impl MarketData for NoMarket {
        fn last_price(&self, _ticker: &str) -> Option<(f64, DateTime<Utc>)> {
            None
        }
    }

    struct FixedMarket(f64);
    impl MarketData for FixedMarket {
        fn last_price(&self, _ticker: &str) -> Option<(f64, DateTime<Utc>)> {
            Some((self.0, Utc::now()))
        }
    }

    fn tracker() -> PositionTracker {
        PositionTracker::new(Arc::new(NoMarket))
    }

    fn key() -> PositionKey {
        PositionKey::new("r-1", "MNQU5")
    }

    fn assert_invariants(pos: &VirtualPosition) {
        let sum: f64 = pos.entries.iter().map(|e| e.qty).sum();
        assert!((sum - pos.total_qty).abs() < 1e-9, "entry qty sum != total");
        let weighted: f64 = pos.entries.iter().map(|e| e.price * e.qty).sum();
        assert!(
            (pos.avg_price * pos.total_qty - weighted).abs() < 1e-6,
            "vwap invariant broken"
        );
    }

    #[test]
    fn buy_on_flat_opens_long() {
        let t = tracker();
        let out = t
            .apply_signal(&key(), SignalAction::Buy, Some(25600.0), 1.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Opened);
        let pos = out.position_after.unwrap();
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.total_qty, 1.0);
        assert_eq!(pos.avg_price, 25600.0);
        assert_invariants(&pos);
    }

    #[test]
    fn sell_on_flat_opens_short() {
        let t = tracker();
        let out = t
            .apply_signal(&key(), SignalAction::Sell, Some(25600.0), 2.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Opened);
        assert_eq!(out.position_after.unwrap().side, Side::Short);
    }

    #[test]
    fn dca_recomputes_vwap() {
        let t = tracker();
        t.apply_signal(&key(), SignalAction::Buy, Some(25600.0), 1.0, MNQ)
            .unwrap();
        let out = t
            .apply_signal(&key(), SignalAction::Buy, Some(25590.0), 1.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Dca);
        let pos = out.position_after.unwrap();
        assert_eq!(pos.total_qty, 2.0);
        assert!((pos.avg_price - 25595.0).abs() < 1e-9);
        assert_eq!(pos.entries.len(), 2);
        assert_invariants(&pos);
    }

    #[test]
    fn partial_trim_consumes_fifo() {
        let t = tracker();
        t.apply_signal(&key(), SignalAction::Buy, Some(100.0), 2.0, MNQ)
            .unwrap();
        t.apply_signal(&key(), SignalAction::Buy, Some(110.0), 2.0, MNQ)
            .unwrap();

        // Trim 3 of 4: consumes both 100s and one 110.
        let out = t
            .apply_signal(&key(), SignalAction::Sell, Some(120.0), 3.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Trimmed);
        let pos = out.position_after.unwrap();
        assert_eq!(pos.total_qty, 1.0);
        assert!((pos.avg_price - 110.0).abs() < 1e-9);
        assert_invariants(&pos);

        let trade = out.closed.unwrap();
        assert_eq!(trade.qty, 3.0);
        // Consumed avg: (100*2 + 110*1) / 3.
        assert!((trade.avg_entry_price - 310.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn exact_opposite_closes_flat() {
        let t = tracker();
        t.apply_signal(&key(), SignalAction::Buy, Some(25600.0), 2.0, MNQ)
            .unwrap();
        let out = t
            .apply_signal(&key(), SignalAction::Sell, Some(25610.0), 2.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Closed);
        assert!(out.position_after.is_none());
        assert!(t.get(&key()).is_none());

        // BUY then SELL round-trip P&L: 10 points * 2 contracts * $2/point.
        let trade = out.closed.unwrap();
        assert!((trade.pnl_usd - 40.0).abs() < 1e-9);
    }

    #[test]
    fn oversized_opposite_flips() {
        let t = tracker();
        t.apply_signal(&key(), SignalAction::Buy, Some(25595.0), 2.0, MNQ)
            .unwrap();
        let out = t
            .apply_signal(&key(), SignalAction::Sell, Some(25600.0), 3.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Flipped);

        let pos = out.position_after.unwrap();
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.total_qty, 1.0);
        assert_eq!(pos.avg_price, 25600.0);
        assert_invariants(&pos);

        let trade = out.closed.unwrap();
        assert_eq!(trade.qty, 2.0);
        assert_eq!(trade.side, Side::Long);
    }

    #[test]
    fn short_side_mirrors() {
        let t = tracker();
        t.apply_signal(&key(), SignalAction::Sell, Some(100.0), 2.0, MNQ)
            .unwrap();
        // DCA in short direction.
        let out = t
            .apply_signal(&key(), SignalAction::Sell, Some(90.0), 2.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Dca);
        assert!((out.position_after.unwrap().avg_price - 95.0).abs() < 1e-9);

        // Short profits when price falls: entered avg 95, exit 90.
        let out = t
            .apply_signal(&key(), SignalAction::Buy, Some(90.0), 4.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Closed);
        let trade = out.closed.unwrap();
        assert!((trade.pnl_usd - MNQ.pnl(5.0, 4.0)).abs() < 1e-9);
    }

    #[test]
    fn close_on_flat_is_noop() {
        let t = tracker();
        let out = t
            .apply_signal(&key(), SignalAction::Close, Some(25600.0), 0.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Closed);
        assert!(out.closed.is_none());
        assert!(out.position_after.is_none());
    }

    #[test]
    fn flat_open_without_price_fails_no_price() {
        let t = tracker();
        let err = t
            .apply_signal(&key(), SignalAction::Buy, None, 1.0, MNQ)
            .unwrap_err();
        assert_eq!(err.kind(), "no_price");
    }

    #[test]
    fn zero_price_hint_is_treated_as_absent() {
        let t = tracker();
        let err = t
            .apply_signal(&key(), SignalAction::Buy, Some(0.0), 1.0, MNQ)
            .unwrap_err();
        assert_eq!(err.kind(), "no_price");
    }

    #[test]
    fn dca_without_price_uses_last_entry() {
        let t = tracker();
        t.apply_signal(&key(), SignalAction::Buy, Some(25600.0), 1.0, MNQ)
            .unwrap();
        let out = t
            .apply_signal(&key(), SignalAction::Buy, None, 1.0, MNQ)
            .unwrap();
        assert_eq!(out.transition, Transition::Dca);
        assert!((out.position_after.unwrap().avg_price - 25600.0).abs() < 1e-9);
    }

    #[test]
    fn market_data_fallback_beats_last_entry() {
        let t = PositionTracker::new(Arc::new(FixedMarket(25650.0)));
        let out = t
            .apply_signal(&key(), SignalAction::Buy, None, 1.0, MNQ)
            .unwrap();
        assert_eq!(out.position_after.unwrap().avg_price, 25650.0);
    }

    #[test]
    fn signal_authority_over_a_sequence() {
        // Net total equals |sum(buys) - sum(sells)| since the last flat.
        let t = tracker();
        let signals = [
            (SignalAction::Buy, 2.0),
            (SignalAction::Buy, 1.0),
            (SignalAction::Sell, 1.0),
            (SignalAction::Buy, 3.0),
            (SignalAction::Sell, 2.0),
        ];
        for (action, qty) in signals {
            t.apply_signal(&key(), action, Some(100.0), qty, MNQ)
                .unwrap();
        }
        let pos = t.get(&key()).unwrap();
        assert_eq!(pos.side, Side::Long);
        assert!((pos.total_qty - 3.0).abs() < 1e-9);
        assert_invariants(&pos);
    }

    #[test]
    fn shrink_to_matches_broker_partial_close() {
        let t = tracker();
        t.apply_signal(&key(), SignalAction::Buy, Some(100.0), 2.0, MNQ)
            .unwrap();
        t.apply_signal(&key(), SignalAction::Buy, Some(110.0), 2.0, MNQ)
            .unwrap();

        let pos = t.shrink_to(&key(), 1.0).unwrap();
        assert!((pos.total_qty - 1.0).abs() < 1e-9);
        assert!((pos.avg_price - 110.0).abs() < 1e-9);
        assert_invariants(&pos);

        // Shrinking to zero removes the position.
        assert!(t.shrink_to(&key(), 0.0).is_none());
        assert!(t.get(&key()).is_none());
    }

    #[test]
    fn entry_reprice_tracks_fill() {
        let t = tracker();
        t.apply_signal(&key(), SignalAction::Buy, Some(25600.0), 1.0, MNQ)
            .unwrap();
        let pos = t.update_last_entry_price(&key(), 25600.25).unwrap();
        assert!((pos.avg_price - 25600.25).abs() < 1e-9);
        assert_invariants(&pos);
        // Non-positive fills are ignored.
        assert!(t.update_last_entry_price(&key(), 0.0).is_none());
    }

    #[test]
    fn restore_rebuilds_open_positions() {
        let t = tracker();
        t.apply_signal(&key(), SignalAction::Buy, Some(100.0), 1.0, MNQ)
            .unwrap();
        let open = t.open_positions();

        let t2 = tracker();
        t2.restore(open);
        assert!(t2.get(&key()).is_some());
    }
}
