// =============================================================================
// Persistent Store — signals, virtual positions, order projections, trades
// =============================================================================
//
// The engine owns these tables; everything else about persistence (schema
// migration tooling, dashboards) lives outside the core. Storage is one JSON
// document saved with the atomic tmp + rename pattern after every mutation.
// The broker stays authoritative for order status; rows here are projections
// updated from the user-event stream.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::tracker::{ClosedTrade, VirtualPosition};
use crate::types::{ExitReason, OrderAction, OrderRole, OrderStatus, SignalAction};

// =============================================================================
// Rows
// =============================================================================

/// Append-only record of one webhook delivery, accepted or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRow {
    pub id: String,
    pub recorder_id: String,
    pub received_at: DateTime<Utc>,
    pub ticker: String,
    pub action: SignalAction,
    pub qty: f64,
    pub price: Option<f64>,
    pub raw_payload: String,
    pub fingerprint: String,
    pub accepted: bool,
    pub reject_reason: Option<String>,
}

/// Closed-position history row. Open positions live in the tracker and are
/// mirrored here on every mutation so a restart can rebuild them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPositionRow {
    pub position: VirtualPosition,
    pub closed_at: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
}

/// Projection of one live (or once-live) broker order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRow {
    pub id: String,
    pub broker_order_id: i64,
    pub account_id: String,
    pub ticker: String,
    pub role: OrderRole,
    pub action: OrderAction,
    pub qty: f64,
    pub price: Option<f64>,
    pub tag: String,
    pub seq: u64,
    pub status: OrderStatus,
    pub placed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Realized trade derived from a closed (or trimmed) position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: String,
    pub virtual_position_id: String,
    pub recorder_id: String,
    pub ticker: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub qty: f64,
    pub pnl_usd: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl From<&ClosedTrade> for TradeRow {
    fn from(t: &ClosedTrade) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            virtual_position_id: t.position_id.clone(),
            recorder_id: t.recorder_id.clone(),
            ticker: t.ticker.clone(),
            entry_price: t.avg_entry_price,
            exit_price: t.exit_price,
            qty: t.qty,
            pnl_usd: t.pnl_usd,
            opened_at: t.opened_at,
            closed_at: t.closed_at,
        }
    }
}

// =============================================================================
// Document
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    signals: Vec<SignalRow>,
    #[serde(default)]
    open_positions: Vec<VirtualPosition>,
    #[serde(default)]
    closed_positions: Vec<ClosedPositionRow>,
    #[serde(default)]
    broker_orders: Vec<BrokerOrderRow>,
    #[serde(default)]
    trades: Vec<TradeRow>,
    /// Monotonic per-(account, symbol, role) tag sequence counters.
    #[serde(default)]
    tag_seqs: HashMap<String, u64>,
}

// =============================================================================
// Store
// =============================================================================

/// File-backed store. All mutation methods persist before returning;
/// persistence failures are logged, never propagated into the trading path.
pub struct TradeStore {
    path: PathBuf,
    doc: Mutex<StoreDoc>,
}

impl TradeStore {
    /// Load the store from `path`, or start empty when the file is missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse store at {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "store file missing — starting empty");
                StoreDoc::default()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read store at {}", path.display()))
            }
        };

        info!(
            path = %path.display(),
            signals = doc.signals.len(),
            open_positions = doc.open_positions.len(),
            trades = doc.trades.len(),
            "store opened"
        );

        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    fn persist(&self, doc: &StoreDoc) {
        let content = match serde_json::to_string(doc) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to serialise store");
                return;
            }
        };
        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) =
            std::fs::write(&tmp, &content).and_then(|_| std::fs::rename(&tmp, &self.path))
        {
            warn!(error = %e, path = %self.path.display(), "failed to persist store");
        }
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    pub fn record_signal(&self, row: SignalRow) {
        let mut doc = self.doc.lock();
        doc.signals.push(row);
        self.persist(&doc);
    }

    /// Count of accepted signals for a recorder since `since` (session cap).
    pub fn accepted_since(&self, recorder_id: &str, since: DateTime<Utc>) -> u32 {
        self.doc
            .lock()
            .signals
            .iter()
            .filter(|s| s.recorder_id == recorder_id && s.accepted && s.received_at >= since)
            .count() as u32
    }

    /// Timestamp of the most recent accepted signal for (recorder, ticker).
    pub fn last_accepted_at(&self, recorder_id: &str, ticker: &str) -> Option<DateTime<Utc>> {
        self.doc
            .lock()
            .signals
            .iter()
            .filter(|s| s.recorder_id == recorder_id && s.ticker == ticker && s.accepted)
            .map(|s| s.received_at)
            .max()
    }

    /// Total accepted signal count for a recorder, all time (delay-N filter).
    pub fn accepted_total(&self, recorder_id: &str) -> u64 {
        self.doc
            .lock()
            .signals
            .iter()
            .filter(|s| s.recorder_id == recorder_id && s.accepted)
            .count() as u64
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Mirror the current open position row (insert or replace by id).
    pub fn upsert_open_position(&self, pos: &VirtualPosition) {
        let mut doc = self.doc.lock();
        doc.open_positions.retain(|p| {
            !(p.recorder_id == pos.recorder_id && p.ticker == pos.ticker)
        });
        doc.open_positions.push(pos.clone());
        self.persist(&doc);
    }

    /// Move a position row from open to closed.
    pub fn close_position(
        &self,
        recorder_id: &str,
        ticker: &str,
        exit_price: f64,
        exit_reason: ExitReason,
    ) {
        let mut doc = self.doc.lock();
        let Some(idx) = doc
            .open_positions
            .iter()
            .position(|p| p.recorder_id == recorder_id && p.ticker == ticker)
        else {
            return;
        };
        let position = doc.open_positions.remove(idx);
        doc.closed_positions.push(ClosedPositionRow {
            position,
            closed_at: Utc::now(),
            exit_price,
            exit_reason,
        });
        self.persist(&doc);
    }

    pub fn open_position_rows(&self) -> Vec<VirtualPosition> {
        self.doc.lock().open_positions.clone()
    }

    // -------------------------------------------------------------------------
    // Broker orders
    // -------------------------------------------------------------------------

    pub fn record_order(&self, row: BrokerOrderRow) {
        let mut doc = self.doc.lock();
        doc.broker_orders.push(row);
        self.persist(&doc);
    }

    pub fn update_order(
        &self,
        broker_order_id: i64,
        status: OrderStatus,
        qty: Option<f64>,
        price: Option<f64>,
    ) {
        let mut doc = self.doc.lock();
        if let Some(row) = doc
            .broker_orders
            .iter_mut()
            .rev()
            .find(|o| o.broker_order_id == broker_order_id)
        {
            row.status = status;
            if let Some(q) = qty {
                row.qty = q;
            }
            if let Some(p) = price {
                row.price = Some(p);
            }
            row.updated_at = Utc::now();
            self.persist(&doc);
        }
    }

    pub fn order_by_broker_id(&self, broker_order_id: i64) -> Option<BrokerOrderRow> {
        self.doc
            .lock()
            .broker_orders
            .iter()
            .rev()
            .find(|o| o.broker_order_id == broker_order_id)
            .cloned()
    }

    /// Most recent projection for (account, ticker, role), any status.
    pub fn latest_order(
        &self,
        account_id: &str,
        ticker: &str,
        role: OrderRole,
    ) -> Option<BrokerOrderRow> {
        self.doc
            .lock()
            .broker_orders
            .iter()
            .rev()
            .find(|o| o.account_id == account_id && o.ticker == ticker && o.role == role)
            .cloned()
    }

    /// All rows the engine still believes are working for (account, ticker).
    pub fn working_orders(&self, account_id: &str, ticker: &str) -> Vec<BrokerOrderRow> {
        self.doc
            .lock()
            .broker_orders
            .iter()
            .filter(|o| {
                o.account_id == account_id && o.ticker == ticker && o.status.is_working()
            })
            .cloned()
            .collect()
    }

    /// Next tag sequence for (account, symbol, role). Monotonic, persisted.
    pub fn next_seq(&self, account_id: &str, ticker: &str, role: OrderRole) -> u64 {
        let mut doc = self.doc.lock();
        let key = format!("{account_id}:{ticker}:{}", role.tag());
        let counter = doc.tag_seqs.entry(key).or_insert(0);
        *counter += 1;
        let seq = *counter;
        self.persist(&doc);
        seq
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    pub fn record_trade(&self, row: TradeRow) {
        let mut doc = self.doc.lock();
        doc.trades.push(row);
        self.persist(&doc);
    }

    /// Session realized P&L for a recorder since `since` (daily-loss filter).
    pub fn realized_pnl_since(&self, recorder_id: &str, since: DateTime<Utc>) -> f64 {
        self.doc
            .lock()
            .trades
            .iter()
            .filter(|t| t.recorder_id == recorder_id && t.closed_at >= since)
            .map(|t| t.pnl_usd)
            .sum()
    }
}

impl std::fmt::Debug for TradeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let doc = self.doc.lock();
        f.debug_struct("TradeStore")
            .field("signals", &doc.signals.len())
            .field("open_positions", &doc.open_positions.len())
            .field("broker_orders", &doc.broker_orders.len())
            .field("trades", &doc.trades.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Entry;
    use crate::types::Side;

    fn temp_store() -> TradeStore {
        let path = std::env::temp_dir().join(format!("jettrade-store-{}.json", Uuid::new_v4()));
        TradeStore::open(path).unwrap()
    }

    fn signal_row(recorder: &str, ticker: &str, accepted: bool) -> SignalRow {
        SignalRow {
            id: Uuid::new_v4().to_string(),
            recorder_id: recorder.into(),
            received_at: Utc::now(),
            ticker: ticker.into(),
            action: SignalAction::Buy,
            qty: 1.0,
            price: Some(25600.0),
            raw_payload: "{}".into(),
            fingerprint: "fp".into(),
            accepted,
            reject_reason: None,
        }
    }

    fn position(recorder: &str, ticker: &str) -> VirtualPosition {
        VirtualPosition {
            id: Uuid::new_v4().to_string(),
            recorder_id: recorder.into(),
            ticker: ticker.into(),
            side: Side::Long,
            total_qty: 1.0,
            avg_price: 25600.0,
            entries: vec![Entry {
                price: 25600.0,
                qty: 1.0,
                ts: Utc::now(),
            }],
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn signals_are_append_only_and_counted() {
        let store = temp_store();
        store.record_signal(signal_row("r-1", "MNQU5", true));
        store.record_signal(signal_row("r-1", "MNQU5", false));
        store.record_signal(signal_row("r-2", "MESU5", true));

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.accepted_since("r-1", hour_ago), 1);
        assert_eq!(store.accepted_total("r-1"), 1);
        assert!(store.last_accepted_at("r-1", "MNQU5").is_some());
        assert!(store.last_accepted_at("r-1", "MESU5").is_none());
    }

    #[test]
    fn open_position_upsert_replaces_by_key() {
        let store = temp_store();
        store.upsert_open_position(&position("r-1", "MNQU5"));
        let mut updated = position("r-1", "MNQU5");
        updated.total_qty = 2.0;
        store.upsert_open_position(&updated);

        let rows = store.open_position_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_qty, 2.0);
    }

    #[test]
    fn close_moves_row_out_of_open() {
        let store = temp_store();
        store.upsert_open_position(&position("r-1", "MNQU5"));
        store.close_position("r-1", "MNQU5", 25602.5, ExitReason::TpFill);
        assert!(store.open_position_rows().is_empty());
    }

    #[test]
    fn tag_seq_is_monotonic_per_key() {
        let store = temp_store();
        assert_eq!(store.next_seq("a-1", "MNQU5", OrderRole::Tp), 1);
        assert_eq!(store.next_seq("a-1", "MNQU5", OrderRole::Tp), 2);
        // Different role gets its own counter.
        assert_eq!(store.next_seq("a-1", "MNQU5", OrderRole::Sl), 1);
        assert_eq!(store.next_seq("a-2", "MNQU5", OrderRole::Tp), 1);
    }

    #[test]
    fn order_update_touches_latest_row() {
        let store = temp_store();
        let row = BrokerOrderRow {
            id: Uuid::new_v4().to_string(),
            broker_order_id: 42,
            account_id: "a-1".into(),
            ticker: "MNQU5".into(),
            role: OrderRole::Tp,
            action: OrderAction::Sell,
            qty: 1.0,
            price: Some(25602.5),
            tag: "JT:a-1:MNQU5:r-1:TP:1".into(),
            seq: 1,
            status: OrderStatus::Working,
            placed_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.record_order(row);

        store.update_order(42, OrderStatus::Filled, None, None);
        let row = store.order_by_broker_id(42).unwrap();
        assert_eq!(row.status, OrderStatus::Filled);
        assert!(store.working_orders("a-1", "MNQU5").is_empty());
    }

    #[test]
    fn realized_pnl_sums_by_recorder() {
        let store = temp_store();
        let closed = ClosedTrade {
            position_id: "p-1".into(),
            recorder_id: "r-1".into(),
            ticker: "MNQU5".into(),
            side: Side::Long,
            qty: 1.0,
            avg_entry_price: 25600.25,
            exit_price: 25602.5,
            pnl_usd: 4.50,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            reason: ExitReason::TpFill,
        };
        store.record_trade(TradeRow::from(&closed));
        let mut losing = closed.clone();
        losing.pnl_usd = -10.0;
        store.record_trade(TradeRow::from(&losing));

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        assert!((store.realized_pnl_since("r-1", hour_ago) + 5.50).abs() < 1e-9);
        assert_eq!(store.realized_pnl_since("r-2", hour_ago), 0.0);
    }

    #[test]
    fn store_reloads_from_disk() {
        let path = std::env::temp_dir().join(format!("jettrade-store-{}.json", Uuid::new_v4()));
        {
            let store = TradeStore::open(&path).unwrap();
            store.record_signal(signal_row("r-1", "MNQU5", true));
            store.upsert_open_position(&position("r-1", "MNQU5"));
        }
        let store = TradeStore::open(&path).unwrap();
        assert_eq!(store.accepted_total("r-1"), 1);
        assert_eq!(store.open_position_rows().len(), 1);
    }
}
