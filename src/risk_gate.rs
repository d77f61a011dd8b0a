// =============================================================================
// Risk Gate — ordered filter chain evaluated per incoming signal
// =============================================================================
//
// Filters run in the listed order; the first failure rejects the signal with
// a structured {filter_name, reason} and no broker action is taken:
//
//   1. direction        2. time windows      3. cooldown
//   4. max per session  5. max daily loss    6. max contracts (caps, not rejects)
//   7. signal delay (every Nth)
//
// CLOSE signals bypass the gate: they only ever reduce exposure, and blocking
// one would strand an open position.
//
// The trading session rolls at a configured local hour (default 17:00
// America/Chicago, the futures convention); per-session counters and the
// daily-loss ledger reset there.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use tracing::debug;

use crate::directory::{Recorder, TimeWindow};
use crate::error::{EngineError, EngineResult};
use crate::store::TradeStore;
use crate::types::SignalAction;

// =============================================================================
// Session boundary
// =============================================================================

/// Start of the trading session containing `now`: the most recent occurrence
/// of `close_hour:00` in `tz` at or before `now`.
pub fn session_start(now: DateTime<Utc>, tz: Tz, close_hour: u32) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let today_boundary = tz
        .with_ymd_and_hms(local.year(), local.month(), local.day(), close_hour, 0, 0)
        .single()
        // DST gap at the boundary hour; fall back to the UTC-naive boundary.
        .unwrap_or_else(|| local - Duration::hours(24));

    let start = if local >= today_boundary {
        today_boundary
    } else {
        today_boundary - Duration::days(1)
    };
    start.with_timezone(&Utc)
}

// =============================================================================
// Gate
// =============================================================================

/// Outcome of a passed gate: the (possibly capped) quantity to trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatePass {
    pub qty: f64,
}

pub struct RiskGate {
    store: Arc<TradeStore>,
    session_tz: Tz,
    session_close_hour: u32,
    /// Per-recorder counter backing the every-Nth filter.
    delay_counters: Mutex<HashMap<String, u64>>,
}

impl RiskGate {
    pub fn new(store: Arc<TradeStore>, session_tz: Tz, session_close_hour: u32) -> Self {
        Self {
            store,
            session_tz,
            session_close_hour,
            delay_counters: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate the chain for one parsed signal. `qty` is the signal's
    /// quantity hint falling back to the recorder's base size.
    pub fn evaluate(
        &self,
        recorder: &Recorder,
        ticker: &str,
        action: SignalAction,
        qty: Option<f64>,
        now: DateTime<Utc>,
    ) -> EngineResult<GatePass> {
        let mut qty = qty.unwrap_or(recorder.base_qty);

        if action == SignalAction::Close {
            return Ok(GatePass { qty });
        }

        let f = &recorder.filters;

        // --- 1. Direction ----------------------------------------------------
        match action {
            SignalAction::Buy if !f.allow_long => {
                return Err(blocked("direction", "long signals disabled"));
            }
            SignalAction::Sell if !f.allow_short => {
                return Err(blocked("direction", "short signals disabled"));
            }
            _ => {}
        }

        // --- 2. Time windows -------------------------------------------------
        if !f.time_windows.is_empty()
            && !f.time_windows.iter().any(|w| window_contains(w, now))
        {
            return Err(blocked("time", "outside all configured trading windows"));
        }

        // --- 3. Cooldown -----------------------------------------------------
        if f.cooldown_seconds > 0 {
            if let Some(last) = self.store.last_accepted_at(&recorder.id, ticker) {
                let elapsed = (now - last).num_seconds();
                if elapsed >= 0 && (elapsed as u64) < f.cooldown_seconds {
                    return Err(blocked(
                        "cooldown",
                        format!(
                            "{elapsed}s since last accepted signal (minimum {}s)",
                            f.cooldown_seconds
                        ),
                    ));
                }
            }
        }

        let session_start = session_start(now, self.session_tz, self.session_close_hour);

        // --- 4. Max signals per session --------------------------------------
        if f.max_per_session > 0 {
            let accepted = self.store.accepted_since(&recorder.id, session_start);
            if accepted >= f.max_per_session {
                return Err(blocked(
                    "max_per_session",
                    format!("{accepted} signals already accepted this session"),
                ));
            }
        }

        // --- 5. Max daily loss -----------------------------------------------
        if f.max_daily_loss_usd > 0.0 {
            let pnl = self.store.realized_pnl_since(&recorder.id, session_start);
            if pnl <= -f.max_daily_loss_usd {
                return Err(blocked(
                    "max_daily_loss",
                    format!("session P&L {pnl:.2} breaches -{:.2}", f.max_daily_loss_usd),
                ));
            }
        }

        // --- 6. Max contracts per trade (caps, never rejects) ----------------
        if f.max_contracts > 0.0 && qty > f.max_contracts {
            debug!(
                recorder_id = %recorder.id,
                requested = qty,
                cap = f.max_contracts,
                "quantity capped by max_contracts"
            );
            qty = f.max_contracts;
        }

        // --- 7. Signal delay (every Nth) -------------------------------------
        if f.delay_n > 1 {
            let mut counters = self.delay_counters.lock();
            let count = counters.entry(recorder.id.clone()).or_insert(0);
            *count += 1;
            if *count % f.delay_n as u64 != 0 {
                return Err(blocked(
                    "signal_delay",
                    format!("signal {count} of every-{} cadence", f.delay_n),
                ));
            }
        }

        Ok(GatePass { qty })
    }
}

impl std::fmt::Debug for RiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGate")
            .field("session_tz", &self.session_tz.name())
            .field("session_close_hour", &self.session_close_hour)
            .finish()
    }
}

fn blocked(filter: &'static str, reason: impl Into<String>) -> EngineError {
    EngineError::FilterBlocked {
        filter,
        reason: reason.into(),
    }
}

// =============================================================================
// Time-window evaluation
// =============================================================================

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some((h, m))
}

fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_monday() as u8
}

/// Whether `now` falls inside the window. Windows crossing midnight
/// ("18:00".."02:00") wrap; the weekday check applies to the start side.
pub fn window_contains(window: &TimeWindow, now: DateTime<Utc>) -> bool {
    let Ok(tz) = window.timezone.parse::<Tz>() else {
        return false;
    };
    let (Some((sh, sm)), Some((eh, em))) = (parse_hhmm(&window.start), parse_hhmm(&window.end))
    else {
        return false;
    };

    let local = now.with_timezone(&tz);
    let minutes = local.hour() * 60 + local.minute();
    let start = sh * 60 + sm;
    let end = eh * 60 + em;

    let (in_time, effective_day) = if start <= end {
        (minutes >= start && minutes < end, local.weekday())
    } else {
        // Overnight window: the portion after midnight belongs to the
        // previous calendar day's session.
        if minutes >= start {
            (true, local.weekday())
        } else {
            (minutes < end, local.weekday().pred())
        }
    };

    if !in_time {
        return false;
    }
    window.days_of_week.is_empty()
        || window.days_of_week.contains(&weekday_index(effective_day))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::FilterConfig;
    use uuid::Uuid;

    fn store() -> Arc<TradeStore> {
        let path = std::env::temp_dir().join(format!("jettrade-gate-{}.json", Uuid::new_v4()));
        Arc::new(TradeStore::open(path).unwrap())
    }

    fn gate(store: Arc<TradeStore>) -> RiskGate {
        RiskGate::new(store, chrono_tz::America::Chicago, 17)
    }

    fn recorder(filters: FilterConfig) -> Recorder {
        Recorder {
            id: "r-1".into(),
            webhook_token: "tok".into(),
            symbol: "MNQ1!".into(),
            base_qty: 1.0,
            add_qty: 1.0,
            tp_ticks: 10,
            sl_ticks: 20,
            sl_enabled: false,
            enabled: true,
            private: false,
            filters,
        }
    }

    #[test]
    fn session_start_rolls_at_17_chicago() {
        let tz = chrono_tz::America::Chicago;
        // 2026-08-03 16:30 Chicago is still Monday's (i.e. Sunday 17:00) session.
        let before = tz.with_ymd_and_hms(2026, 8, 3, 16, 30, 0).unwrap().with_timezone(&Utc);
        let start = session_start(before, tz, 17);
        let expected = tz.with_ymd_and_hms(2026, 8, 2, 17, 0, 0).unwrap().with_timezone(&Utc);
        assert_eq!(start, expected);

        // 17:30 has rolled into the next session.
        let after = tz.with_ymd_and_hms(2026, 8, 3, 17, 30, 0).unwrap().with_timezone(&Utc);
        let start = session_start(after, tz, 17);
        let expected = tz.with_ymd_and_hms(2026, 8, 3, 17, 0, 0).unwrap().with_timezone(&Utc);
        assert_eq!(start, expected);
    }

    #[test]
    fn direction_filter_blocks_disallowed_side() {
        let g = gate(store());
        let r = recorder(FilterConfig {
            allow_long: false,
            ..Default::default()
        });
        let err = g
            .evaluate(&r, "MNQU5", SignalAction::Buy, None, Utc::now())
            .unwrap_err();
        match err {
            EngineError::FilterBlocked { filter, .. } => assert_eq!(filter, "direction"),
            other => panic!("unexpected error: {other}"),
        }
        // Sells still pass.
        assert!(g
            .evaluate(&r, "MNQU5", SignalAction::Sell, None, Utc::now())
            .is_ok());
    }

    #[test]
    fn close_bypasses_every_filter() {
        let g = gate(store());
        let r = recorder(FilterConfig {
            allow_long: false,
            allow_short: false,
            delay_n: 10,
            ..Default::default()
        });
        assert!(g
            .evaluate(&r, "MNQU5", SignalAction::Close, None, Utc::now())
            .is_ok());
    }

    #[test]
    fn time_window_gates_by_hour_and_day() {
        let window = TimeWindow {
            start: "08:30".into(),
            end: "15:00".into(),
            timezone: "America/Chicago".into(),
            days_of_week: vec![0, 1, 2, 3, 4],
        };
        let tz = chrono_tz::America::Chicago;

        // Tuesday 2026-08-04 10:00 Chicago: inside.
        let inside = tz.with_ymd_and_hms(2026, 8, 4, 10, 0, 0).unwrap().with_timezone(&Utc);
        assert!(window_contains(&window, inside));

        // Tuesday 16:00: outside hours.
        let late = tz.with_ymd_and_hms(2026, 8, 4, 16, 0, 0).unwrap().with_timezone(&Utc);
        assert!(!window_contains(&window, late));

        // Saturday 10:00: outside days.
        let weekend = tz.with_ymd_and_hms(2026, 8, 8, 10, 0, 0).unwrap().with_timezone(&Utc);
        assert!(!window_contains(&window, weekend));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let window = TimeWindow {
            start: "18:00".into(),
            end: "02:00".into(),
            timezone: "America/Chicago".into(),
            days_of_week: vec![],
        };
        let tz = chrono_tz::America::Chicago;

        let evening = tz.with_ymd_and_hms(2026, 8, 4, 22, 0, 0).unwrap().with_timezone(&Utc);
        assert!(window_contains(&window, evening));

        let past_midnight = tz.with_ymd_and_hms(2026, 8, 5, 1, 0, 0).unwrap().with_timezone(&Utc);
        assert!(window_contains(&window, past_midnight));

        let midday = tz.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap().with_timezone(&Utc);
        assert!(!window_contains(&window, midday));
    }

    #[test]
    fn max_contracts_caps_without_rejecting() {
        let g = gate(store());
        let r = recorder(FilterConfig {
            max_contracts: 2.0,
            ..Default::default()
        });
        let pass = g
            .evaluate(&r, "MNQU5", SignalAction::Buy, Some(5.0), Utc::now())
            .unwrap();
        assert_eq!(pass.qty, 2.0);

        let pass = g
            .evaluate(&r, "MNQU5", SignalAction::Buy, Some(1.0), Utc::now())
            .unwrap();
        assert_eq!(pass.qty, 1.0);
    }

    #[test]
    fn delay_filter_accepts_every_nth() {
        let g = gate(store());
        let r = recorder(FilterConfig {
            delay_n: 3,
            ..Default::default()
        });
        let now = Utc::now();
        assert!(g.evaluate(&r, "MNQU5", SignalAction::Buy, None, now).is_err());
        assert!(g.evaluate(&r, "MNQU5", SignalAction::Buy, None, now).is_err());
        assert!(g.evaluate(&r, "MNQU5", SignalAction::Buy, None, now).is_ok());
        assert!(g.evaluate(&r, "MNQU5", SignalAction::Buy, None, now).is_err());
    }

    #[test]
    fn cooldown_uses_last_accepted_signal() {
        let s = store();
        let g = gate(s.clone());
        let r = recorder(FilterConfig {
            cooldown_seconds: 60,
            ..Default::default()
        });
        let now = Utc::now();

        // Nothing accepted yet: passes.
        assert!(g.evaluate(&r, "MNQU5", SignalAction::Buy, None, now).is_ok());

        s.record_signal(crate::store::SignalRow {
            id: "s-1".into(),
            recorder_id: "r-1".into(),
            received_at: now,
            ticker: "MNQU5".into(),
            action: SignalAction::Buy,
            qty: 1.0,
            price: None,
            raw_payload: "{}".into(),
            fingerprint: "fp".into(),
            accepted: true,
            reject_reason: None,
        });

        let err = g
            .evaluate(&r, "MNQU5", SignalAction::Buy, None, now + Duration::seconds(30))
            .unwrap_err();
        match err {
            EngineError::FilterBlocked { filter, .. } => assert_eq!(filter, "cooldown"),
            other => panic!("unexpected error: {other}"),
        }

        assert!(g
            .evaluate(&r, "MNQU5", SignalAction::Buy, None, now + Duration::seconds(61))
            .is_ok());
    }

    #[test]
    fn daily_loss_blocks_after_breach() {
        let s = store();
        let g = gate(s.clone());
        let r = recorder(FilterConfig {
            max_daily_loss_usd: 100.0,
            ..Default::default()
        });

        s.record_trade(crate::store::TradeRow {
            id: "t-1".into(),
            virtual_position_id: "p-1".into(),
            recorder_id: "r-1".into(),
            ticker: "MNQU5".into(),
            entry_price: 25600.0,
            exit_price: 25500.0,
            qty: 1.0,
            pnl_usd: -150.0,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        });

        let err = g
            .evaluate(&r, "MNQU5", SignalAction::Buy, None, Utc::now())
            .unwrap_err();
        match err {
            EngineError::FilterBlocked { filter, .. } => assert_eq!(filter, "max_daily_loss"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn max_per_session_counts_accepted_rows() {
        let s = store();
        let g = gate(s.clone());
        let r = recorder(FilterConfig {
            max_per_session: 1,
            ..Default::default()
        });
        let now = Utc::now();

        assert!(g.evaluate(&r, "MNQU5", SignalAction::Buy, None, now).is_ok());

        s.record_signal(crate::store::SignalRow {
            id: "s-1".into(),
            recorder_id: "r-1".into(),
            received_at: now,
            ticker: "MNQU5".into(),
            action: SignalAction::Buy,
            qty: 1.0,
            price: None,
            raw_payload: "{}".into(),
            fingerprint: "fp".into(),
            accepted: true,
            reject_reason: None,
        });

        let err = g
            .evaluate(&r, "MNQU5", SignalAction::Buy, None, now)
            .unwrap_err();
        match err {
            EngineError::FilterBlocked { filter, .. } => {
                assert_eq!(filter, "max_per_session")
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
