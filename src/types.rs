// =============================================================================
// Shared types used across the JetTrade execution engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Net direction of a virtual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
    Flat,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

/// Canonical action derived from a webhook alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Close,
}

impl SignalAction {
    /// The position side a non-CLOSE action opens or adds to.
    pub fn side(self) -> Side {
        match self {
            Self::Buy => Side::Long,
            Self::Sell => Side::Short,
            Self::Close => Side::Flat,
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

/// Buy/Sell as the broker wire format spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    /// The action that closes a position on `side`.
    pub fn closing(side: Side) -> Self {
        match side {
            Side::Long | Side::Flat => Self::Sell,
            Side::Short => Self::Buy,
        }
    }

    /// The action that opens a position on `side`.
    pub fn opening(side: Side) -> Self {
        match side {
            Side::Long | Side::Flat => Self::Buy,
            Side::Short => Self::Sell,
        }
    }

    /// Broker wire spelling ("Buy" / "Sell").
    pub fn wire(&self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire())
    }
}

/// Role an engine-placed order plays around a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderRole {
    Entry,
    Tp,
    Sl,
}

impl OrderRole {
    /// Tag spelling, upper-case.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Tp => "TP",
            Self::Sl => "SL",
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s {
            "ENTRY" => Some(Self::Entry),
            "TP" => Some(Self::Tp),
            "SL" => Some(Self::Sl),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Engine-side projection of a broker order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Working,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Parse a broker status string. The broker has been observed to spell
    /// "Canceled" with one L or two; both map to [`OrderStatus::Canceled`].
    /// Any status outside {Working, New, PendingNew} is terminal.
    pub fn parse(s: &str) -> Self {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "working" | "new" | "pendingnew" => Self::Working,
            "filled" | "completed" => Self::Filled,
            "canceled" | "cancelled" => Self::Canceled,
            "rejected" => Self::Rejected,
            "expired" => Self::Expired,
            // Unknown statuses are treated as terminal so stale bracket
            // bookkeeping never modifies an order the broker considers dead.
            _ => Self::Expired,
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(self, Self::Working)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_working()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Working => write!(f, "WORKING"),
            Self::Filled => write!(f, "FILLED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Broker environment. REST bases are disjoint; an account's orders and
/// positions are only visible at the base matching its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Demo,
    Live,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "demo"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// How a signal changed the virtual position it applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Opened,
    Dca,
    Trimmed,
    Flipped,
    Closed,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::Dca => write!(f, "dca"),
            Self::Trimmed => write!(f, "trimmed"),
            Self::Flipped => write!(f, "flipped"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Why a position was (or is being) flattened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TpFill,
    SlFill,
    OppositeSignal,
    CloseSignal,
    ManualBrokerClose,
    ReconcileFlatten,
    KillSwitch,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TpFill => "tp_fill",
            Self::SlFill => "sl_fill",
            Self::OppositeSignal => "opposite_signal",
            Self::CloseSignal => "close_signal",
            Self::ManualBrokerClose => "manual_broker_close",
            Self::ReconcileFlatten => "reconcile_flatten",
            Self::KillSwitch => "kill_switch",
        };
        write!(f, "{s}")
    }
}

/// Minimum price increment and its dollar value for a futures contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickSpec {
    pub tick_size: f64,
    pub tick_value: f64,
}

impl TickSpec {
    pub fn new(tick_size: f64, tick_value: f64) -> Self {
        Self {
            tick_size,
            tick_value,
        }
    }

    /// Dollar P&L for a price move of `points` over `qty` contracts.
    pub fn pnl(&self, points: f64, qty: f64) -> f64 {
        points * qty * (self.tick_value / self.tick_size)
    }
}

/// The key every position mutation serializes on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub recorder_id: String,
    pub ticker: String,
}

impl PositionKey {
    pub fn new(recorder_id: impl Into<String>, ticker: impl Into<String>) -> Self {
        Self {
            recorder_id: recorder_id.into(),
            ticker: ticker.into(),
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.recorder_id, self.ticker)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_accepts_both_cancel_spellings() {
        assert_eq!(OrderStatus::parse("Canceled"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::parse("Cancelled"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::parse("CANCELLED"), OrderStatus::Canceled);
    }

    #[test]
    fn order_status_working_set_is_case_insensitive() {
        for s in ["Working", "working", "NEW", "PendingNew", "PENDINGNEW"] {
            assert!(OrderStatus::parse(s).is_working(), "{s} should be working");
        }
    }

    #[test]
    fn unknown_status_is_terminal() {
        assert!(OrderStatus::parse("Suspended").is_terminal());
        assert!(OrderStatus::parse("").is_terminal());
    }

    #[test]
    fn closing_action_opposes_side() {
        assert_eq!(OrderAction::closing(Side::Long), OrderAction::Sell);
        assert_eq!(OrderAction::closing(Side::Short), OrderAction::Buy);
    }

    #[test]
    fn tick_spec_pnl_mnq() {
        // MNQ: 0.25 tick, $0.50 per tick => $2 per point.
        let spec = TickSpec::new(0.25, 0.50);
        let pnl = spec.pnl(25602.5 - 25600.25, 1.0);
        assert!((pnl - 4.50).abs() < 1e-9);
    }

    #[test]
    fn role_tag_roundtrip() {
        for role in [OrderRole::Entry, OrderRole::Tp, OrderRole::Sl] {
            assert_eq!(OrderRole::from_tag(role.tag()), Some(role));
        }
        assert_eq!(OrderRole::from_tag("TRAIL"), None);
    }
}
