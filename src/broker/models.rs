// =============================================================================
// Broker wire types and the order tag
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{OrderRole, OrderStatus};

// =============================================================================
// Order tag
// =============================================================================

/// Structured string placed in the broker's order-text field:
///
///   JT:{account_id}:{symbol}:{strategy_id}:{ROLE}:{seq}
///
/// The tag is how the reconciler attributes broker-side orders to this
/// engine and tells them apart from user-placed ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTag {
    pub account_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub role: OrderRole,
    pub seq: u64,
}

impl OrderTag {
    pub const PREFIX: &'static str = "JT";

    pub fn new(
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        strategy_id: impl Into<String>,
        role: OrderRole,
        seq: u64,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            symbol: symbol.into(),
            strategy_id: strategy_id.into(),
            role,
            seq,
        }
    }

    /// Parse an order-text field. Returns `None` for anything the engine did
    /// not place (user orders, other tools).
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split(':');
        if parts.next()? != Self::PREFIX {
            return None;
        }
        let account_id = parts.next()?.to_string();
        let symbol = parts.next()?.to_string();
        let strategy_id = parts.next()?.to_string();
        let role = OrderRole::from_tag(parts.next()?)?;
        let seq: u64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            account_id,
            symbol,
            strategy_id,
            role,
            seq,
        })
    }
}

impl std::fmt::Display for OrderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            Self::PREFIX,
            self.account_id,
            self.symbol,
            self.strategy_id,
            self.role.tag(),
            self.seq
        )
    }
}

// =============================================================================
// REST payloads
// =============================================================================

/// POST /order/place body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub account_id: String,
    /// "Buy" or "Sell".
    pub action: String,
    pub symbol: String,
    /// "Market", "Limit", or "Stop".
    pub order_type: String,
    pub order_qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    pub is_automated: bool,
    /// The order tag.
    pub text: String,
    /// "GTC" for brackets; unset for market orders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<String>,
}

/// POST /order/modify body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyOrderRequest {
    pub order_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

/// Success body from /order/place and /order/modify. A rejection instead
/// carries `failureReason`/`failureText`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failure_text: Option<String>,
}

/// One order as /account/{id}/orders and /order/{id} report it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerOrderView {
    pub id: i64,
    #[serde(default)]
    pub account_id: Option<String>,
    pub symbol: String,
    /// "Buy" / "Sell".
    pub action: String,
    pub ord_status: String,
    pub order_qty: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub text: Option<String>,
}

impl BrokerOrderView {
    pub fn status(&self) -> OrderStatus {
        OrderStatus::parse(&self.ord_status)
    }

    pub fn tag(&self) -> Option<OrderTag> {
        self.text.as_deref().and_then(OrderTag::parse)
    }
}

/// One net position as /account/{id}/positions reports it. `net_pos` is
/// signed: positive long, negative short, zero flat.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerPositionView {
    #[serde(default)]
    pub account_id: Option<String>,
    pub symbol: String,
    pub net_pos: f64,
    #[serde(default)]
    pub net_price: Option<f64>,
}

/// One contract from /contract/search.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractView {
    pub id: i64,
    /// Broker-format front-month name, e.g. "MNQU5".
    pub name: String,
}

/// Body from /auth/token.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until expiry.
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

// =============================================================================
// User-event stream frames
// =============================================================================

/// Events delivered on the per-account user WebSocket.
#[derive(Debug, Clone)]
pub enum UserEvent {
    Fill {
        order_id: i64,
        symbol: String,
        action: String,
        qty: f64,
        price: f64,
    },
    Order {
        order_id: i64,
        symbol: String,
        status: OrderStatus,
    },
    Position {
        symbol: String,
        net_pos: f64,
    },
}

impl UserEvent {
    /// Parse one newline-framed JSON event. Unknown event types yield `None`
    /// (heartbeat acks, subscription confirmations).
    pub fn parse(frame: &str) -> Option<Self> {
        let root: serde_json::Value = serde_json::from_str(frame.trim()).ok()?;
        let kind = root.get("e").and_then(|v| v.as_str())?;
        match kind {
            "fill" => Some(Self::Fill {
                order_id: root.get("orderId")?.as_i64()?,
                symbol: root.get("symbol")?.as_str()?.to_string(),
                action: root.get("action")?.as_str()?.to_string(),
                qty: root.get("qty")?.as_f64()?,
                price: root.get("price")?.as_f64()?,
            }),
            "order" => Some(Self::Order {
                order_id: root.get("orderId")?.as_i64()?,
                symbol: root.get("symbol")?.as_str()?.to_string(),
                status: OrderStatus::parse(root.get("ordStatus")?.as_str()?),
            }),
            "position" => Some(Self::Position {
                symbol: root.get("symbol")?.as_str()?.to_string(),
                net_pos: root.get("netPos")?.as_f64()?,
            }),
            _ => None,
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
    fn tag_roundtrip() {
        let tag = OrderTag::new("acct-7", "MNQU5", "rec-3", OrderRole::Tp, 12);
        let text = tag.to_string();
        assert_eq!(text, "JT:acct-7:MNQU5:rec-3:TP:12");
        assert_eq!(OrderTag::parse(&text), Some(tag));
    }

    #[test]
    fn tag_rejects_foreign_text() {
        assert!(OrderTag::parse("user note").is_none());
        assert!(OrderTag::parse("XX:a:s:r:TP:1").is_none());
        assert!(OrderTag::parse("JT:a:s:r:TRAIL:1").is_none());
        assert!(OrderTag::parse("JT:a:s:r:TP:notanumber").is_none());
        // Trailing garbage is not a tag.
        assert!(OrderTag::parse("JT:a:s:r:TP:1:extra").is_none());
    }

    #[test]
    fn place_request_serializes_camel_case() {
        let req = PlaceOrderRequest {
            account_id: "acct-7".into(),
            action: "Buy".into(),
            symbol: "MNQU5".into(),
            order_type: "Limit".into(),
            order_qty: 1.0,
            price: Some(25602.5),
            stop_price: None,
            is_automated: true,
            text: "JT:acct-7:MNQU5:rec-3:TP:1".into(),
            time_in_force: Some("GTC".into()),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["accountId"], "acct-7");
        assert_eq!(json["orderType"], "Limit");
        assert_eq!(json["isAutomated"], true);
        assert_eq!(json["timeInForce"], "GTC");
        assert!(json.get("stopPrice").is_none());
    }

    #[test]
    fn order_view_maps_status_and_tag() {
        let json = r#"{
            "id": 99,
            "symbol": "MNQU5",
            "action": "Sell",
            "ordStatus": "Cancelled",
            "orderQty": 1.0,
            "text": "JT:acct-7:MNQU5:rec-3:TP:4"
        }"#;
        let view: BrokerOrderView = serde_json::from_str(json).unwrap();
        assert_eq!(view.status(), OrderStatus::Canceled);
        let tag = view.tag().unwrap();
        assert_eq!(tag.role, OrderRole::Tp);
        assert_eq!(tag.seq, 4);
    }

    #[test]
    fn user_event_parse_fill_and_unknown() {
        let fill = r#"{"e":"fill","orderId":7,"symbol":"MNQU5","action":"Buy","qty":1.0,"price":25600.25}"#;
        match UserEvent::parse(fill) {
            Some(UserEvent::Fill {
                order_id, price, ..
            }) => {
                assert_eq!(order_id, 7);
                assert_eq!(price, 25600.25);
            }
            other => panic!("unexpected parse: {other:?}"),
        }

        assert!(UserEvent::parse(r#"{"e":"heartbeat"}"#).is_none());
        assert!(UserEvent::parse("not json").is_none());
    }
}
