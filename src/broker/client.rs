// =============================================================================
// Broker REST Client — typed wrapper over the broker's order/position API
// =============================================================================
//
// A client is bound to exactly one environment at construction and every URL
// it builds starts at that base. Positions and orders are only visible at the
// base matching the account's environment; an empty response from the right
// base is a valid answer and is propagated unchanged. There is deliberately
// no "try the other base" path anywhere in this file.
//
// SECURITY: access tokens travel in the Authorization header only and are
// never logged; the Debug impl redacts everything sensitive.
// =============================================================================

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::broker::models::{
    BrokerOrderView, BrokerPositionView, ContractView, ModifyOrderRequest, OrderResponse,
    PlaceOrderRequest,
};
use crate::broker::token::TokenCache;
use crate::error::{EngineError, EngineResult};
use crate::types::{Environment, OrderAction, OrderStatus};

/// Everything needed to place one order.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub action: OrderAction,
    pub symbol: String,
    /// "Market", "Limit", or "Stop".
    pub order_type: &'static str,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub tag: String,
    /// "GTC" for brackets; None lets the broker default (Day) apply.
    pub time_in_force: Option<&'static str>,
}

impl OrderTicket {
    pub fn market(action: OrderAction, symbol: impl Into<String>, qty: f64, tag: String) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            order_type: "Market",
            qty,
            price: None,
            stop_price: None,
            tag,
            time_in_force: None,
        }
    }

    pub fn limit(
        action: OrderAction,
        symbol: impl Into<String>,
        qty: f64,
        price: f64,
        tag: String,
    ) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            order_type: "Limit",
            qty,
            price: Some(price),
            stop_price: None,
            tag,
            time_in_force: Some("GTC"),
        }
    }

    pub fn stop(
        action: OrderAction,
        symbol: impl Into<String>,
        qty: f64,
        stop_price: f64,
        tag: String,
    ) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            order_type: "Stop",
            qty,
            price: None,
            stop_price: Some(stop_price),
            tag,
            time_in_force: Some("GTC"),
        }
    }
}

/// REST client for one broker environment.
#[derive(Clone)]
pub struct BrokerClient {
    environment: Environment,
    base_url: String,
    tokens: Arc<TokenCache>,
    http: reqwest::Client,
}

impl BrokerClient {
    pub fn new(environment: Environment, tokens: Arc<TokenCache>) -> Self {
        Self::with_base(environment, super::rest_base(environment), tokens)
    }

    /// Explicit base, used by tests to point at a local fixture.
    pub fn with_base(
        environment: Environment,
        base_url: impl Into<String>,
        tokens: Arc<TokenCache>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            environment,
            base_url: base_url.into(),
            tokens,
            http,
        }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the absolute URL for `path`. Every request goes through here so
    /// the endpoint-partitioning property is a one-line check.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // -------------------------------------------------------------------------
    // Core request plumbing
    // -------------------------------------------------------------------------

    /// Send an authorized request; on 401 force one token refresh and retry
    /// once, then surface AuthRequired.
    async fn authed<T: DeserializeOwned>(
        &self,
        account_id: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> EngineResult<T> {
        let mut refreshed = false;
        loop {
            let token = match self.tokens.access_token(account_id) {
                Ok(t) => t,
                Err(EngineError::AuthExpired(_)) if !refreshed => {
                    refreshed = true;
                    self.tokens.refresh_account(account_id).await?
                }
                Err(e) => return Err(e),
            };

            let mut req = self
                .http
                .request(method.clone(), self.url(path))
                .bearer_auth(&token);
            if let Some(ref b) = body {
                req = req.json(b);
            }

            let resp = req.send().await.map_err(EngineError::from)?;
            let status = resp.status();

            if status == reqwest::StatusCode::UNAUTHORIZED {
                if refreshed {
                    return Err(EngineError::AuthRequired(account_id.to_string()));
                }
                refreshed = true;
                self.tokens.refresh_account(account_id).await?;
                continue;
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(EngineError::RateLimited(account_id.to_string()));
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(EngineError::Transient(format!(
                    "{method} {path} returned {status}: {text}"
                )));
            }

            return resp.json::<T>().await.map_err(EngineError::from);
        }
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /order/place. Returns `(order_id, status)`; a broker rejection
    /// surfaces as BrokerRejected with the broker's reason, no retry.
    #[instrument(skip(self, ticket), fields(symbol = %ticket.symbol, action = %ticket.action), name = "broker::place_order")]
    pub async fn place_order(
        &self,
        account_id: &str,
        ticket: &OrderTicket,
    ) -> EngineResult<(i64, OrderStatus)> {
        let req = PlaceOrderRequest {
            account_id: account_id.to_string(),
            action: ticket.action.wire().to_string(),
            symbol: ticket.symbol.clone(),
            order_type: ticket.order_type.to_string(),
            order_qty: ticket.qty,
            price: ticket.price,
            stop_price: ticket.stop_price,
            is_automated: true,
            text: ticket.tag.clone(),
            time_in_force: ticket.time_in_force.map(|s| s.to_string()),
        };

        debug!(
            order_type = ticket.order_type,
            qty = ticket.qty,
            price = ?ticket.price,
            "placing order"
        );

        let resp: OrderResponse = self
            .authed(
                account_id,
                reqwest::Method::POST,
                "/order/place",
                Some(serde_json::to_value(&req).expect("place request serialises")),
            )
            .await?;

        match (resp.order_id, resp.failure_reason) {
            (Some(id), None) => {
                let status = resp
                    .status
                    .as_deref()
                    .map(OrderStatus::parse)
                    .unwrap_or(OrderStatus::Working);
                debug!(order_id = id, %status, "order placed");
                Ok((id, status))
            }
            (_, Some(reason)) => {
                warn!(%reason, text = ?resp.failure_text, "broker rejected order");
                Err(EngineError::BrokerRejected {
                    reason,
                    text: resp.failure_text,
                })
            }
            (None, None) => Err(EngineError::Transient(
                "order response had neither orderId nor failureReason".into(),
            )),
        }
    }

    /// POST /order/modify — re-price and/or re-size a working order in place.
    #[instrument(skip(self), name = "broker::modify_order")]
    pub async fn modify_order(
        &self,
        account_id: &str,
        order_id: i64,
        new_qty: Option<f64>,
        new_price: Option<f64>,
    ) -> EngineResult<()> {
        let req = ModifyOrderRequest {
            order_id,
            order_qty: new_qty,
            price: new_price,
        };
        let resp: OrderResponse = self
            .authed(
                account_id,
                reqwest::Method::POST,
                "/order/modify",
                Some(serde_json::to_value(&req).expect("modify request serialises")),
            )
            .await?;

        if let Some(reason) = resp.failure_reason {
            return Err(EngineError::BrokerRejected {
                reason,
                text: resp.failure_text,
            });
        }
        debug!(order_id, "order modified");
        Ok(())
    }

    /// POST /order/cancel.
    #[instrument(skip(self), name = "broker::cancel_order")]
    pub async fn cancel_order(&self, account_id: &str, order_id: i64) -> EngineResult<()> {
        let body = serde_json::json!({ "orderId": order_id });
        let resp: OrderResponse = self
            .authed(account_id, reqwest::Method::POST, "/order/cancel", Some(body))
            .await?;

        if let Some(reason) = resp.failure_reason {
            return Err(EngineError::BrokerRejected {
                reason,
                text: resp.failure_text,
            });
        }
        debug!(order_id, "order canceled");
        Ok(())
    }

    /// GET /order/{id}.
    #[instrument(skip(self), name = "broker::get_order")]
    pub async fn get_order(
        &self,
        account_id: &str,
        order_id: i64,
    ) -> EngineResult<BrokerOrderView> {
        self.authed(
            account_id,
            reqwest::Method::GET,
            &format!("/order/{order_id}"),
            None,
        )
        .await
    }

    /// GET /account/{id}/orders — working orders for the account.
    #[instrument(skip(self), name = "broker::list_orders")]
    pub async fn list_orders(&self, account_id: &str) -> EngineResult<Vec<BrokerOrderView>> {
        self.authed(
            account_id,
            reqwest::Method::GET,
            &format!("/account/{account_id}/orders"),
            None,
        )
        .await
    }

    /// GET /account/{id}/positions. An empty list means flat, full stop.
    #[instrument(skip(self), name = "broker::list_positions")]
    pub async fn list_positions(
        &self,
        account_id: &str,
    ) -> EngineResult<Vec<BrokerPositionView>> {
        self.authed(
            account_id,
            reqwest::Method::GET,
            &format!("/account/{account_id}/positions"),
            None,
        )
        .await
    }

    /// GET /contract/search?name= — resolve a symbol root to the front-month
    /// contract.
    #[instrument(skip(self), name = "broker::search_contract")]
    pub async fn search_contract(
        &self,
        account_id: &str,
        root: &str,
    ) -> EngineResult<Vec<ContractView>> {
        self.authed(
            account_id,
            reqwest::Method::GET,
            &format!("/contract/search?name={root}"),
            None,
        )
        .await
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("environment", &self.environment)
            .field("base_url", &self.base_url)
            .field("tokens", &"<TokenCache>")
            .finish()
    }
}

// =============================================================================
// Router
// =============================================================================

/// One client per environment. Account routing happens here, once, by the
/// account's declared environment — never by probing.
pub struct BrokerRouter {
    demo: BrokerClient,
    live: BrokerClient,
}

impl BrokerRouter {
    pub fn new(tokens: Arc<TokenCache>) -> Self {
        Self {
            demo: BrokerClient::new(Environment::Demo, tokens.clone()),
            live: BrokerClient::new(Environment::Live, tokens),
        }
    }

    pub fn client_for(&self, environment: Environment) -> &BrokerClient {
        match environment {
            Environment::Demo => &self.demo,
            Environment::Live => &self.live,
        }
    }
}

impl std::fmt::Debug for BrokerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRouter").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::directory::FileDirectory;

    fn tokens() -> Arc<TokenCache> {
        Arc::new(TokenCache::new(
            Arc::new(FileDirectory::empty("unused.json")),
            EventBus::new(),
        ))
    }

    #[test]
    fn client_url_always_starts_at_its_base() {
        // Endpoint-partitioning property: every URL a client builds begins
        // with the base of the environment it was constructed for.
        let demo = BrokerClient::new(Environment::Demo, tokens());
        let live = BrokerClient::new(Environment::Live, tokens());

        for path in [
            "/order/place",
            "/order/modify",
            "/order/cancel",
            "/order/42",
            "/account/a-1/orders",
            "/account/a-1/positions",
            "/contract/search?name=MNQ",
            "/auth/token",
        ] {
            assert!(demo.url(path).starts_with(super::super::rest_base(Environment::Demo)));
            assert!(live.url(path).starts_with(super::super::rest_base(Environment::Live)));
            assert!(!demo.url(path).contains("live."));
        }
    }

    #[test]
    fn router_is_keyed_by_environment_only() {
        let router = BrokerRouter::new(tokens());
        assert_eq!(
            router.client_for(Environment::Demo).environment(),
            Environment::Demo
        );
        assert_eq!(
            router.client_for(Environment::Live).environment(),
            Environment::Live
        );
    }

    #[test]
    fn ticket_constructors_set_order_type_and_tif() {
        let market = OrderTicket::market(OrderAction::Buy, "MNQU5", 1.0, "tag".into());
        assert_eq!(market.order_type, "Market");
        assert!(market.time_in_force.is_none());
        assert!(market.price.is_none());

        let limit = OrderTicket::limit(OrderAction::Sell, "MNQU5", 1.0, 25602.5, "tag".into());
        assert_eq!(limit.order_type, "Limit");
        assert_eq!(limit.time_in_force, Some("GTC"));
        assert_eq!(limit.price, Some(25602.5));

        let stop = OrderTicket::stop(OrderAction::Sell, "MNQU5", 1.0, 25595.0, "tag".into());
        assert_eq!(stop.order_type, "Stop");
        assert_eq!(stop.stop_price, Some(25595.0));
        assert!(stop.price.is_none());
    }
}
