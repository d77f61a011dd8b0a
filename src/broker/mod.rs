// =============================================================================
// Broker integration — REST client, token lifecycle, user-event stream
// =============================================================================

pub mod client;
pub mod models;
pub mod token;
pub mod ws;

use crate::types::Environment;

/// REST base for an environment. The bases are disjoint: an account's orders
/// and positions are only visible at the base matching its environment, and
/// an empty answer from the right base is authoritative. Nothing in this
/// crate ever falls back to the other base.
pub fn rest_base(env: Environment) -> &'static str {
    match env {
        Environment::Demo => "https://demo.tradebroker.com/v1",
        Environment::Live => "https://live.tradebroker.com/v1",
    }
}

/// User-event WebSocket base for an environment.
pub fn ws_base(env: Environment) -> &'static str {
    match env {
        Environment::Demo => "wss://demo.tradebroker.com/v1/websocket",
        Environment::Live => "wss://live.tradebroker.com/v1/websocket",
    }
}
