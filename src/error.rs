// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Transient kinds (RateLimited, Transient) are recovered locally with retries
// and backoff. Structural kinds (BrokerRejected, AuthRequired, Inconsistent,
// FlattenFailed) are published on the event bus and persisted with the signal
// or order row; they are never swallowed. Nothing here ever reaches a webhook
// caller after the 200 has been sent.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Webhook body could not be turned into a canonical signal. Surfaced in
    /// the HTTP response before anything is enqueued.
    #[error("unparseable signal: {0}")]
    UnparseableSignal(String),

    /// Signal parsed fine but a risk-gate filter dropped it.
    #[error("blocked by filter {filter}: {reason}")]
    FilterBlocked {
        filter: &'static str,
        reason: String,
    },

    /// No entry price could be determined from the signal, market data, or
    /// prior entries.
    #[error("no price available for {0}")]
    NoPrice(String),

    /// The broker returned 401; the token cache will be refreshed and the
    /// call retried once.
    #[error("access token expired for account {0}")]
    AuthExpired(String),

    /// Token refresh failed; the account is marked needs_reauth and trading
    /// for it fails fast until the operator re-authenticates.
    #[error("account {0} requires re-authentication")]
    AuthRequired(String),

    /// Per-account governor is saturated. Callers suspend until the bucket
    /// replenishes; this kind never escapes the pipeline.
    #[error("rate limited for account {0}")]
    RateLimited(String),

    /// The broker refused the order. Its failureReason is authoritative; no
    /// retry.
    #[error("broker rejected order: {reason}{}", match .text { Some(t) => format!(" ({t})"), None => String::new() })]
    BrokerRejected {
        reason: String,
        text: Option<String>,
    },

    /// A response arrived from a base URL that does not match the account's
    /// environment. Guarded against by construction; seeing this is a fatal
    /// configuration error.
    #[error("endpoint mismatch: account env {account_env} queried {base_url}")]
    EndpointMismatch {
        account_env: String,
        base_url: String,
    },

    /// Reconciler found a broker position on the opposite side of the signal
    /// history. Kill-switch is armed.
    #[error("broker position for {0} is inconsistent with signal history")]
    Inconsistent(String),

    /// Kill-switch could not confirm flat within its budget.
    #[error("flatten not confirmed within {budget_ms} ms for {key}")]
    FlattenFailed { key: String, budget_ms: u64 },

    /// Network or stream error; retried with backoff internally.
    #[error("transient i/o: {0}")]
    Transient(String),
}

impl EngineError {
    /// Short machine-readable kind for event payloads and persisted rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnparseableSignal(_) => "unparseable_signal",
            Self::FilterBlocked { .. } => "filter_blocked",
            Self::NoPrice(_) => "no_price",
            Self::AuthExpired(_) => "auth_expired",
            Self::AuthRequired(_) => "auth_required",
            Self::RateLimited(_) => "rate_limited",
            Self::BrokerRejected { .. } => "broker_rejected",
            Self::EndpointMismatch { .. } => "endpoint_mismatch",
            Self::Inconsistent(_) => "inconsistent",
            Self::FlattenFailed { .. } => "flatten_failed",
            Self::Transient(_) => "transient_io",
        }
    }

    /// Transient errors are recovered locally; everything else is structural.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited(_) | Self::AuthExpired(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Tests
// =============================================================================
