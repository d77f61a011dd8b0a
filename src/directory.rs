// =============================================================================
// Directory — recorders, traders, broker accounts, market data
// =============================================================================
//
// The user-facing service owns these records; the engine only reads them
// (plus one write-back: persisting refreshed tokens). The traits here are the
// seam; `FileDirectory` is the JSON-file implementation used in production
// and tests alike.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Environment;

// =============================================================================
// Records
// =============================================================================

/// One window of allowed trading time. Times are interpreted in `timezone`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start, "HH:MM".
    pub start: String,
    /// Exclusive end, "HH:MM".
    pub end: String,
    /// IANA timezone name, e.g. "America/Chicago".
    pub timezone: String,
    /// Allowed weekdays, 0 = Monday .. 6 = Sunday. Empty means every day.
    #[serde(default)]
    pub days_of_week: Vec<u8>,
}

/// Per-recorder risk-gate toggles, evaluated in filter-chain order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_true")]
    pub allow_long: bool,
    #[serde(default = "default_true")]
    pub allow_short: bool,
    /// Up to two windows; a signal must land inside at least one when any
    /// are configured.
    #[serde(default)]
    pub time_windows: Vec<TimeWindow>,
    /// Minimum seconds between accepted signals for the same ticker.
    #[serde(default)]
    pub cooldown_seconds: u64,
    /// Cap on accepted signals per trading session. 0 disables.
    #[serde(default)]
    pub max_per_session: u32,
    /// Stop trading once session realized P&L reaches -max_daily_loss_usd.
    /// 0 disables.
    #[serde(default)]
    pub max_daily_loss_usd: f64,
    /// Cap on contracts per trade. 0 disables.
    #[serde(default)]
    pub max_contracts: f64,
    /// Accept only every Nth signal. 0 or 1 disables.
    #[serde(default)]
    pub delay_n: u32,
}

fn default_true() -> bool {
    true
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            allow_long: true,
            allow_short: true,
            time_windows: Vec::new(),
            cooldown_seconds: 0,
            max_per_session: 0,
            max_daily_loss_usd: 0.0,
            max_contracts: 0.0,
            delay_n: 0,
        }
    }
}

/// A named strategy configuration. Looked up by webhook token; read-only to
/// the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recorder {
    pub id: String,
    /// Opaque, unguessable, unique. The URL path segment of the webhook.
    pub webhook_token: String,
    /// Alert-format symbol this recorder trades, e.g. "MNQ1!".
    pub symbol: String,
    /// Contracts on a fresh open.
    pub base_qty: f64,
    /// Contracts on a DCA addition.
    pub add_qty: f64,
    /// Take-profit distance in ticks from the average entry.
    pub tp_ticks: u32,
    /// Stop-loss distance in ticks from the average entry.
    pub sl_ticks: u32,
    #[serde(default)]
    pub sl_enabled: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub filters: FilterConfig,
}

/// Optional per-trader overrides of the recorder's sizing/bracket config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraderOverrides {
    #[serde(default)]
    pub base_qty: Option<f64>,
    #[serde(default)]
    pub add_qty: Option<f64>,
    #[serde(default)]
    pub tp_ticks: Option<u32>,
    #[serde(default)]
    pub sl_ticks: Option<u32>,
    #[serde(default)]
    pub sl_enabled: Option<bool>,
}

/// Binding of a recorder to one (broker account, sub-account) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trader {
    pub id: String,
    pub recorder_id: String,
    pub account_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub overrides: TraderOverrides,
    /// Bitset of enabled sub-accounts when the broker account has them.
    /// 0 means "the account itself, no sub-accounts".
    #[serde(default)]
    pub enabled_accounts: u64,
}

impl Trader {
    /// Sub-account indices selected by the `enabled_accounts` bitset.
    pub fn enabled_sub_accounts(&self) -> Vec<u32> {
        (0..64)
            .filter(|bit| self.enabled_accounts & (1u64 << bit) != 0)
            .collect()
    }
}

/// Sizing and bracket parameters after trader overrides are applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeParams {
    pub base_qty: f64,
    pub add_qty: f64,
    pub tp_ticks: u32,
    pub sl_ticks: u32,
    pub sl_enabled: bool,
}

impl TradeParams {
    /// Recorder defaults overridden by whatever the trader pins.
    pub fn resolve(recorder: &Recorder, trader: &Trader) -> Self {
        let o = &trader.overrides;
        Self {
            base_qty: o.base_qty.unwrap_or(recorder.base_qty),
            add_qty: o.add_qty.unwrap_or(recorder.add_qty),
            tp_ticks: o.tp_ticks.unwrap_or(recorder.tp_ticks),
            sl_ticks: o.sl_ticks.unwrap_or(recorder.sl_ticks),
            sl_enabled: o.sl_enabled.unwrap_or(recorder.sl_enabled),
        }
    }
}

/// Credentials and connection state for one account at the broker.
#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerAccount {
    pub id: String,
    #[serde(default)]
    pub environment: Environment,
    /// OAuth client id presented on token refresh.
    pub client_id: String,
    /// OAuth client secret presented on token refresh.
    pub client_secret: String,
    /// Long-lived refresh token from the OAuth collaborator.
    pub refresh_token: String,
    /// Last known access token, persisted so a restart can trade before the
    /// first refresh cycle.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for BrokerAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerAccount")
            .field("id", &self.id)
            .field("environment", &self.environment)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Seams
// =============================================================================

/// Read-mostly lookup into the user-facing store, plus the single token
/// write-back the engine performs.
pub trait Directory: Send + Sync {
    fn recorder_by_webhook_token(&self, token: &str) -> Option<Recorder>;
    fn recorder_by_id(&self, recorder_id: &str) -> Option<Recorder>;
    fn traders_for_recorder(&self, recorder_id: &str) -> Vec<Trader>;
    fn trader_by_id(&self, trader_id: &str) -> Option<Trader>;
    fn account(&self, account_id: &str) -> Option<BrokerAccount>;
    fn put_token(
        &self,
        account_id: &str,
        access: &str,
        refresh: &str,
        expires_at: DateTime<Utc>,
    );
    fn all_accounts(&self) -> Vec<BrokerAccount>;
}

/// Last observed market price, possibly stale or absent. Used as the entry
/// price fallback when an alert omits its price.
pub trait MarketData: Send + Sync {
    fn last_price(&self, ticker: &str) -> Option<(f64, DateTime<Utc>)>;
}

// =============================================================================
// File-backed directory
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    recorders: Vec<Recorder>,
    #[serde(default)]
    traders: Vec<Trader>,
    #[serde(default)]
    accounts: Vec<BrokerAccount>,
}

/// JSON-file directory. Loaded once at startup; token write-backs mutate the
/// in-memory copy and re-save best-effort.
pub struct FileDirectory {
    path: PathBuf,
    inner: RwLock<DirectoryFile>,
}

impl FileDirectory {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read directory from {}", path.display()))?;
        let inner: DirectoryFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse directory from {}", path.display()))?;

        info!(
            path = %path.display(),
            recorders = inner.recorders.len(),
            traders = inner.traders.len(),
            accounts = inner.accounts.len(),
            "directory loaded"
        );

        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    /// An empty directory for tests and first-boot.
    pub fn empty(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            inner: RwLock::new(DirectoryFile::default()),
        }
    }

    #[cfg(test)]
    pub fn insert_recorder(&self, recorder: Recorder) {
        self.inner.write().recorders.push(recorder);
    }

    #[cfg(test)]
    pub fn insert_trader(&self, trader: Trader) {
        self.inner.write().traders.push(trader);
    }

    #[cfg(test)]
    pub fn insert_account(&self, account: BrokerAccount) {
        self.inner.write().accounts.push(account);
    }

    fn save(&self, inner: &DirectoryFile) {
        let content = match serde_json::to_string_pretty(inner) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to serialise directory");
                return;
            }
        };
        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) =
            std::fs::write(&tmp, &content).and_then(|_| std::fs::rename(&tmp, &self.path))
        {
            warn!(error = %e, path = %self.path.display(), "failed to save directory");
        }
    }
}

impl Directory for FileDirectory {
    fn recorder_by_webhook_token(&self, token: &str) -> Option<Recorder> {
        self.inner
            .read()
            .recorders
            .iter()
            .find(|r| r.webhook_token == token)
            .cloned()
    }

    fn recorder_by_id(&self, recorder_id: &str) -> Option<Recorder> {
        self.inner
            .read()
            .recorders
            .iter()
            .find(|r| r.id == recorder_id)
            .cloned()
    }

    fn traders_for_recorder(&self, recorder_id: &str) -> Vec<Trader> {
        self.inner
            .read()
            .traders
            .iter()
            .filter(|t| t.recorder_id == recorder_id)
            .cloned()
            .collect()
    }

    fn trader_by_id(&self, trader_id: &str) -> Option<Trader> {
        self.inner
            .read()
            .traders
            .iter()
            .find(|t| t.id == trader_id)
            .cloned()
    }

    fn account(&self, account_id: &str) -> Option<BrokerAccount> {
        self.inner
            .read()
            .accounts
            .iter()
            .find(|a| a.id == account_id)
            .cloned()
    }

    fn put_token(
        &self,
        account_id: &str,
        access: &str,
        refresh: &str,
        expires_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write();
        if let Some(account) = inner.accounts.iter_mut().find(|a| a.id == account_id) {
            account.access_token = Some(access.to_string());
            account.refresh_token = refresh.to_string();
            account.token_expires_at = Some(expires_at);
        } else {
            warn!(account_id, "put_token for unknown account");
            return;
        }
        self.save(&inner);
    }

    fn all_accounts(&self) -> Vec<BrokerAccount> {
        self.inner.read().accounts.clone()
    }
}

// =============================================================================
// Shared last-price cache
// =============================================================================

/// Sharded last-price map fed by broker fills and quotes. Serves as the
/// `MarketData` collaborator when no external feed is wired.
pub struct LastPriceCache {
    shards: Vec<RwLock<HashMap<String, (f64, DateTime<Utc>)>>>,
}

const PRICE_SHARDS: usize = 16;

impl LastPriceCache {
    pub fn new() -> Self {
        Self {
            shards: (0..PRICE_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, ticker: &str) -> &RwLock<HashMap<String, (f64, DateTime<Utc>)>> {
        let mut hash: usize = 0;
        for b in ticker.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(b as usize);
        }
        &self.shards[hash % PRICE_SHARDS]
    }

    pub fn update(&self, ticker: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        self.shard(ticker)
            .write()
            .insert(ticker.to_string(), (price, Utc::now()));
    }
}

impl Default for LastPriceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketData for LastPriceCache {
    fn last_price(&self, ticker: &str) -> Option<(f64, DateTime<Utc>)> {
        self.shard(ticker).read().get(ticker).copied()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_recorder(id: &str, token: &str) -> Recorder {
        Recorder {
            id: id.into(),
            webhook_token: token.into(),
            symbol: "MNQ1!".into(),
            base_qty: 1.0,
            add_qty: 1.0,
            tp_ticks: 10,
            sl_ticks: 20,
            sl_enabled: false,
            enabled: true,
            private: false,
            filters: FilterConfig::default(),
        }
    }

    #[test]
    fn trade_params_prefer_trader_overrides() {
        let recorder = test_recorder("r-1", "tok");
        let trader = Trader {
            id: "t-1".into(),
            recorder_id: "r-1".into(),
            account_id: "a-1".into(),
            enabled: true,
            overrides: TraderOverrides {
                base_qty: Some(3.0),
                tp_ticks: Some(15),
                ..Default::default()
            },
            enabled_accounts: 0,
        };

        let params = TradeParams::resolve(&recorder, &trader);
        assert_eq!(params.base_qty, 3.0);
        assert_eq!(params.tp_ticks, 15);
        // Untouched fields fall through to the recorder.
        assert_eq!(params.add_qty, 1.0);
        assert_eq!(params.sl_ticks, 20);
        assert!(!params.sl_enabled);
    }

    #[test]
    fn enabled_accounts_bitset() {
        let trader = Trader {
            id: "t-1".into(),
            recorder_id: "r-1".into(),
            account_id: "a-1".into(),
            enabled: true,
            overrides: TraderOverrides::default(),
            enabled_accounts: 0b1011,
        };
        assert_eq!(trader.enabled_sub_accounts(), vec![0, 1, 3]);
    }

    #[test]
    fn directory_lookup_by_webhook_token() {
        let dir = FileDirectory::empty("unused.json");
        dir.insert_recorder(test_recorder("r-1", "secret-token"));

        assert!(dir.recorder_by_webhook_token("secret-token").is_some());
        assert!(dir.recorder_by_webhook_token("wrong").is_none());
    }

    #[test]
    fn account_debug_redacts_secrets() {
        let account = BrokerAccount {
            id: "a-1".into(),
            environment: Environment::Demo,
            client_id: "cid".into(),
            client_secret: "super-secret".into(),
            refresh_token: "refresh-secret".into(),
            access_token: None,
            token_expires_at: None,
        };
        let debug = format!("{account:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("refresh-secret"));
    }

    #[test]
    fn last_price_cache_roundtrip() {
        let cache = LastPriceCache::new();
        assert!(cache.last_price("MNQU5").is_none());
        cache.update("MNQU5", 25600.25);
        let (price, _) = cache.last_price("MNQU5").unwrap();
        assert_eq!(price, 25600.25);
        // Non-positive updates are ignored.
        cache.update("MNQU5", 0.0);
        assert_eq!(cache.last_price("MNQU5").unwrap().0, 25600.25);
    }
}
