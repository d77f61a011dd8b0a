// =============================================================================
// Token Cache & Refresher — per-account access-token lifecycle
// =============================================================================
//
// Lookup is lock-free for readers in the copy-on-write sense: the map lives
// behind an `Arc` that readers clone under a briefly-held read lock, and the
// refresher task is the only writer, swapping in a rebuilt map. A token that
// fails to refresh marks its account `needs_reauth` and every subsequent
// trading attempt for that account fails fast with AuthRequired until the
// operator re-authenticates.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::bus::{EngineEvent, EventBus};
use crate::config::EngineConfig;
use crate::directory::Directory;
use crate::error::{EngineError, EngineResult};
use crate::broker::models::TokenResponse;

/// Cached auth state for one broker account.
#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub needs_reauth: bool,
}

/// Copy-on-write map of account tokens.
pub struct TokenCache {
    map: RwLock<Arc<HashMap<String, TokenEntry>>>,
    directory: Arc<dyn Directory>,
    bus: EventBus,
    http: reqwest::Client,
}

impl TokenCache {
    pub fn new(directory: Arc<dyn Directory>, bus: EventBus) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let cache = Self {
            map: RwLock::new(Arc::new(HashMap::new())),
            directory,
            bus,
            http,
        };
        cache.seed();
        cache
    }

    /// Prime the cache from tokens the directory persisted before restart.
    fn seed(&self) {
        let mut map = HashMap::new();
        for account in self.directory.all_accounts() {
            if let (Some(access), Some(expires_at)) =
                (account.access_token.clone(), account.token_expires_at)
            {
                map.insert(
                    account.id.clone(),
                    TokenEntry {
                        access_token: access,
                        refresh_token: account.refresh_token.clone(),
                        expires_at,
                        needs_reauth: false,
                    },
                );
            }
        }
        info!(seeded = map.len(), "token cache seeded from directory");
        *self.map.write() = Arc::new(map);
    }

    /// Snapshot for readers. Cheap: clones the Arc, not the map.
    fn snapshot(&self) -> Arc<HashMap<String, TokenEntry>> {
        self.map.read().clone()
    }

    fn swap_entry(&self, account_id: &str, entry: TokenEntry) {
        let mut guard = self.map.write();
        let mut next: HashMap<String, TokenEntry> = (**guard).clone();
        next.insert(account_id.to_string(), entry);
        *guard = Arc::new(next);
    }

    /// Fetch a usable access token for `account_id`, failing fast when the
    /// account needs re-authentication.
    pub fn access_token(&self, account_id: &str) -> EngineResult<String> {
        let snapshot = self.snapshot();
        match snapshot.get(account_id) {
            Some(entry) if entry.needs_reauth => {
                Err(EngineError::AuthRequired(account_id.to_string()))
            }
            Some(entry) if entry.expires_at <= Utc::now() => {
                Err(EngineError::AuthExpired(account_id.to_string()))
            }
            Some(entry) => Ok(entry.access_token.clone()),
            None => Err(EngineError::AuthExpired(account_id.to_string())),
        }
    }

    /// Whether trading for this account should be skipped entirely.
    pub fn needs_reauth(&self, account_id: &str) -> bool {
        self.snapshot()
            .get(account_id)
            .map(|e| e.needs_reauth)
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Refresh
    // -------------------------------------------------------------------------

    /// Refresh the token for one account against its environment's base.
    /// Used by the background scan and as the forced refresh after a 401.
    pub async fn refresh_account(&self, account_id: &str) -> EngineResult<String> {
        let Some(account) = self.directory.account(account_id) else {
            return Err(EngineError::AuthRequired(account_id.to_string()));
        };

        let refresh_token = self
            .snapshot()
            .get(account_id)
            .map(|e| e.refresh_token.clone())
            .unwrap_or_else(|| account.refresh_token.clone());

        let url = format!("{}/auth/token", super::rest_base(account.environment));
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "client_id": account.client_id,
            "client_secret": account.client_secret,
            "refresh_token": refresh_token,
        });

        debug!(account_id, env = %account.environment, "refreshing access token");

        let result = async {
            let resp = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(EngineError::from)?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(EngineError::Transient(format!(
                    "token refresh returned {status}: {text}"
                )));
            }
            resp.json::<TokenResponse>()
                .await
                .map_err(EngineError::from)
        }
        .await;

        match result {
            Ok(token) => {
                let expires_at = Utc::now() + Duration::seconds(token.expires_in);
                let new_refresh = token
                    .refresh_token
                    .clone()
                    .unwrap_or(refresh_token);
                self.swap_entry(
                    account_id,
                    TokenEntry {
                        access_token: token.access_token.clone(),
                        refresh_token: new_refresh.clone(),
                        expires_at,
                        needs_reauth: false,
                    },
                );
                self.directory
                    .put_token(account_id, &token.access_token, &new_refresh, expires_at);
                self.bus.publish(EngineEvent::TokenRefreshed {
                    account_id: account_id.to_string(),
                    expires_at,
                });
                info!(account_id, %expires_at, "access token refreshed");
                Ok(token.access_token)
            }
            Err(e) => {
                warn!(account_id, error = %e, "token refresh failed — marking needs_reauth");
                if let Some(existing) = self.snapshot().get(account_id).cloned() {
                    self.swap_entry(
                        account_id,
                        TokenEntry {
                            needs_reauth: true,
                            ..existing
                        },
                    );
                } else {
                    self.swap_entry(
                        account_id,
                        TokenEntry {
                            access_token: String::new(),
                            refresh_token,
                            expires_at: Utc::now(),
                            needs_reauth: true,
                        },
                    );
                }
                self.bus.publish(EngineEvent::TokenRefreshFailed {
                    account_id: account_id.to_string(),
                    error: e.to_string(),
                });
                Err(EngineError::AuthRequired(account_id.to_string()))
            }
        }
    }

    /// Accounts whose token expires within `threshold`.
    fn expiring_within(&self, threshold: Duration) -> Vec<String> {
        let cutoff = Utc::now() + threshold;
        self.snapshot()
            .iter()
            .filter(|(_, e)| !e.needs_reauth && e.expires_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn insert_for_test(&self, account_id: &str, entry: TokenEntry) {
        self.swap_entry(account_id, entry);
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("accounts", &self.snapshot().len())
            .finish()
    }
}

// =============================================================================
// Refresher task
// =============================================================================

/// Scan the cache on a timer and proactively refresh anything expiring soon.
/// Spawned once at startup; exits when the shutdown signal fires.
pub async fn run_refresher(
    cache: Arc<TokenCache>,
    config: EngineConfig,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(config.token_refresh_check_s));
    let threshold = Duration::seconds(config.token_refresh_threshold_s as i64);

    info!(
        check_s = config.token_refresh_check_s,
        threshold_s = config.token_refresh_threshold_s,
        "token refresher started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                info!("token refresher stopping");
                return;
            }
        }

        for account_id in cache.expiring_within(threshold) {
            if let Err(e) = cache.refresh_account(&account_id).await {
                warn!(account_id = %account_id, error = %e, "proactive refresh failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::FileDirectory;

    fn cache() -> TokenCache {
        let dir = Arc::new(FileDirectory::empty("unused.json"));
        TokenCache::new(dir, EventBus::new())
    }

    fn live_entry() -> TokenEntry {
        TokenEntry {
            access_token: "tok".into(),
            refresh_token: "ref".into(),
            expires_at: Utc::now() + Duration::hours(1),
            needs_reauth: false,
        }
    }

    #[test]
    fn lookup_unknown_account_is_auth_expired() {
        let c = cache();
        let err = c.access_token("nobody").unwrap_err();
        assert_eq!(err.kind(), "auth_expired");
    }

    #[test]
    fn lookup_valid_token() {
        let c = cache();
        c.insert_for_test("a-1", live_entry());
        assert_eq!(c.access_token("a-1").unwrap(), "tok");
        assert!(!c.needs_reauth("a-1"));
    }

    #[test]
    fn expired_token_reports_auth_expired() {
        let c = cache();
        c.insert_for_test(
            "a-1",
            TokenEntry {
                expires_at: Utc::now() - Duration::minutes(1),
                ..live_entry()
            },
        );
        assert_eq!(c.access_token("a-1").unwrap_err().kind(), "auth_expired");
    }

    #[test]
    fn needs_reauth_fails_fast() {
        let c = cache();
        c.insert_for_test(
            "a-1",
            TokenEntry {
                needs_reauth: true,
                ..live_entry()
            },
        );
        assert_eq!(c.access_token("a-1").unwrap_err().kind(), "auth_required");
        assert!(c.needs_reauth("a-1"));
    }

    #[test]
    fn expiring_within_selects_only_soon_to_expire() {
        let c = cache();
        c.insert_for_test("soon", TokenEntry {
            expires_at: Utc::now() + Duration::minutes(2),
            ..live_entry()
        });
        c.insert_for_test("later", TokenEntry {
            expires_at: Utc::now() + Duration::hours(2),
            ..live_entry()
        });
        c.insert_for_test("dead", TokenEntry {
            needs_reauth: true,
            expires_at: Utc::now(),
            ..live_entry()
        });

        let due = c.expiring_within(Duration::minutes(5));
        assert_eq!(due, vec!["soon".to_string()]);
    }

    #[test]
    fn snapshot_is_copy_on_write() {
        let c = cache();
        c.insert_for_test("a-1", live_entry());
        let before = c.snapshot();
        c.insert_for_test("a-2", live_entry());
        // The earlier snapshot is unaffected by the swap.
        assert_eq!(before.len(), 1);
        assert_eq!(c.snapshot().len(), 2);
    }
}
