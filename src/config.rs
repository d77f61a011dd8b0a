// =============================================================================
// Engine Configuration — file-backed settings with env overrides
// =============================================================================
//
// Every tunable lives here. Persistence uses an atomic tmp + rename pattern
// to prevent corruption on crash. All fields carry `#[serde(default)]` so
// that adding new fields never breaks loading an older config file. A small
// set of `JT_`-prefixed environment variables override the file at startup.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_batch_size() -> usize {
    25
}

fn default_batch_delay_ms() -> u64 {
    500
}

fn default_api_rpm_limit() -> u32 {
    70
}

fn default_api_burst() -> u32 {
    10
}

fn default_token_refresh_check_s() -> u64 {
    60
}

fn default_token_refresh_threshold_s() -> u64 {
    300
}

fn default_reconcile_interval_s() -> u64 {
    60
}

fn default_reconcile_full_sweep_s() -> u64 {
    300
}

fn default_exit_confirm_timeout_ms() -> u64 {
    3000
}

fn default_exit_fill_timeout_ms() -> u64 {
    5000
}

fn default_kill_switch_budget_ms() -> u64 {
    750
}

fn default_ws_reconnect_base_ms() -> u64 {
    1000
}

fn default_ws_reconnect_cap_ms() -> u64 {
    30000
}

fn default_session_close_hour() -> u32 {
    17
}

fn default_session_timezone() -> String {
    "America/Chicago".to_string()
}

fn default_directory_path() -> String {
    "directory.json".to_string()
}

fn default_store_path() -> String {
    "store.json".to_string()
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the JetTrade engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- HTTP server ---------------------------------------------------------
    /// Address the webhook/admin HTTP server binds.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Fan-out -------------------------------------------------------------
    /// Accounts per fan-out batch when a signal targets many accounts.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between fan-out batches, milliseconds.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    // --- Broker rate limiting ------------------------------------------------
    /// Per-account request budget, requests per minute.
    #[serde(default = "default_api_rpm_limit")]
    pub api_rpm_limit: u32,

    /// Per-account burst allowance on top of the steady rate.
    #[serde(default = "default_api_burst")]
    pub api_burst: u32,

    // --- Token lifecycle -----------------------------------------------------
    /// How often the refresher scans the token cache, seconds.
    #[serde(default = "default_token_refresh_check_s")]
    pub token_refresh_check_s: u64,

    /// Tokens expiring within this window are refreshed proactively, seconds.
    #[serde(default = "default_token_refresh_threshold_s")]
    pub token_refresh_threshold_s: u64,

    // --- Reconciliation ------------------------------------------------------
    /// Per-open-position reconcile cadence, seconds.
    #[serde(default = "default_reconcile_interval_s")]
    pub reconcile_interval_s: u64,

    /// Full account sweep cadence, seconds.
    #[serde(default = "default_reconcile_full_sweep_s")]
    pub reconcile_full_sweep_s: u64,

    // --- Exit state machine --------------------------------------------------
    /// How long CONFIRM_FLAT polls the broker before escalating, milliseconds.
    #[serde(default = "default_exit_confirm_timeout_ms")]
    pub exit_confirm_timeout_ms: u64,

    /// How long WORKING_EXIT waits for the exit fill before retrying,
    /// milliseconds.
    #[serde(default = "default_exit_fill_timeout_ms")]
    pub exit_fill_timeout_ms: u64,

    /// Total latency budget for the kill-switch path, milliseconds.
    #[serde(default = "default_kill_switch_budget_ms")]
    pub kill_switch_budget_ms: u64,

    // --- Broker WebSocket ----------------------------------------------------
    /// Reconnect backoff base, milliseconds.
    #[serde(default = "default_ws_reconnect_base_ms")]
    pub ws_reconnect_base_ms: u64,

    /// Reconnect backoff cap, milliseconds.
    #[serde(default = "default_ws_reconnect_cap_ms")]
    pub ws_reconnect_cap_ms: u64,

    // --- Trading session -----------------------------------------------------
    /// Hour (0-23, local to `session_timezone`) at which the futures session
    /// rolls; daily-loss and per-session counters reset here.
    #[serde(default = "default_session_close_hour")]
    pub session_close_hour: u32,

    /// IANA timezone name for the session boundary.
    #[serde(default = "default_session_timezone")]
    pub session_timezone: String,

    // --- Files ---------------------------------------------------------------
    /// Path to the recorder/trader/account directory file.
    #[serde(default = "default_directory_path")]
    pub directory_path: String,

    /// Path to the persistent store file.
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            api_rpm_limit: default_api_rpm_limit(),
            api_burst: default_api_burst(),
            token_refresh_check_s: default_token_refresh_check_s(),
            token_refresh_threshold_s: default_token_refresh_threshold_s(),
            reconcile_interval_s: default_reconcile_interval_s(),
            reconcile_full_sweep_s: default_reconcile_full_sweep_s(),
            exit_confirm_timeout_ms: default_exit_confirm_timeout_ms(),
            exit_fill_timeout_ms: default_exit_fill_timeout_ms(),
            kill_switch_budget_ms: default_kill_switch_budget_ms(),
            ws_reconnect_base_ms: default_ws_reconnect_base_ms(),
            ws_reconnect_cap_ms: default_ws_reconnect_cap_ms(),
            session_close_hour: default_session_close_hour(),
            session_timezone: default_session_timezone(),
            directory_path: default_directory_path(),
            store_path: default_store_path(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            api_rpm_limit = config.api_rpm_limit,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply `JT_`-prefixed environment overrides on top of the loaded file.
    /// Unparseable values are ignored; the file value stays.
    pub fn apply_env_overrides(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Ok(addr) = std::env::var("JT_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(v) = env_parse("JT_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("JT_BATCH_DELAY_MS") {
            self.batch_delay_ms = v;
        }
        if let Some(v) = env_parse("JT_API_RPM_LIMIT") {
            self.api_rpm_limit = v;
        }
        if let Some(v) = env_parse("JT_RECONCILE_INTERVAL_S") {
            self.reconcile_interval_s = v;
        }
        if let Some(v) = env_parse("JT_KILL_SWITCH_BUDGET_MS") {
            self.kill_switch_budget_ms = v;
        }
        if let Ok(tz) = std::env::var("JT_SESSION_TIMEZONE") {
            self.session_timezone = tz;
        }
        if let Ok(path) = std::env::var("JT_DIRECTORY_PATH") {
            self.directory_path = path;
        }
        if let Ok(path) = std::env::var("JT_STORE_PATH") {
            self.store_path = path;
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
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.batch_delay_ms, 500);
        assert_eq!(cfg.api_rpm_limit, 70);
        assert_eq!(cfg.api_burst, 10);
        assert_eq!(cfg.token_refresh_check_s, 60);
        assert_eq!(cfg.token_refresh_threshold_s, 300);
        assert_eq!(cfg.reconcile_interval_s, 60);
        assert_eq!(cfg.reconcile_full_sweep_s, 300);
        assert_eq!(cfg.exit_confirm_timeout_ms, 3000);
        assert_eq!(cfg.kill_switch_budget_ms, 750);
        assert_eq!(cfg.ws_reconnect_base_ms, 1000);
        assert_eq!(cfg.ws_reconnect_cap_ms, 30000);
        assert_eq!(cfg.session_close_hour, 17);
        assert_eq!(cfg.session_timezone, "America/Chicago");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.api_rpm_limit, 70);
        assert_eq!(cfg.session_close_hour, 17);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "api_rpm_limit": 40, "batch_size": 10 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.api_rpm_limit, 40);
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.batch_delay_ms, 500);
        assert_eq!(cfg.kill_switch_budget_ms, 750);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
        assert_eq!(cfg.api_rpm_limit, cfg2.api_rpm_limit);
        assert_eq!(cfg.session_timezone, cfg2.session_timezone);
    }
}
