// =============================================================================
// Contract Map — alert-format tickers to broker front-month contracts
// =============================================================================
//
// Chart alerts arrive in continuous-contract notation ("MNQ1!"); the broker
// wants a dated front-month name ("MNQU6"). Resolution order:
//
//   1. Dynamic: /contract/search against the broker, cached for one hour.
//   2. Static: derive the front-month code from the calendar (quarterly
//      futures cycle H/M/U/Z).
//   3. Reject.
//
// Tickers already in broker format pass through untouched.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::broker::client::BrokerClient;
use crate::error::{EngineError, EngineResult};
use crate::types::TickSpec;

/// How long a dynamic lookup stays cached.
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Strip the continuous-contract suffix, if present.
/// "MNQ1!" -> Some("MNQ"); "MNQU5" -> None.
pub fn alert_root(ticker: &str) -> Option<&str> {
    ticker.strip_suffix("1!")
}

/// Front-month contract name for `root` on the quarterly cycle (H, M, U, Z)
/// at `date`. The current month maps to its own quarter until it ends.
pub fn static_front_month(root: &str, date: DateTime<Utc>) -> String {
    let month = date.month();
    let (code, year) = match month {
        1..=3 => ('H', date.year()),
        4..=6 => ('M', date.year()),
        7..=9 => ('U', date.year()),
        _ => ('Z', date.year()),
    };
    format!("{root}{code}{}", year % 10)
}

/// Tick size and value for the roots this engine is asked to trade.
pub fn tick_spec(symbol: &str) -> TickSpec {
    let base = symbol.strip_suffix("1!").unwrap_or(symbol);
    // Dated contracts carry a month code + year digit ("MNQU5"); roots may
    // themselves contain digits ("M2K"). Try the name as given, then with
    // the date code stripped, then the alphabetic prefix.
    let alpha: String = base
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    let spec = lookup_root(base)
        .or_else(|| {
            if base.len() > 2 {
                lookup_root(&base[..base.len() - 2])
            } else {
                None
            }
        })
        .or_else(|| lookup_root(alpha.trim_end_matches(|c: char| c.is_ascii_digit())));
    spec.unwrap_or_else(|| {
        warn!(symbol, "unknown contract root — using default tick spec");
        TickSpec::new(0.25, 1.25)
    })
}

fn lookup_root(root: &str) -> Option<TickSpec> {
    let spec = match root {
        "MNQ" => TickSpec::new(0.25, 0.50),
        "NQ" => TickSpec::new(0.25, 5.00),
        "MES" => TickSpec::new(0.25, 1.25),
        "ES" => TickSpec::new(0.25, 12.50),
        "MYM" => TickSpec::new(1.0, 0.50),
        "YM" => TickSpec::new(1.0, 5.00),
        "M2K" => TickSpec::new(0.10, 0.50),
        "RTY" => TickSpec::new(0.10, 5.00),
        "MGC" => TickSpec::new(0.10, 1.00),
        "GC" => TickSpec::new(0.10, 10.00),
        "MCL" => TickSpec::new(0.01, 1.00),
        "CL" => TickSpec::new(0.01, 10.00),
        _ => return None,
    };
    Some(spec)
}

/// Cached alert-ticker resolution.
pub struct ContractMap {
    cache: RwLock<HashMap<String, (String, Instant)>>,
}

impl ContractMap {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `ticker` to broker format. `lookup` supplies the broker client
    /// and an account to authenticate the search with, when one is available.
    pub async fn resolve(
        &self,
        ticker: &str,
        lookup: Option<(&BrokerClient, &str)>,
    ) -> EngineResult<String> {
        let Some(root) = alert_root(ticker) else {
            // Already broker format.
            return Ok(ticker.to_string());
        };

        if let Some(cached) = self.cached(root) {
            return Ok(cached);
        }

        if let Some((client, account_id)) = lookup {
            match client.search_contract(account_id, root).await {
                Ok(contracts) => {
                    if let Some(front) = contracts.first() {
                        debug!(root, contract = %front.name, "contract resolved dynamically");
                        self.cache
                            .write()
                            .insert(root.to_string(), (front.name.clone(), Instant::now()));
                        return Ok(front.name.clone());
                    }
                    warn!(root, "contract search returned no results — using static map");
                }
                Err(e) => {
                    warn!(root, error = %e, "contract search failed — using static map");
                }
            }
        }

        if lookup_root(root).is_some() {
            let name = static_front_month(root, Utc::now());
            self.cache
                .write()
                .insert(root.to_string(), (name.clone(), Instant::now()));
            return Ok(name);
        }

        Err(EngineError::UnparseableSignal(format!(
            "unknown ticker {ticker}"
        )))
    }

    fn cached(&self, root: &str) -> Option<String> {
        let cache = self.cache.read();
        let (name, at) = cache.get(root)?;
        if at.elapsed() < CACHE_TTL {
            Some(name.clone())
        } else {
            None
        }
    }
}

impl Default for ContractMap {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
