// =============================================================================
// Signal Dedupe — fingerprint ring per recorder
// =============================================================================
//
// Chart services redeliver webhooks on timeouts. Two deliveries with the same
// fingerprint inside the window are one signal; the second is dropped as an
// idempotent retry. Fingerprints are sha256 over the identifying fields plus
// the raw body, with received-at truncated to the second so a retry a few
// hundred milliseconds later still collides.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::types::SignalAction;

/// Fingerprints retained per recorder.
const RING_CAPACITY: usize = 4096;

/// Window within which an identical fingerprint is a retry, seconds.
const DUPLICATE_WINDOW_S: i64 = 2;

/// Compute the dedupe fingerprint for one delivery.
pub fn fingerprint(
    recorder_id: &str,
    ticker: &str,
    action: SignalAction,
    received_at: DateTime<Utc>,
    raw_body: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(recorder_id.as_bytes());
    hasher.update(ticker.as_bytes());
    hasher.update(action.to_string().as_bytes());
    hasher.update(received_at.timestamp().to_string().as_bytes());
    hasher.update(raw_body.as_bytes());
    hex::encode(hasher.finalize())
}

struct Ring {
    entries: VecDeque<(String, DateTime<Utc>)>,
}

impl Ring {
    fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(64),
        }
    }

    fn check_and_insert(&mut self, fp: &str, now: DateTime<Utc>) -> bool {
        let duplicate = self.entries.iter().any(|(existing, at)| {
            existing == fp && (now - *at).num_seconds().abs() < DUPLICATE_WINDOW_S
        });
        if !duplicate {
            if self.entries.len() == RING_CAPACITY {
                self.entries.pop_front();
            }
            self.entries.push_back((fp.to_string(), now));
        }
        duplicate
    }
}

/// Fingerprint rings sharded by recorder id.
pub struct DedupeIndex {
    rings: Mutex<HashMap<String, Ring>>,
}

impl DedupeIndex {
    pub fn new() -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when this fingerprint was already seen inside the
    /// window; otherwise records it and returns `false`.
    pub fn is_duplicate(&self, recorder_id: &str, fp: &str, now: DateTime<Utc>) -> bool {
        let mut rings = self.rings.lock();
        rings
            .entry(recorder_id.to_string())
            .or_insert_with(Ring::new)
            .check_and_insert(fp, now)
    }
}

impl Default for DedupeIndex {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fingerprint_is_deterministic_and_field_sensitive() {
        let at = Utc::now();
        let a = fingerprint("r-1", "MNQU5", SignalAction::Buy, at, "{}");
        let b = fingerprint("r-1", "MNQU5", SignalAction::Buy, at, "{}");
        assert_eq!(a, b);

        assert_ne!(a, fingerprint("r-2", "MNQU5", SignalAction::Buy, at, "{}"));
        assert_ne!(a, fingerprint("r-1", "MESU5", SignalAction::Buy, at, "{}"));
        assert_ne!(a, fingerprint("r-1", "MNQU5", SignalAction::Sell, at, "{}"));
        assert_ne!(a, fingerprint("r-1", "MNQU5", SignalAction::Buy, at, "{\"q\":1}"));
    }

    #[test]
    fn truncation_to_second_makes_fast_retries_collide() {
        let at = Utc::now();
        let retry_at = at + Duration::milliseconds(400);
        // Only if both land in the same second; force that by construction.
        if at.timestamp() == retry_at.timestamp() {
            assert_eq!(
                fingerprint("r-1", "MNQU5", SignalAction::Buy, at, "{}"),
                fingerprint("r-1", "MNQU5", SignalAction::Buy, retry_at, "{}"),
            );
        }
    }

    #[test]
    fn duplicate_within_window_is_dropped() {
        let index = DedupeIndex::new();
        let now = Utc::now();
        assert!(!index.is_duplicate("r-1", "fp-1", now));
        assert!(index.is_duplicate("r-1", "fp-1", now + Duration::seconds(1)));
    }

    #[test]
    fn same_fingerprint_after_window_is_fresh() {
        let index = DedupeIndex::new();
        let now = Utc::now();
        assert!(!index.is_duplicate("r-1", "fp-1", now));
        assert!(!index.is_duplicate("r-1", "fp-1", now + Duration::seconds(3)));
    }

    #[test]
    fn rings_are_sharded_by_recorder() {
        let index = DedupeIndex::new();
        let now = Utc::now();
        assert!(!index.is_duplicate("r-1", "fp-1", now));
        assert!(!index.is_duplicate("r-2", "fp-1", now));
    }

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let index = DedupeIndex::new();
        let now = Utc::now();
        for i in 0..RING_CAPACITY + 10 {
            assert!(!index.is_duplicate("r-1", &format!("fp-{i}"), now));
        }
        let rings = index.rings.lock();
        assert_eq!(rings.get("r-1").unwrap().entries.len(), RING_CAPACITY);
    }
}
