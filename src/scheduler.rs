// =============================================================================
// Scheduler & Governor — task ownership, per-key serialization, rate limiting
// =============================================================================
//
// The scheduler owns every long-running task in the engine and exposes the
// one shutdown hook. Three pieces:
//
//   - Scheduler:       spawn/track/stop background tasks with a bounded grace.
//   - KeyedSerializer: one queue per (recorder, ticker); jobs for a key run
//                      strictly in submission order, keys run independently.
//   - RateGovernor:    per-account token bucket (default 70 req/min, burst
//                      10); acquisition suspends, it never fails.
//
// The per-key queue is the only point that linearizes position mutations; no
// lock is ever held across a network call.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::PositionKey;

// =============================================================================
// Scheduler
// =============================================================================

/// Grace given to in-flight tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Owns every background task and the shutdown broadcast.
pub struct Scheduler {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// A receiver tasks select on to learn about shutdown.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn and track a named background task.
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "scheduler spawning task");
        let handle = tokio::spawn(fut);
        self.handles.lock().push((name, handle));
    }

    /// Signal shutdown and wait up to the grace period for tasks to finish;
    /// anything still running after that is aborted.
    pub async fn shutdown(&self) {
        info!("scheduler shutting down");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.handles.lock());
        let deadline = Instant::now() + SHUTDOWN_GRACE;

        for (name, mut handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(_) => debug!(task = %name, "task finished"),
                Err(_) => {
                    warn!(task = %name, "task did not stop within grace — aborting");
                    handle.abort();
                }
            }
        }
        info!("scheduler shutdown complete");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.handles.lock().len())
            .finish()
    }
}

// =============================================================================
// Per-key serializer
// =============================================================================

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Queue depth per key. Submission fails loudly (logged) beyond this rather
/// than blocking the webhook path.
const KEY_QUEUE_DEPTH: usize = 64;

/// One worker queue per (recorder, ticker). Jobs submitted for the same key
/// run in submission order; different keys are fully independent. The
/// reconciler submits through the same queues as signals, so the two can
/// never race on a position.
pub struct KeyedSerializer {
    queues: Mutex<HashMap<PositionKey, mpsc::Sender<Job>>>,
}

impl KeyedSerializer {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue `fut` on the key's queue, creating the worker on first use.
    pub fn submit<F>(&self, key: PositionKey, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = {
            let mut queues = self.queues.lock();
            match queues.get(&key) {
                Some(tx) if !tx.is_closed() => tx.clone(),
                _ => {
                    let (tx, mut rx) = mpsc::channel::<Job>(KEY_QUEUE_DEPTH);
                    let worker_key = key.clone();
                    tokio::spawn(async move {
                        while let Some(job) = rx.recv().await {
                            job.await;
                        }
                        debug!(key = %worker_key, "key worker drained");
                    });
                    queues.insert(key.clone(), tx.clone());
                    tx
                }
            }
        };

        if let Err(e) = sender.try_send(Box::pin(fut)) {
            warn!(key = %key, error = %e, "key queue saturated — job dropped");
        }
    }
}

impl Default for KeyedSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyedSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedSerializer")
            .field("keys", &self.queues.lock().len())
            .finish()
    }
}

// =============================================================================
// Rate governor
// =============================================================================

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-account token bucket. `acquire` suspends until a token is available;
/// rate limiting is therefore invisible to callers except as latency.
pub struct RateGovernor {
    /// Steady-state tokens per second.
    rate: f64,
    /// Bucket capacity (burst allowance).
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateGovernor {
    pub fn new(rpm_limit: u32, burst: u32) -> Self {
        Self {
            rate: rpm_limit as f64 / 60.0,
            burst: burst as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `account_id`, waiting for the bucket to refill if
    /// necessary. The bucket mutex is only held to do arithmetic.
    pub async fn acquire(&self, account_id: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock();
                let now = Instant::now();
                let bucket = buckets.entry(account_id.to_string()).or_insert(Bucket {
                    tokens: self.burst,
                    last_refill: now,
                });

                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
                }
            };

            match wait {
                None => return,
                Some(delay) => {
                    debug!(account_id, delay_ms = delay.as_millis() as u64, "governor throttling");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Non-blocking probe used by tests and health reporting.
    pub fn available(&self, account_id: &str) -> f64 {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();
        let bucket = buckets.entry(account_id.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
        bucket.tokens
    }
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("rate_per_s", &self.rate)
            .field("burst", &self.burst)
            .field("accounts", &self.buckets.lock().len())
            .finish()
    }
}

// =============================================================================
// Batched fan-out
// =============================================================================

/// Split `items` into batches of `batch_size` and call `launch` for each
/// item, sleeping `delay` between batches. Used when a signal targets more
/// accounts than the broker likes to see at once.
pub async fn fan_out_batched<T, F>(
    items: Vec<T>,
    batch_size: usize,
    delay: Duration,
    mut launch: F,
) where
    F: FnMut(T),
{
    let total = items.len();
    let batch_size = batch_size.max(1);
    let mut iter = items.into_iter();
    let mut launched = 0usize;

    while launched < total {
        for item in iter.by_ref().take(batch_size) {
            launch(item);
            launched += 1;
        }
        if launched < total {
            debug!(launched, total, "fan-out batch complete — pausing");
            tokio::time::sleep(delay).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn keyed_jobs_run_in_submission_order() {
        let serializer = Arc::new(KeyedSerializer::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let key = PositionKey::new("r-1", "MNQU5");

        for i in 0..10 {
            let log = log.clone();
            serializer.submit(key.clone(), async move {
                // Stagger to prove ordering is queue-driven, not timing-driven.
                tokio::time::sleep(Duration::from_millis((10 - i) as u64)).await;
                log.lock().push(i);
            });
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn different_keys_do_not_serialize() {
        let serializer = Arc::new(KeyedSerializer::new());
        let started = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let started = started.clone();
            let key = PositionKey::new(format!("r-{i}"), "MNQU5");
            serializer.submit(key, async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
            });
        }

        // All four long jobs should have started despite none finishing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn governor_burst_then_throttle() {
        let governor = RateGovernor::new(60, 3); // 1/s, burst 3

        let start = Instant::now();
        for _ in 0..3 {
            governor.acquire("a-1").await;
        }
        // Burst drains instantly.
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(governor.available("a-1") < 1.0);

        // The 4th token needs ~1 s of refill.
        governor.acquire("a-1").await;
        assert!(start.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn governor_buckets_are_per_account() {
        let governor = RateGovernor::new(60, 1);
        governor.acquire("a-1").await;
        // A different account still has its full burst.
        let start = Instant::now();
        governor.acquire("a-2").await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn fan_out_batches_with_delay() {
        let launched = Arc::new(Mutex::new(Vec::new()));
        let l = launched.clone();

        let start = Instant::now();
        fan_out_batched(
            (0..5).collect::<Vec<_>>(),
            2,
            Duration::from_millis(50),
            move |i| l.lock().push(i),
        )
        .await;

        assert_eq!(*launched.lock(), vec![0, 1, 2, 3, 4]);
        // Three batches (2+2+1) means two inter-batch delays.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn scheduler_shutdown_stops_tasks() {
        let scheduler = Scheduler::new();
        let mut signal = scheduler.shutdown_signal();
        let stopped = Arc::new(AtomicUsize::new(0));
        let s = stopped.clone();

        scheduler.spawn("listener", async move {
            let _ = signal.recv().await;
            s.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.shutdown().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
