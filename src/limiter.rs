//! Client-side rate limiting: QPS, RPM, and TPM token buckets per limit key.
//!
//! Buckets live in-process by default. With a [`SharedStore`] configured,
//! bucket state moves into the store and is updated by compare-and-swap so
//! several processes can share one budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};

const SHARED_STATE_TTL: Duration = Duration::from_secs(120);

/// Rate-limit parameters for one limit key; zero disables a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LimitParams {
    /// Requests per second
    pub qps: f64,
    /// Requests per minute
    pub rpm: u64,
    /// Tokens per minute
    pub tpm: u64,
}

impl LimitParams {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self { qps: config.qps_limit, rpm: config.rpm_limit, tpm: config.tpm_limit }
    }

    pub(crate) fn is_unlimited(&self) -> bool {
        self.qps <= 0.0 && self.rpm == 0 && self.tpm == 0
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self { capacity, refill_per_sec, tokens: capacity, last: Instant::now() }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
    }

    /// Check whether `n` tokens are available without taking them. A request
    /// larger than the whole bucket is clamped so it can still proceed.
    fn check(&mut self, n: f64, now: Instant) -> std::result::Result<(), Duration> {
        let n = n.min(self.capacity);
        self.refill(now);
        if self.tokens >= n {
            Ok(())
        } else {
            let missing = n - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    fn take(&mut self, n: f64) {
        self.tokens -= n.min(self.capacity);
    }

    fn credit(&mut self, n: f64) {
        self.tokens = (self.tokens + n).min(self.capacity);
    }
}

#[derive(Debug)]
struct KeyBuckets {
    qps: Option<Mutex<Bucket>>,
    rpm: Option<Mutex<Bucket>>,
    tpm: Option<Mutex<Bucket>>,
}

impl KeyBuckets {
    fn new(params: LimitParams) -> Self {
        // request buckets hold at least one whole request of burst
        Self {
            qps: (params.qps > 0.0)
                .then(|| Mutex::new(Bucket::new(params.qps.max(1.0), params.qps))),
            rpm: (params.rpm > 0).then(|| {
                Mutex::new(Bucket::new((params.rpm as f64).max(1.0), params.rpm as f64 / 60.0))
            }),
            tpm: (params.tpm > 0)
                .then(|| Mutex::new(Bucket::new(params.tpm as f64, params.tpm as f64 / 60.0))),
        }
    }
}

/// Serialized bucket state held in a [`SharedStore`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SharedBucketState {
    tokens: f64,
    /// Unix milliseconds of the last refill
    last_ms: i64,
}

/// External key-value store with an atomic compare-and-swap, for coordinating
/// buckets across processes.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    async fn load(&self, key: &str) -> Option<String>;

    /// Atomically replace the value of `key`, expecting it to currently be
    /// `current` (`None` meaning absent). Returns false when the expectation
    /// failed and nothing was written.
    async fn compare_and_swap(
        &self,
        key: &str,
        current: Option<&str>,
        next: &str,
        ttl: Duration,
    ) -> bool;
}

/// In-process [`SharedStore`], usable for tests and single-host coordination.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: std::sync::Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn load(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match entries.get(key) {
            Some((_, expires)) => *expires <= Instant::now(),
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|(value, _)| value.clone())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        current: Option<&str>,
        next: &str,
        ttl: Duration,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let existing = entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.as_str());
        if existing != current {
            return false;
        }
        entries.insert(key.to_string(), (next.to_string(), Instant::now() + ttl));
        true
    }
}

/// Enforces all applicable buckets for a limit key before a request goes out.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    keys: RwLock<HashMap<String, Arc<KeyBuckets>>>,
    store: Option<Arc<dyn SharedStore>>,
}

impl RateLimiter {
    pub(crate) fn new(store: Option<Arc<dyn SharedStore>>) -> Self {
        Self { keys: RwLock::new(HashMap::new()), store }
    }

    async fn buckets(&self, key: &str, params: LimitParams) -> Arc<KeyBuckets> {
        {
            let keys = self.keys.read().await;
            if let Some(buckets) = keys.get(key) {
                return buckets.clone();
            }
        }
        let mut keys = self.keys.write().await;
        keys.entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyBuckets::new(params)))
            .clone()
    }

    /// Block until every applicable bucket permits the request, debiting one
    /// request from QPS/RPM and `estimated_tokens` from TPM.
    pub(crate) async fn acquire(
        &self,
        key: &str,
        params: LimitParams,
        estimated_tokens: u64,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if params.is_unlimited() {
            return Ok(());
        }
        if let Some(store) = self.store.clone() {
            return self
                .acquire_shared(&store, key, params, estimated_tokens, deadline, cancel)
                .await;
        }

        let buckets = self.buckets(key, params).await;
        loop {
            let now = Instant::now();
            let wait = {
                let mut qps = match &buckets.qps {
                    Some(bucket) => Some(bucket.lock().await),
                    None => None,
                };
                let mut rpm = match &buckets.rpm {
                    Some(bucket) => Some(bucket.lock().await),
                    None => None,
                };
                let mut tpm = match &buckets.tpm {
                    Some(bucket) => Some(bucket.lock().await),
                    None => None,
                };

                let mut wait: Option<Duration> = None;
                let mut track = |result: std::result::Result<(), Duration>| {
                    if let Err(needed) = result {
                        wait = Some(wait.map_or(needed, |w| w.max(needed)));
                    }
                };
                if let Some(bucket) = qps.as_deref_mut() {
                    track(bucket.check(1.0, now));
                }
                if let Some(bucket) = rpm.as_deref_mut() {
                    track(bucket.check(1.0, now));
                }
                if let Some(bucket) = tpm.as_deref_mut() {
                    track(bucket.check(estimated_tokens as f64, now));
                }

                if wait.is_none() {
                    if let Some(bucket) = qps.as_deref_mut() {
                        bucket.take(1.0);
                    }
                    if let Some(bucket) = rpm.as_deref_mut() {
                        bucket.take(1.0);
                    }
                    if let Some(bucket) = tpm.as_deref_mut() {
                        bucket.take(estimated_tokens as f64);
                    }
                    return Ok(());
                }
                wait
            };

            let wait = wait.unwrap_or_default();
            self.pause(key, wait, deadline, cancel).await?;
        }
    }

    async fn acquire_shared(
        &self,
        store: &Arc<dyn SharedStore>,
        key: &str,
        params: LimitParams,
        estimated_tokens: u64,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let buckets: [(&str, f64, f64, f64); 3] = [
            ("qps", 1.0, params.qps.max(1.0), params.qps),
            ("rpm", 1.0, (params.rpm as f64).max(1.0), params.rpm as f64 / 60.0),
            ("tpm", estimated_tokens as f64, params.tpm as f64, params.tpm as f64 / 60.0),
        ];
        for (suffix, need, capacity, refill) in buckets {
            if refill <= 0.0 {
                continue;
            }
            let need = need.min(capacity);
            self.cas_take(store, &format!("{key}:{suffix}"), need, capacity, refill, deadline, cancel)
                .await?;
        }
        Ok(())
    }

    async fn cas_take(
        &self,
        store: &Arc<dyn SharedStore>,
        key: &str,
        need: f64,
        capacity: f64,
        refill_per_sec: f64,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let current = store.load(key).await;
            let now_ms = unix_millis();
            let mut state = current
                .as_deref()
                .and_then(|raw| serde_json::from_str::<SharedBucketState>(raw).ok())
                .unwrap_or(SharedBucketState { tokens: capacity, last_ms: now_ms });
            let elapsed = (now_ms - state.last_ms).max(0) as f64 / 1000.0;
            state.tokens = (state.tokens + elapsed * refill_per_sec).min(capacity);
            state.last_ms = now_ms;

            if state.tokens >= need {
                state.tokens -= need;
                let next = serde_json::to_string(&state).map_err(|source| {
                    Error::MalformedResponse { source }
                })?;
                if store
                    .compare_and_swap(key, current.as_deref(), &next, SHARED_STATE_TTL)
                    .await
                {
                    return Ok(());
                }
                // contended write; re-read and try again
                continue;
            }

            let wait = Duration::from_secs_f64((need - state.tokens) / refill_per_sec);
            self.pause(key, wait, deadline, cancel).await?;
        }
    }

    async fn pause(
        &self,
        key: &str,
        wait: Duration,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let wake = Instant::now() + wait.max(Duration::from_millis(10));
        if let Some(deadline) = deadline {
            if wake > deadline {
                return Err(Error::RateLimitExceeded { key: key.to_string() });
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(wake) => Ok(()),
        }
    }

    /// Return the over-estimate to the TPM bucket once the server reported
    /// actual usage.
    pub(crate) async fn reconcile(
        &self,
        key: &str,
        params: LimitParams,
        estimated: u64,
        actual: u64,
    ) {
        let delta = estimated as f64 - actual as f64;
        self.credit_tpm(key, params, delta).await;
    }

    /// Return the whole estimate after a call that never reached the server.
    pub(crate) async fn release(&self, key: &str, params: LimitParams, estimated: u64) {
        self.credit_tpm(key, params, estimated as f64).await;
    }

    async fn credit_tpm(&self, key: &str, params: LimitParams, delta: f64) {
        if params.tpm == 0 || delta == 0.0 {
            return;
        }
        if let Some(store) = self.store.clone() {
            let shared_key = format!("{key}:tpm");
            let capacity = params.tpm as f64;
            let refill = capacity / 60.0;
            // bounded CAS attempts; reconciliation is best-effort
            for _ in 0..8 {
                let current = store.load(&shared_key).await;
                let now_ms = unix_millis();
                let mut state = current
                    .as_deref()
                    .and_then(|raw| serde_json::from_str::<SharedBucketState>(raw).ok())
                    .unwrap_or(SharedBucketState { tokens: capacity, last_ms: now_ms });
                let elapsed = (now_ms - state.last_ms).max(0) as f64 / 1000.0;
                state.tokens = (state.tokens + elapsed * refill + delta).min(capacity);
                state.last_ms = now_ms;
                let Ok(next) = serde_json::to_string(&state) else {
                    return;
                };
                if store
                    .compare_and_swap(&shared_key, current.as_deref(), &next, SHARED_STATE_TTL)
                    .await
                {
                    return;
                }
            }
            return;
        }
        let buckets = self.buckets(key, params).await;
        if let Some(bucket) = &buckets.tpm {
            let mut bucket = bucket.lock().await;
            let now = Instant::now();
            bucket.refill(now);
            if delta >= 0.0 {
                bucket.credit(delta);
            } else {
                bucket.take(-delta);
            }
        }
    }
}

fn unix_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test(start_paused = true)]
    async fn qps_bucket_spaces_out_requests() {
        let limiter = RateLimiter::new(None);
        let params = LimitParams { qps: 1.0, rpm: 0, tpm: 0 };
        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire("k", params, 0, None, &cancel()).await.unwrap();
        }
        // burst of 1, then 1/s refill: third acquire lands at >= 2s
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_surfaces_rate_limit_error() {
        let limiter = RateLimiter::new(None);
        let params = LimitParams { qps: 1.0, rpm: 0, tpm: 0 };
        limiter.acquire("k", params, 0, None, &cancel()).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(100);
        let err = limiter
            .acquire("k", params, 0, Some(deadline), &cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_acquisition() {
        let limiter = RateLimiter::new(None);
        let params = LimitParams { qps: 1.0, rpm: 0, tpm: 0 };
        limiter.acquire("k", params, 0, None, &cancel()).await.unwrap();
        let token = cancel();
        token.cancel();
        let err = limiter.acquire("k", params, 0, None, &token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn tpm_reconcile_returns_overestimate() {
        let limiter = RateLimiter::new(None);
        let params = LimitParams { qps: 0.0, rpm: 0, tpm: 10 };
        limiter.acquire("k", params, 8, None, &cancel()).await.unwrap();
        limiter.reconcile("k", params, 8, 2).await;
        // 2 tokens spent overall, 8 remain; this must not block
        let started = Instant::now();
        limiter.acquire("k", params, 8, None, &cancel()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn release_returns_full_estimate() {
        let limiter = RateLimiter::new(None);
        let params = LimitParams { qps: 0.0, rpm: 0, tpm: 10 };
        limiter.acquire("k", params, 10, None, &cancel()).await.unwrap();
        limiter.release("k", params, 10).await;
        let started = Instant::now();
        limiter.acquire("k", params, 10, None, &cancel()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn memory_store_compare_and_swap() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.compare_and_swap("k", None, "a", ttl).await);
        assert!(!store.compare_and_swap("k", None, "b", ttl).await);
        assert!(store.compare_and_swap("k", Some("a"), "b", ttl).await);
        assert_eq!(store.load("k").await.as_deref(), Some("b"));
    }

    // shared bucket refill is wall-clock based, so this test runs unpaused
    #[tokio::test]
    async fn shared_store_mode_enforces_qps() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(Some(store));
        let params = LimitParams { qps: 1.0, rpm: 0, tpm: 0 };
        let started = std::time::Instant::now();
        for _ in 0..2 {
            limiter.acquire("k", params, 0, None, &cancel()).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
