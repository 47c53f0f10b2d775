// ABOUTME: Token bucket rate-limit primitive with lazy refill against an injectable clock.
// ABOUTME: Buckets start full; a denial reports the wait until exactly one more token appears.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";

// =============================================================================
// Clock
// =============================================================================

/// Monotonic time source for buckets.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Used to make bucket timing deterministic.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of a consume attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining_tokens: u64,
    /// Time until one more token appears. Zero when allowed.
    pub wait: Duration,
    pub reason: Option<String>,
}

impl RateLimitResult {
    pub fn allowed(remaining_tokens: u64) -> Self {
        Self {
            allowed: true,
            remaining_tokens,
            wait: Duration::ZERO,
            reason: None,
        }
    }

    pub fn denied(wait: Duration, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            remaining_tokens: 0,
            wait,
            reason: Some(reason.into()),
        }
    }

    pub fn wait_ms(&self) -> u64 {
        self.wait.as_millis() as u64
    }
}

/// Observability snapshot of one bucket.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    pub key: String,
    pub tokens: u64,
    pub capacity: u64,
    pub last_refill: DateTime<Utc>,
    pub refill_rate_per_second: f64,
}

// =============================================================================
// TokenBucket
// =============================================================================

struct BucketInner {
    tokens: u64,
    last_refill: Instant,
}

/// A single token bucket. Each bucket carries its own lock so contention on
/// one key never stalls another.
pub struct TokenBucket {
    capacity: u64,
    period: Duration,
    inner: Mutex<BucketInner>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket. A zero capacity is treated as 1 and a zero
    /// period as 1ms so refill arithmetic never divides by zero.
    pub fn new(capacity: u64, period: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        let period = if period.is_zero() {
            Duration::from_millis(1)
        } else {
            period
        };
        let now = clock.now();
        Self {
            capacity,
            period,
            inner: Mutex::new(BucketInner {
                tokens: capacity,
                last_refill: now,
            }),
            clock,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn try_consume(&self) -> RateLimitResult {
        self.try_consume_n(1)
    }

    /// Refill, then take `n` tokens if available.
    ///
    /// The reported wait is always the time for a single token, regardless of `n`.
    pub fn try_consume_n(&self, n: u64) -> RateLimitResult {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);

        if inner.tokens >= n {
            inner.tokens -= n;
            return RateLimitResult::allowed(inner.tokens);
        }

        RateLimitResult::denied(self.single_token_wait(), RATE_LIMIT_EXCEEDED)
    }

    /// Return `n` previously taken tokens, never exceeding capacity.
    pub fn refund(&self, n: u64) {
        let mut inner = self.inner.lock();
        inner.tokens = inner.tokens.saturating_add(n).min(self.capacity);
    }

    /// Refill and report the bucket's state under `key`.
    pub fn state(&self, key: &str) -> BucketState {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);

        let since_refill = self.clock.now().saturating_duration_since(inner.last_refill);
        let last_refill = Utc::now()
            - chrono::Duration::from_std(since_refill).unwrap_or_else(|_| chrono::Duration::zero());

        BucketState {
            key: key.to_string(),
            tokens: inner.tokens,
            capacity: self.capacity,
            last_refill,
            refill_rate_per_second: self.capacity as f64 / self.period.as_secs_f64(),
        }
    }

    fn refill(&self, inner: &mut BucketInner) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(inner.last_refill).as_nanos();
        let add = elapsed * u128::from(self.capacity) / self.period.as_nanos();
        if add > 0 {
            let room = u128::from(self.capacity - inner.tokens);
            inner.tokens += add.min(room) as u64;
            inner.last_refill = now;
        }
    }

    fn single_token_wait(&self) -> Duration {
        let nanos = self.period.as_nanos() / u128::from(self.capacity);
        Duration::from_millis((nanos / 1_000_000) as u64)
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("period", &self.period)
            .field("tokens", &self.inner.lock().tokens)
            .finish()
    }
}
