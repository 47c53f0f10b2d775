// ABOUTME: Admission control over three independent token-bucket scopes: global, channel, provider.
// ABOUTME: Buckets are created lazily per key and rebuilt when their configured limits change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::RateLimitConfig;
use crate::metrics;
use crate::ratelimit::{BucketState, Clock, RateLimitResult, SystemClock, TokenBucket};

const GLOBAL_KEY: &str = "user:global";
const CHANNEL_PREFIX: &str = "channel:";
const PROVIDER_PREFIX: &str = "llm:";

/// Admission scope. Each scope owns its own buckets; pools are never shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Channel,
    Provider,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Channel => "channel",
            Scope::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BucketSpec {
    capacity: u64,
    period: Duration,
}

/// Rate limiter guarding shared downstream resources.
///
/// Buckets live in a sharded map and each bucket has its own lock, so a hot
/// provider key never blocks consumption on a channel key.
pub struct AdmissionControl {
    enabled: AtomicBool,
    limits: RwLock<RateLimitConfig>,
    buckets: DashMap<String, Arc<TokenBucket>>,
    clock: Arc<dyn Clock>,
}

impl AdmissionControl {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            limits: RwLock::new(config.clone()),
            buckets: DashMap::new(),
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Swap in new limits. Buckets whose capacity or period changed are
    /// rebuilt (full) on their next use; unchanged buckets keep their tokens.
    pub fn reconfigure(&self, config: &RateLimitConfig) {
        self.enabled.store(config.enabled, Ordering::Relaxed);
        *self.limits.write() = config.clone();
        tracing::info!(
            enabled = config.enabled,
            user_per_minute = config.user_requests_per_minute,
            channel_per_second = config.channel_messages_per_second,
            llm_per_minute = config.llm_requests_per_minute,
            "Admission limits reconfigured"
        );
    }

    pub fn try_consume_global(&self) -> RateLimitResult {
        self.consume(Scope::Global, GLOBAL_KEY.to_string())
    }

    pub fn try_consume_channel(&self, channel_type: &str) -> RateLimitResult {
        self.consume(Scope::Channel, format!("{CHANNEL_PREFIX}{channel_type}"))
    }

    pub fn try_consume_provider(&self, provider_id: &str) -> RateLimitResult {
        self.consume(Scope::Provider, format!("{PROVIDER_PREFIX}{provider_id}"))
    }

    /// Admit one message arriving on `channel_type`: a global token and a
    /// channel token are both required. A channel denial hands the global
    /// token back, so neither scope drains the other.
    pub fn try_admit_channel(&self, channel_type: &str) -> RateLimitResult {
        let global = self.try_consume_global();
        if !global.allowed {
            return global;
        }
        let channel = self.try_consume_channel(channel_type);
        if !channel.allowed {
            if let Some(bucket) = self.buckets.get(GLOBAL_KEY).map(|b| Arc::clone(b.value())) {
                bucket.refund(1);
            }
        }
        channel
    }

    /// Refill and report a bucket by its full key (e.g. `channel:web`).
    /// Returns `None` for keys that have never been used.
    pub fn bucket_state(&self, key: &str) -> Option<BucketState> {
        let bucket = self.buckets.get(key).map(|b| Arc::clone(b.value()))?;
        Some(bucket.state(key))
    }

    fn consume(&self, scope: Scope, key: String) -> RateLimitResult {
        if !self.is_enabled() {
            return RateLimitResult::allowed(u64::MAX);
        }

        let spec = self.spec_for(scope);
        let bucket = self.resolve_bucket(key.clone(), spec);
        let result = bucket.try_consume();
        if !result.allowed {
            metrics::record_admission_denied(scope.as_str());
            tracing::debug!(
                key = %key,
                wait_ms = result.wait_ms(),
                "Admission denied"
            );
        }
        result
    }

    fn spec_for(&self, scope: Scope) -> BucketSpec {
        let limits = self.limits.read();
        match scope {
            Scope::Global => BucketSpec {
                capacity: limits.user_requests_per_minute,
                period: Duration::from_secs(60),
            },
            Scope::Channel => BucketSpec {
                capacity: limits.channel_messages_per_second,
                period: Duration::from_secs(1),
            },
            Scope::Provider => BucketSpec {
                capacity: limits.llm_requests_per_minute,
                period: Duration::from_secs(60),
            },
        }
    }

    fn resolve_bucket(&self, key: String, spec: BucketSpec) -> Arc<TokenBucket> {
        let mut slot = self
            .buckets
            .entry(key)
            .or_insert_with(|| self.new_bucket(spec));
        if slot.capacity() != spec.capacity.max(1) || slot.period() != spec.period {
            *slot = self.new_bucket(spec);
        }
        Arc::clone(slot.value())
    }

    fn new_bucket(&self, spec: BucketSpec) -> Arc<TokenBucket> {
        Arc::new(TokenBucket::new(
            spec.capacity,
            spec.period,
            Arc::clone(&self.clock),
        ))
    }
}

impl std::fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("enabled", &self.is_enabled())
            .field("limits", &*self.limits.read())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
