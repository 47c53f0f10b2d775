// ABOUTME: Integration tests for admission control scopes driven by a manual clock
// ABOUTME: Covers refill math, scope isolation, reconfiguration, and concurrent consumers

use parley_core::admission::AdmissionControl;
use parley_core::config::RateLimitConfig;
use parley_core::ratelimit::{ManualClock, TokenBucket, RATE_LIMIT_EXCEEDED};
use std::sync::Arc;
use std::time::Duration;

fn limits(user: u64, channel: u64, llm: u64) -> RateLimitConfig {
    RateLimitConfig {
        enabled: true,
        user_requests_per_minute: user,
        channel_messages_per_second: channel,
        llm_requests_per_minute: llm,
    }
}

#[test]
fn test_bucket_five_per_second_scenario() {
    let clock = Arc::new(ManualClock::new());
    let bucket = TokenBucket::new(5, Duration::from_millis(1000), clock.clone());

    for expected in (0..5).rev() {
        let result = bucket.try_consume();
        assert!(result.allowed);
        assert_eq!(result.remaining_tokens, expected);
    }

    let denied = bucket.try_consume();
    assert!(!denied.allowed);
    assert_eq!(denied.wait_ms(), 200);
    assert_eq!(denied.reason.as_deref(), Some(RATE_LIMIT_EXCEEDED));

    clock.advance(Duration::from_millis(400));
    assert!(bucket.try_consume().allowed);
    assert!(bucket.try_consume().allowed);
    assert!(!bucket.try_consume().allowed);
}

#[test]
fn test_scopes_have_independent_pools() {
    let clock = Arc::new(ManualClock::new());
    let admission = AdmissionControl::with_clock(&limits(2, 1, 1), clock);

    assert!(admission.try_consume_global().allowed);
    assert!(admission.try_consume_global().allowed);
    assert!(!admission.try_consume_global().allowed);

    assert!(admission.try_consume_channel("web").allowed);
    assert!(!admission.try_consume_channel("web").allowed);
    assert!(admission.try_consume_channel("telegram").allowed);

    assert!(admission.try_consume_provider("openai").allowed);
    assert!(admission.try_consume_provider("anthropic").allowed);
    assert!(!admission.try_consume_provider("openai").allowed);
}

#[test]
fn test_bucket_state_reports_refill() {
    let clock = Arc::new(ManualClock::new());
    let admission = AdmissionControl::with_clock(&limits(60, 30, 60), clock.clone());
    assert!(admission.bucket_state("user:global").is_none());

    for _ in 0..10 {
        admission.try_consume_global();
    }
    let state = admission.bucket_state("user:global").unwrap();
    assert_eq!(state.tokens, 50);
    assert_eq!(state.capacity, 60);
    assert!((state.refill_rate_per_second - 1.0).abs() < f64::EPSILON);

    clock.advance(Duration::from_secs(5));
    assert_eq!(admission.bucket_state("user:global").unwrap().tokens, 55);
}

#[test]
fn test_reconfigure_rebuilds_buckets() {
    let clock = Arc::new(ManualClock::new());
    let admission = AdmissionControl::with_clock(&limits(1, 30, 60), clock);
    assert!(admission.try_consume_global().allowed);
    assert!(!admission.try_consume_global().allowed);

    admission.reconfigure(&limits(3, 30, 60));
    assert!(admission.try_consume_global().allowed);
    assert_eq!(admission.bucket_state("user:global").unwrap().capacity, 3);

    let mut disabled = limits(3, 30, 60);
    disabled.enabled = false;
    admission.reconfigure(&disabled);
    let result = admission.try_consume_global();
    assert!(result.allowed);
    assert_eq!(result.remaining_tokens, u64::MAX);
}

#[test]
fn test_concurrent_consumers_never_overdraw() {
    let clock = Arc::new(ManualClock::new());
    let admission = Arc::new(AdmissionControl::with_clock(&limits(100, 30, 60), clock));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let admission = Arc::clone(&admission);
            std::thread::spawn(move || {
                (0..50)
                    .filter(|_| admission.try_consume_global().allowed)
                    .count()
            })
        })
        .collect();

    let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(granted, 100);
    assert_eq!(admission.bucket_state("user:global").unwrap().tokens, 0);
}

#[test]
fn test_channel_denial_returns_global_token() {
    let clock = Arc::new(ManualClock::new());
    let admission = AdmissionControl::with_clock(&limits(5, 1, 60), clock);

    assert!(admission.try_admit_channel("web").allowed);
    assert_eq!(admission.bucket_state("user:global").unwrap().tokens, 4);

    let denied = admission.try_admit_channel("web");
    assert!(!denied.allowed);
    assert_eq!(admission.bucket_state("user:global").unwrap().tokens, 4);
    assert_eq!(admission.bucket_state("channel:web").unwrap().tokens, 0);

    // Another channel still has its own pool and the untouched global tokens
    assert!(admission.try_admit_channel("telegram").allowed);
    assert_eq!(admission.bucket_state("user:global").unwrap().tokens, 3);
}

#[test]
fn test_global_denial_leaves_channel_untouched() {
    let clock = Arc::new(ManualClock::new());
    let admission = AdmissionControl::with_clock(&limits(1, 30, 60), clock);

    assert!(admission.try_admit_channel("web").allowed);
    assert!(!admission.try_admit_channel("web").allowed);
    assert_eq!(admission.bucket_state("channel:web").unwrap().tokens, 29);
}
