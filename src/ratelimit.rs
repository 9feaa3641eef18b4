/// Per-key token-bucket admission control.
///
/// Each key (tenant id or API key) owns one bucket with capacity equal to the
/// tenant's requests-per-minute limit. Tokens refill continuously at
/// `capacity / 60` per second, capped at capacity, so a full bucket allows a
/// burst of `capacity` requests and a drained one recovers one request every
/// `60 / capacity` seconds.
///
/// `try_acquire` never blocks and never waits: refill-and-decrement happens
/// in a single critical section per key (the sharded map's entry lock), and
/// denied callers get a retry-after hint instead of an internal retry.
///
/// The arithmetic is pure and takes time explicitly, which keeps the refill
/// behavior deterministic under test.
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{GateError, GateResult};

/// Tokens available after elapsed-time refill, capped at capacity.
fn replenished_tokens(current: f64, elapsed_secs: f64, rate_per_sec: f64, capacity: u32) -> f64 {
    let replenished = elapsed_secs.max(0.0) * rate_per_sec;
    (current + replenished).min(capacity as f64)
}

/// Seconds until `deficit` tokens will have refilled.
fn retry_after_secs(deficit: f64, rate_per_sec: f64) -> u64 {
    if rate_per_sec <= 0.0 {
        return u64::MAX;
    }
    (deficit / rate_per_sec).ceil() as u64
}

/// Mutable bucket state for one key. Owned exclusively by the limiter.
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: u32,
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn full(capacity: u32, now: DateTime<Utc>) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    /// Refill for elapsed time, then take one token or report the wait.
    fn try_take(&mut self, now: DateTime<Utc>) -> Result<(), u64> {
        let elapsed = (now - self.last_refill).num_milliseconds() as f64 / 1000.0;
        let rate = self.capacity as f64 / 60.0;
        self.tokens = replenished_tokens(self.tokens, elapsed, rate, self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(retry_after_secs(1.0 - self.tokens, rate))
        }
    }
}

/// Non-blocking per-key rate limiter.
///
/// Buckets live in a sharded map, so acquisitions for unrelated keys never
/// serialize on each other.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    /// Create a limiter with no buckets; buckets materialize full on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit one request for `key` with the given per-minute capacity.
    ///
    /// Returns immediately: `Ok(())` and one token consumed, or
    /// [`GateError::RateLimited`] with a retry-after hint. A capacity change
    /// (tenant policy edit) takes effect on the next acquisition, keeping the
    /// current token count clamped to the new capacity.
    pub fn try_acquire(&self, key: &str, capacity_per_minute: u32) -> GateResult<()> {
        self.try_acquire_at(key, capacity_per_minute, Utc::now())
    }

    /// Time-explicit variant of [`try_acquire`](Self::try_acquire) for tests.
    pub fn try_acquire_at(
        &self,
        key: &str,
        capacity_per_minute: u32,
        now: DateTime<Utc>,
    ) -> GateResult<()> {
        if capacity_per_minute == 0 {
            return Err(GateError::RateLimited {
                retry_after_secs: u64::MAX,
            });
        }

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(capacity_per_minute, now));

        if bucket.capacity != capacity_per_minute {
            bucket.capacity = capacity_per_minute;
            bucket.tokens = bucket.tokens.min(capacity_per_minute as f64);
        }

        bucket.try_take(now).map_err(|retry_after_secs| {
            GateError::RateLimited { retry_after_secs }
        })
    }

    /// Drop buckets that have been idle long enough to be full again.
    ///
    /// A full bucket is indistinguishable from a fresh one, so this is purely
    /// a memory-reclamation pass.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let elapsed = (now - bucket.last_refill).num_milliseconds() as f64 / 1000.0;
            let rate = bucket.capacity as f64 / 60.0;
            replenished_tokens(bucket.tokens, elapsed, rate, bucket.capacity)
                < bucket.capacity as f64
        });
        before - self.buckets.len()
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_replenish_never_exceeds_capacity(
            current in 0.0f64..1000.0,
            elapsed in 0.0f64..100_000.0,
            capacity in 1u32..10_000,
        ) {
            let rate = capacity as f64 / 60.0;
            let tokens = replenished_tokens(current.min(capacity as f64), elapsed, rate, capacity);
            prop_assert!(tokens <= capacity as f64);
        }

        #[test]
        fn prop_replenish_monotonic_in_time(
            elapsed_a in 0.0f64..10_000.0,
            delta in 0.0f64..10_000.0,
            capacity in 1u32..10_000,
        ) {
            let rate = capacity as f64 / 60.0;
            let a = replenished_tokens(0.0, elapsed_a, rate, capacity);
            let b = replenished_tokens(0.0, elapsed_a + delta, rate, capacity);
            prop_assert!(b >= a);
        }

        #[test]
        fn prop_retry_after_is_sufficient(
            deficit in 0.001f64..100.0,
            capacity in 1u32..10_000,
        ) {
            let rate = capacity as f64 / 60.0;
            let wait = retry_after_secs(deficit, rate);
            // Waiting the hinted time always refills at least the deficit.
            prop_assert!(wait as f64 * rate >= deficit);
        }
    }
}
