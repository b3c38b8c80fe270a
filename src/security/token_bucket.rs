//! Token bucket with lazy, time-based refill.

use std::time::{Duration, Instant};

/// A validated (rate, period) pair: `rate` tokens replenish over `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    rate: u32,
    period: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("rate must be greater than zero")]
    ZeroRate,
    #[error("period must be greater than zero")]
    ZeroPeriod,
}

impl Limit {
    pub fn new(rate: u32, period: Duration) -> Result<Self, LimitError> {
        if rate == 0 {
            return Err(LimitError::ZeroRate);
        }
        if period.is_zero() {
            return Err(LimitError::ZeroPeriod);
        }
        Ok(Self { rate, period })
    }

    /// Maximum tokens, which is also the number replenished per period.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether refills every `interval` never add a token. Each refill
    /// re-anchors the bucket, so an interval shorter than `period / rate`
    /// leaves a drained bucket empty.
    pub fn stalls_at(&self, interval: Duration) -> bool {
        interval.as_nanos() * u128::from(self.rate) < self.period.as_nanos()
    }
}

/// A single rate-limited counter.
///
/// Invariant: `0 <= tokens <= limit.rate()`. The bucket is refilled lazily
/// from elapsed time, by both the admission path and the background loop,
/// through the same [`TokenBucket::refill`].
#[derive(Debug, Clone)]
pub struct TokenBucket {
    limit: Limit,
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(limit: Limit, now: Instant) -> Self {
        Self {
            limit,
            tokens: limit.rate,
            last_refill: now,
        }
    }

    pub fn limit(&self) -> Limit {
        self.limit
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// Add `floor(elapsed * rate / period)` tokens, capped at capacity, and
    /// anchor the next computation at `now`.
    ///
    /// `last_refill` moves to `now` even when nothing was added. It never
    /// moves backwards, so a stale `now` adds nothing.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let to_add =
            elapsed.as_nanos() * u128::from(self.limit.rate) / self.limit.period.as_nanos();
        let capacity = u128::from(self.limit.rate);
        self.tokens = (u128::from(self.tokens) + to_add).min(capacity) as u32;

        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Debit one token if any are left.
    pub fn try_take(&mut self) -> bool {
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}
