//! Background progress throttling
//!
//! Each background service draws from its own token bucket, where one token
//! is one block of work. Rates follow the arbiter's global scale; a scale of
//! zero still refills at the minimum rate so every service keeps making
//! forward progress.

use arrayio_common::BackgroundService;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sub-token precision
const SCALE: u64 = 1000;

/// Slowest refill, in blocks per second
pub const MIN_BLOCKS_PER_SEC: u64 = 1;

/// Token bucket refilled from explicit engine timestamps
///
/// - Tokens are added at `refill_rate` per second
/// - Tokens accumulate up to `max_tokens` (burst capacity)
/// - Each grant consumes tokens; partial grants are allowed
#[derive(Debug)]
pub struct TokenBucket {
    /// Current token count, scaled
    tokens: AtomicU64,
    /// Burst capacity, scaled
    max_tokens: AtomicU64,
    /// Tokens added per second, scaled
    refill_rate: AtomicU64,
    /// Engine time of the last refill
    last_refill_ms: Mutex<u64>,
}

impl TokenBucket {
    /// Create a full bucket
    ///
    /// # Arguments
    /// * `rate` - Tokens per second (sustained rate)
    /// * `burst` - Maximum tokens (burst capacity)
    /// * `now_ms` - Engine time the bucket starts at
    #[must_use]
    pub fn new(rate: u64, burst: u64, now_ms: u64) -> Self {
        Self {
            tokens: AtomicU64::new(burst * SCALE),
            max_tokens: AtomicU64::new(burst * SCALE),
            refill_rate: AtomicU64::new(rate * SCALE),
            last_refill_ms: Mutex::new(now_ms),
        }
    }

    /// Take up to `max` tokens; returns how many were granted
    pub fn acquire_up_to(&self, max: u64, now_ms: u64) -> u64 {
        self.refill(now_ms);
        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            let granted = (current / SCALE).min(max);
            if granted == 0 {
                return 0;
            }
            if self
                .tokens
                .compare_exchange_weak(
                    current,
                    current - granted * SCALE,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return granted;
            }
        }
    }

    /// Return unused tokens
    pub fn release(&self, count: u64) {
        let max = self.max_tokens.load(Ordering::Relaxed);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |current| {
                Some((current + count * SCALE).min(max))
            });
    }

    /// Whole tokens currently available
    pub fn available(&self, now_ms: u64) -> u64 {
        self.refill(now_ms);
        self.tokens.load(Ordering::Relaxed) / SCALE
    }

    fn refill(&self, now_ms: u64) {
        let mut last = self.last_refill_ms.lock();
        let elapsed_ms = now_ms.saturating_sub(*last);
        let new_tokens = elapsed_ms * self.refill_rate.load(Ordering::Relaxed) / 1000;
        if new_tokens > 0 {
            let max = self.max_tokens.load(Ordering::Relaxed);
            let current = self.tokens.load(Ordering::Relaxed);
            self.tokens
                .store((current + new_tokens).min(max), Ordering::Relaxed);
            *last = now_ms;
        }
    }

    /// Update the rate limit dynamically
    pub fn set_rate(&self, rate: u64, burst: u64) {
        self.refill_rate.store(rate * SCALE, Ordering::Relaxed);
        let max = burst * SCALE;
        self.max_tokens.store(max, Ordering::Relaxed);
        // Cap current tokens to new max
        let current = self.tokens.load(Ordering::Relaxed);
        if current > max {
            self.tokens.store(max, Ordering::Relaxed);
        }
    }
}

/// Effective per-service rate for a base rate and a 0-100 scale
#[must_use]
pub fn scaled_rate(base_blocks_per_sec: u64, scale_percent: u8) -> u64 {
    (base_blocks_per_sec * u64::from(scale_percent) / 100).max(MIN_BLOCKS_PER_SEC)
}

/// One bucket per background service
#[derive(Debug)]
pub struct ServiceThrottle {
    buckets: Vec<TokenBucket>,
    base_rate: u64,
    scale: Mutex<u8>,
}

impl ServiceThrottle {
    #[must_use]
    pub fn new(base_rate: u64, scale_percent: u8, now_ms: u64) -> Self {
        let rate = scaled_rate(base_rate, scale_percent);
        Self {
            buckets: BackgroundService::ALL
                .iter()
                .map(|_| TokenBucket::new(rate, rate, now_ms))
                .collect(),
            base_rate,
            scale: Mutex::new(scale_percent),
        }
    }

    /// Re-rate every bucket if the scale changed
    pub fn apply_scale(&self, scale_percent: u8) {
        let mut current = self.scale.lock();
        if *current == scale_percent {
            return;
        }
        *current = scale_percent;
        let rate = scaled_rate(self.base_rate, scale_percent);
        for bucket in &self.buckets {
            bucket.set_rate(rate, rate);
        }
    }

    pub fn acquire(&self, service: BackgroundService, max: u64, now_ms: u64) -> u64 {
        self.buckets[service.index()].acquire_up_to(max, now_ms)
    }

    pub fn release(&self, service: BackgroundService, count: u64) {
        self.buckets[service.index()].release(count);
    }
}
