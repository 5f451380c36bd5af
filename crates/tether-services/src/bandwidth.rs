//! Bandwidth limiting — a byte-denominated token bucket per recipient, and
//! the policies that split a total ceiling across recipients.
//!
//! The bucket refills at `rate` bytes/sec and holds at most one second of
//! burst. A send larger than the burst is allowed once the bucket is full and
//! drives it negative, so the next send waits off the debt.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::peer::QualityClass;

#[derive(Debug)]
struct ByteBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl ByteBucket {
    fn new(rate: u64) -> Self {
        let rate = rate.max(1) as f64;
        Self {
            tokens: rate,
            capacity: rate,
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `bytes`, or report how long until enough tokens accrue.
    fn take(&mut self, bytes: u64) -> Result<(), Duration> {
        self.refill();
        let need = (bytes as f64).min(self.capacity);
        if self.tokens >= need {
            self.tokens -= bytes as f64;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((need - self.tokens) / self.refill_rate))
        }
    }
}

/// Async rate limiter. `None` rate means unlimited.
#[derive(Debug)]
pub struct BandwidthLimiter {
    bucket: Mutex<Option<ByteBucket>>,
}

impl BandwidthLimiter {
    pub fn new(rate: Option<u64>) -> Self {
        Self {
            bucket: Mutex::new(rate.map(ByteBucket::new)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Wait until `bytes` may be sent.
    pub async fn acquire(&self, bytes: u64) {
        loop {
            let wait = match self.lock().as_mut() {
                None => return,
                Some(bucket) => match bucket.take(bytes) {
                    Ok(()) => return,
                    Err(wait) => wait,
                },
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Change the rate. Accrued tokens are kept, clamped to the new burst.
    pub fn set_rate(&self, rate: Option<u64>) {
        let mut slot = self.lock();
        match (slot.as_mut(), rate) {
            (Some(bucket), Some(rate)) => {
                bucket.refill();
                let rate = rate.max(1) as f64;
                bucket.refill_rate = rate;
                bucket.capacity = rate;
                bucket.tokens = bucket.tokens.min(rate);
            }
            (_, rate) => *slot = rate.map(ByteBucket::new),
        }
    }

    pub fn rate(&self) -> Option<u64> {
        self.lock().as_ref().map(|b| b.refill_rate as u64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ByteBucket>> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Allocation policies ──────────────────────────────────────────────────────

/// Splits a total outbound ceiling across concurrent recipients.
pub trait BandwidthPolicy: Send + Sync {
    /// Per-recipient rate for one of `recipients` at `quality`. `None` total
    /// means unlimited.
    fn allocate(&self, total: Option<u64>, recipients: usize, quality: QualityClass) -> Option<u64>;
}

fn even_share(total: u64, recipients: usize) -> u64 {
    (total / recipients.max(1) as u64).max(1)
}

/// `total / recipients`, regardless of quality.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenSplit;

impl BandwidthPolicy for EvenSplit {
    fn allocate(&self, total: Option<u64>, recipients: usize, _quality: QualityClass) -> Option<u64> {
        total.map(|t| even_share(t, recipients))
    }
}

/// Scales the even share down for weaker links so a struggling recipient
/// doesn't build a queue it can't drain. Never exceeds the even share.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityWeighted;

impl QualityWeighted {
    fn weight(quality: QualityClass) -> f64 {
        match quality {
            QualityClass::Excellent => 1.0,
            QualityClass::Good => 0.9,
            QualityClass::Fair => 0.7,
            QualityClass::Poor | QualityClass::Disconnected => 0.5,
        }
    }
}

impl BandwidthPolicy for QualityWeighted {
    fn allocate(&self, total: Option<u64>, recipients: usize, quality: QualityClass) -> Option<u64> {
        total.map(|t| ((even_share(t, recipients) as f64 * Self::weight(quality)) as u64).max(1))
    }
}
