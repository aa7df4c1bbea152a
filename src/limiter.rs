// src/limiter.rs

use crate::bucket::TokenBucket;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How the bucket is refilled on every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimiterPolicy {
    /// Add the per-period budget; unused tokens accumulate and allow bursts.
    #[default]
    Soft,
    /// Reset the bucket to the per-period budget; nothing carries over.
    Hard,
}

/// Periodically refills a shared [`TokenBucket`].
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Arc<TokenBucket>,
    bytes_per_period: u64,
    policy: LimiterPolicy,
    period: Duration,
}

impl RateLimiter {
    pub fn new(bucket: Arc<TokenBucket>, bytes_per_second: u64, policy: LimiterPolicy) -> Self {
        Self {
            bucket,
            bytes_per_period: bytes_per_second,
            policy,
            period: Duration::from_secs(1),
        }
    }

    /// Overrides the refill period. The budget is granted once per period.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Performs a single refill according to the policy.
    pub async fn refill(&self) {
        match self.policy {
            LimiterPolicy::Soft => self.bucket.add(self.bytes_per_period).await,
            LimiterPolicy::Hard => self.bucket.set(self.bytes_per_period).await,
        }
    }

    /// Runs the refill loop until `stop` is cancelled.
    ///
    /// The first refill happens immediately so workers can start without
    /// waiting a whole period.
    pub async fn run(self, stop: CancellationToken) {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            "Limiter: {} bytes every {:?} ({:?} policy).",
            self.bytes_per_period, self.period, self.policy
        );

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.bucket.terminated() {
                break;
            }
            self.refill().await;
            trace!("Limiter: refilled bucket.");
        }
        debug!("Limiter: stopped.");
    }

    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn soft_policy_accumulates() {
        let bucket = Arc::new(TokenBucket::new());
        let stop = CancellationToken::new();
        let handle = RateLimiter::new(bucket.clone(), 100, LimiterPolicy::Soft).spawn(stop.clone());

        // Ticks at t = 0, 1, 2.
        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(bucket.available().await, 300);

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hard_policy_never_exceeds_budget() {
        let bucket = Arc::new(TokenBucket::new());
        let stop = CancellationToken::new();
        let handle = RateLimiter::new(bucket.clone(), 100, LimiterPolicy::Hard).spawn(stop.clone());

        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(bucket.available().await, 100);

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hard_policy_paces_a_consumer() {
        let bucket = Arc::new(TokenBucket::new());
        let stop = CancellationToken::new();
        let handle = RateLimiter::new(bucket.clone(), 100, LimiterPolicy::Hard).spawn(stop.clone());

        let started = time::Instant::now();
        for _ in 0..5 {
            assert!(bucket.take(100).await);
        }
        // Five budgets need the refills at t = 0, 1, 2, 3 and 4.
        assert!(started.elapsed() >= Duration::from_secs(4));

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stop_interrupts_the_wait() {
        let bucket = Arc::new(TokenBucket::new());
        let stop = CancellationToken::new();
        let handle = RateLimiter::new(bucket, 1, LimiterPolicy::Soft)
            .with_period(Duration::from_secs(3600))
            .spawn(stop.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("limiter did not stop promptly")
            .unwrap();
    }
}
