// src/bucket.rs

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};

/// A token bucket shared by every worker of a download.
///
/// One token is one byte. Tokens are put in by the [`RateLimiter`] and
/// withdrawn by workers before they hand bytes to the writer. Once the
/// bucket is terminated every waiter is released without being granted
/// anything.
///
/// [`RateLimiter`]: crate::limiter::RateLimiter
#[derive(Debug, Default)]
pub struct TokenBucket {
    tokens: Mutex<u64>,
    /// Only flipped while `tokens` is locked, so waiters cannot miss it.
    terminated: AtomicBool,
    changed: Notify,
}

impl TokenBucket {
    /// Creates an empty, live bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `amount` tokens can be withdrawn, then withdraws them.
    ///
    /// Returns `false` if the bucket was terminated first; in that case
    /// nothing was withdrawn and the caller must not proceed as if it had
    /// been granted. A zero amount always succeeds immediately.
    #[must_use = "a `false` result means no tokens were granted"]
    pub async fn take(&self, amount: u64) -> bool {
        if amount == 0 {
            return true;
        }

        loop {
            // Register interest before inspecting the count so a refill that
            // lands between the check and the await still wakes us.
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut tokens = self.tokens.lock().await;
                if self.terminated.load(Ordering::Acquire) {
                    return false;
                }
                if *tokens >= amount {
                    *tokens -= amount;
                    return true;
                }
            }

            changed.await;
        }
    }

    /// Adds tokens on top of what is already there ("soft" refill).
    pub async fn add(&self, amount: u64) {
        {
            let mut tokens = self.tokens.lock().await;
            *tokens = tokens.saturating_add(amount);
        }
        self.changed.notify_waiters();
    }

    /// Replaces the count, discarding leftovers ("hard" refill).
    pub async fn set(&self, amount: u64) {
        {
            let mut tokens = self.tokens.lock().await;
            *tokens = amount;
        }
        self.changed.notify_waiters();
    }

    /// Marks the bucket terminated and wakes every waiter. Irreversible.
    pub async fn terminate(&self) {
        {
            let _tokens = self.tokens.lock().await;
            self.terminated.store(true, Ordering::Release);
        }
        self.changed.notify_waiters();
    }

    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Current number of tokens.
    pub async fn available(&self) -> u64 {
        *self.tokens.lock().await
    }
}
