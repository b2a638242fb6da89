//! Global spacing between outbound requests.
//!
//! One [`RateLimiter`] is shared (behind an `Arc`) by every worker in a run.
//! Each remote call first awaits [`RateLimiter::acquire`], so the aggregate
//! request rate stays at or below `1 / delay` no matter how many workers run.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    // Instant of the most recent grant. The lock is FIFO, so waiting workers
    // are served in arrival order.
    last_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_grant: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Waits until at least `delay` has passed since the previous grant, then
    /// records and returns the new grant instant.
    ///
    /// The lock is held across the wait. That is the whole point: the next
    /// caller cannot observe the timestamp until this grant has been recorded.
    pub async fn acquire(&self) -> Instant {
        let mut last_grant = self.last_grant.lock().await;

        if let Some(previous) = *last_grant {
            let ready_at = previous + self.delay;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let now = Instant::now();
        *last_grant = Some(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_does_not_wait() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let start = Instant::now();
        let granted = limiter.acquire().await;
        assert_eq!(granted, start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_workers_are_spaced() {
        let delay = Duration::from_millis(500);
        let limiter = Arc::new(RateLimiter::new(delay));

        let workers = (0..5).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let mut grants = Vec::new();
                for _ in 0..4 {
                    grants.push(limiter.acquire().await);
                }
                grants
            })
        });

        let mut grants: Vec<Instant> = join_all(workers)
            .await
            .into_iter()
            .flat_map(|r| r.unwrap())
            .collect();
        grants.sort();

        assert_eq!(grants.len(), 20);
        for pair in grants.windows(2) {
            assert!(
                pair[1] - pair[0] >= delay,
                "grants only {:?} apart",
                pair[1] - pair[0]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_counts_towards_delay() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let before = Instant::now();
        let granted = limiter.acquire().await;
        assert_eq!(granted, before);
    }

    #[tokio::test]
    async fn test_zero_delay_never_blocks() {
        let limiter = RateLimiter::new(Duration::ZERO);
        for _ in 0..100 {
            limiter.acquire().await;
        }
    }
}
