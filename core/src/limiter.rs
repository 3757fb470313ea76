//! Sliding-window throttle for outbound API calls.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio::time::sleep_until;

/// Admits at most `max_requests` calls per rolling `window`.
///
/// The recorded-timestamp list is serialized by a single mutex, so two
/// concurrent acquirers never both proceed when capacity is exhausted; the
/// later one sleeps (holding the lock) until the oldest recorded call leaves
/// the window.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a call slot is available and record it.
    pub async fn acquire(&self) {
        if self.max_requests == 0 {
            return;
        }
        let mut events = self.events.lock().await;
        let now = Instant::now();
        Self::purge(&mut events, now, self.window);
        if events.len() < self.max_requests {
            events.push_back(now);
            return;
        }
        if let Some(oldest) = events.front().copied() {
            sleep_until(oldest + self.window).await;
        }
        let now = Instant::now();
        Self::purge(&mut events, now, self.window);
        events.push_back(now);
    }

    fn purge(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = events.front() {
            if now.duration_since(*oldest) >= window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn third_acquire_waits_for_the_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(10));
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn slots_free_up_as_the_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_capacity_disables_limiting() {
        let limiter = RateLimiter::new(0, Duration::from_secs(3600));
        let started = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_never_exceed_capacity() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(1)));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }
        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.expect("join"));
        }
        times.sort();
        // First two admitted immediately, the rest one window later.
        assert!(times[1].duration_since(times[0]) < Duration::from_millis(10));
        assert!(times[2].duration_since(times[0]) >= Duration::from_secs(1));
    }
}
