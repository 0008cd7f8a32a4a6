//! Sliding-window request rate limiter.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Limits outgoing requests to at most `max_requests` per sliding window.
///
/// Before each request, timestamps older than the window are evicted; if
/// the window is full the caller sleeps until the oldest entry ages out,
/// then records its own timestamp. Admission order is the lock acquisition
/// order, so a burst drains first-come first-served.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    /// The default 60 s window.
    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Wait until a request slot is available, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = timestamps.front() {
                    if now.duration_since(oldest) >= self.window {
                        timestamps.pop_front();
                    } else {
                        break;
                    }
                }
                if timestamps.len() < self.max_requests {
                    timestamps.push_back(now);
                    None
                } else {
                    // Sleep until the oldest timestamp ages out of the window
                    timestamps
                        .front()
                        .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
                }
            };

            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }

    /// Current number of requests inside the window (for status reporting).
    pub async fn in_window(&self) -> usize {
        let mut timestamps = self.timestamps.lock().await;
        let now = Instant::now();
        while let Some(&oldest) = timestamps.front() {
            if now.duration_since(oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_without_waiting() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));

        let before = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_window().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttles_past_limit_until_window_rolls() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            limiter.acquire().await;
        }

        // Fourth acquisition must wait for the first slot to age out
        let before = Instant::now();
        limiter.acquire().await;
        assert!(before.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_exceeds_limit_under_burst() {
        let limiter = std::sync::Arc::new(RateLimiter::new(10, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..15 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
            }));
        }
        // Give every task a chance to contend before time moves
        tokio::task::yield_now().await;
        assert!(limiter.in_window().await <= 10);

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(limiter.in_window().await <= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_free_up_after_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.acquire().await;
        limiter.acquire().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.in_window().await, 0);

        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
