//! Sliding-window request budget for the background context.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            history: VecDeque::with_capacity(max_requests),
        }
    }

    /// Record a request at `now` if the budget allows it; otherwise return how long
    /// until the oldest request leaves the window.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        while let Some(&oldest) = self.history.front() {
            if now.duration_since(oldest) >= self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if self.history.len() >= self.max_requests {
            let oldest = self.history.front().copied().unwrap_or(now);
            return Err(self.window.saturating_sub(now.duration_since(oldest)));
        }

        self.history.push_back(now);
        Ok(())
    }

    pub fn remaining(&self, now: Instant) -> usize {
        let live = self
            .history
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count();
        self.max_requests.saturating_sub(live)
    }
}
