//! Per-endpoint sliding-window rate limiter with adaptive shrink on 429.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

struct Cell {
    limit: usize,
    grants: VecDeque<Instant>,
}

/// A process-wide, per-endpoint sliding-window admission controller.
///
/// Mirrors the shape of a polling API client's rate limiter (evict stale
/// timestamps, admit if under budget, otherwise sleep until the oldest grant
/// ages out) generalized to one cell per endpoint key behind an outer
/// registry lock.
pub struct RateLimiter {
    cells: Mutex<HashMap<String, Cell>>,
    default_limit: usize,
}

impl RateLimiter {
    pub fn new(default_limit: usize) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            default_limit,
        }
    }

    pub async fn configure(&self, endpoint: &str, limit: usize) {
        let mut cells = self.cells.lock().await;
        cells.insert(
            endpoint.to_string(),
            Cell {
                limit,
                grants: VecDeque::new(),
            },
        );
    }

    /// Block until a request to `endpoint` is admitted under its current
    /// per-minute budget.
    pub async fn acquire(&self, endpoint: &str) {
        loop {
            let wait = {
                let mut cells = self.cells.lock().await;
                let default_limit = self.default_limit;
                let cell = cells.entry(endpoint.to_string()).or_insert_with(|| Cell {
                    limit: default_limit,
                    grants: VecDeque::new(),
                });
                let now = Instant::now();
                while let Some(&front) = cell.grants.front() {
                    if now.duration_since(front) >= WINDOW {
                        cell.grants.pop_front();
                    } else {
                        break;
                    }
                }
                if cell.grants.len() < cell.limit {
                    cell.grants.push_back(now);
                    None
                } else {
                    let oldest = *cell.grants.front().unwrap();
                    Some((oldest + WINDOW).saturating_duration_since(now) + Duration::from_millis(50))
                }
            };
            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }

    /// Called when the upstream returns 429: shrink the endpoint's budget by
    /// 20%, floored at 1. The limiter never grows an endpoint back on its
    /// own.
    pub async fn throttle(&self, endpoint: &str) {
        let mut cells = self.cells.lock().await;
        let default_limit = self.default_limit;
        let cell = cells.entry(endpoint.to_string()).or_insert_with(|| Cell {
            limit: default_limit,
            grants: VecDeque::new(),
        });
        let new_limit = std::cmp::max(1, (cell.limit as f64 * 0.8).floor() as usize);
        debug!(endpoint, old = cell.limit, new = new_limit, "rate limiter shrinking after 429");
        cell.limit = new_limit;
    }

    pub async fn current_limit(&self, endpoint: &str) -> usize {
        let cells = self.cells.lock().await;
        cells.get(endpoint).map(|c| c.limit).unwrap_or(self.default_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test(start_paused = true)]
    async fn admits_no_more_than_limit_per_window() {
        let limiter = RateLimiter::new(10);
        limiter.configure("/quote", 2).await;

        limiter.acquire("/quote").await;
        limiter.acquire("/quote").await;

        let start = Instant::now();
        limiter.acquire("/quote").await;
        let elapsed = Instant::now().duration_since(start);
        assert!(elapsed >= StdDuration::from_secs(59));
    }

    #[tokio::test]
    async fn throttle_shrinks_limit_by_twenty_percent_floored_at_one() {
        let limiter = RateLimiter::new(10);
        limiter.configure("/quote", 5).await;
        limiter.throttle("/quote").await;
        assert_eq!(limiter.current_limit("/quote").await, 4);
        for _ in 0..10 {
            limiter.throttle("/quote").await;
        }
        assert_eq!(limiter.current_limit("/quote").await, 1);
    }

    #[tokio::test]
    async fn unregistered_endpoint_uses_default_limit() {
        let limiter = RateLimiter::new(3);
        assert_eq!(limiter.current_limit("/unknown").await, 3);
    }
}
