//! Sliding-log window

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{WindowKind, WindowQuota};

/// Ceiling for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    /// Maximum admitted requests inside any rolling `window`
    pub max_requests: u32,

    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl WindowLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn per_hour(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(3600))
    }
}

/// Admission timestamps still inside the window.
///
/// Keeping the log instead of a fixed-bucket counter means the ceiling holds
/// for every rolling interval, not only for aligned buckets.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
    kind: WindowKind,
    limit: WindowLimit,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    pub(crate) fn new(kind: WindowKind, limit: WindowLimit) -> Self {
        Self {
            kind,
            limit,
            hits: VecDeque::with_capacity(limit.max_requests.min(64) as usize),
        }
    }

    pub(crate) fn kind(&self) -> WindowKind {
        self.kind
    }

    /// Drop hits that have rolled out of the window.
    pub(crate) fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.limit.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn is_saturated(&self) -> bool {
        self.hits.len() >= self.limit.max_requests as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub(crate) fn record(&mut self, now: Instant) {
        self.hits.push_back(now);
    }

    /// Time until the oldest hit leaves the window.
    pub(crate) fn reset_after(&self, now: Instant) -> Duration {
        self.hits
            .front()
            .map(|&oldest| (oldest + self.limit.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn quota(&self, now: Instant) -> WindowQuota {
        WindowQuota {
            kind: self.kind,
            limit: self.limit.max_requests,
            remaining: self
                .limit
                .max_requests
                .saturating_sub(self.hits.len() as u32),
            reset_after: self.reset_after(now),
        }
    }
}
