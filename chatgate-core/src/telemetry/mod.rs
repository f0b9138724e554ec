//! Telemetry
//!
//! Upstream attempt reporting and in-process counters.
//!
//! # Example
//!
//! ```rust,ignore
//! use chatgate_core::telemetry::ChatMetrics;
//!
//! let metrics = Arc::new(ChatMetrics::new());
//! let caller = RetryingCaller::new(transport, policy).with_observer(metrics.clone());
//!
//! let snapshot = metrics.snapshot();
//! ```

mod metrics;

use std::fmt;
use std::time::Duration;

pub use metrics::{ChatMetrics, MetricsSnapshot};

/// What one upstream attempt produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// An HTTP status came back
    Status(u16),
    /// No status; the transport failed
    Transport(String),
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Status(status) => write!(f, "HTTP {status}"),
            AttemptOutcome::Transport(error) => write!(f, "{error}"),
        }
    }
}

/// One upstream attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptEvent {
    /// 0 for the initial call
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
    /// Delay before the next attempt, when one follows
    pub backoff: Option<Duration>,
    /// Set on the last attempt of an exhausted retry budget
    pub exhausted: bool,
}

/// Receives every upstream attempt
pub trait AttemptObserver: Send + Sync {
    fn on_attempt(&self, event: &AttemptEvent);
}

/// Logs attempts through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl AttemptObserver for TracingObserver {
    fn on_attempt(&self, event: &AttemptEvent) {
        let latency_ms = event.latency.as_millis() as u64;
        match event.backoff {
            Some(backoff) => tracing::warn!(
                attempt = event.attempt,
                outcome = %event.outcome,
                latency_ms,
                backoff_ms = backoff.as_millis() as u64,
                "upstream attempt failed, retrying"
            ),
            None if event.exhausted => tracing::error!(
                attempt = event.attempt,
                outcome = %event.outcome,
                latency_ms,
                "upstream attempt failed, retry budget spent"
            ),
            None => tracing::debug!(
                attempt = event.attempt,
                outcome = %event.outcome,
                latency_ms,
                "upstream attempt finished"
            ),
        }
    }
}
