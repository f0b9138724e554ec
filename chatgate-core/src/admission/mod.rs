//! Request admission
//!
//! Per-client rate limiting over three concurrent windows (burst, minute,
//! hour). A request is admitted only when none of the windows is saturated,
//! and admitting it records it in all three at once.
//!
//! Denial is not an error: [`Decision::RateLimited`] carries the offending
//! window, its reset delay, and the remaining quota of every window.

mod gate;
mod window;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use gate::{AdmissionGate, RateLimitConfig, WindowPolicy};
pub use window::WindowLimit;

/// The three enforced windows, in check order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Burst,
    Minute,
    Hour,
}

impl WindowKind {
    pub const ALL: [WindowKind; 3] = [WindowKind::Burst, WindowKind::Minute, WindowKind::Hour];

    /// Suffix used in `X-RateLimit-*` headers
    pub fn header_suffix(&self) -> &'static str {
        match self {
            WindowKind::Burst => "Burst",
            WindowKind::Minute => "Minute",
            WindowKind::Hour => "Hour",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::Burst => write!(f, "burst"),
            WindowKind::Minute => write!(f, "minute"),
            WindowKind::Hour => write!(f, "hour"),
        }
    }
}

/// Which ceilings apply to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionClass {
    /// Posting a chat turn (reaches the upstream provider)
    Chat,
    /// Every other API call
    General,
}

/// Quota snapshot for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowQuota {
    pub kind: WindowKind,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the oldest admitted request leaves the window
    pub reset_after: Duration,
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admitted {
        quotas: Vec<WindowQuota>,
    },
    RateLimited {
        window: WindowKind,
        retry_after: Duration,
        quotas: Vec<WindowQuota>,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }

    /// Quotas of all three windows, whatever the outcome
    pub fn quotas(&self) -> &[WindowQuota] {
        match self {
            Decision::Admitted { quotas } | Decision::RateLimited { quotas, .. } => quotas,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Admitted { .. } => None,
            Decision::RateLimited { retry_after, .. } => Some(*retry_after),
        }
    }

    pub fn remaining(&self, kind: WindowKind) -> Option<u32> {
        self.quotas()
            .iter()
            .find(|q| q.kind == kind)
            .map(|q| q.remaining)
    }
}
