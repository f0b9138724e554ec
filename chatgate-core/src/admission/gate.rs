//! Admission gate

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::window::{SlidingWindow, WindowLimit};
use super::{AdmissionClass, Decision, WindowKind};
use crate::error::{ChatError, Result};

/// Ceilings for the three windows of one admission class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPolicy {
    pub burst: WindowLimit,
    pub per_minute: WindowLimit,
    pub per_hour: WindowLimit,
}

impl WindowPolicy {
    fn limit(&self, kind: WindowKind) -> WindowLimit {
        match kind {
            WindowKind::Burst => self.burst,
            WindowKind::Minute => self.per_minute,
            WindowKind::Hour => self.per_hour,
        }
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Ceilings for chat turns
    pub chat: WindowPolicy,

    /// Ceilings for everything else
    pub general: WindowPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            chat: WindowPolicy {
                burst: WindowLimit::per_second(10),
                per_minute: WindowLimit::per_minute(20),
                per_hour: WindowLimit::per_hour(200),
            },
            general: WindowPolicy {
                burst: WindowLimit::per_second(10),
                per_minute: WindowLimit::per_minute(60),
                per_hour: WindowLimit::per_hour(500),
            },
        }
    }
}

impl RateLimitConfig {
    /// Same ceilings for both classes
    pub fn uniform(policy: WindowPolicy) -> Self {
        Self {
            chat: policy,
            general: policy,
        }
    }

    pub fn policy(&self, class: AdmissionClass) -> &WindowPolicy {
        match class {
            AdmissionClass::Chat => &self.chat,
            AdmissionClass::General => &self.general,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (name, policy) in [("chat", &self.chat), ("general", &self.general)] {
            for kind in WindowKind::ALL {
                let limit = policy.limit(kind);
                if limit.max_requests == 0 || limit.window.is_zero() {
                    return Err(ChatError::Configuration(format!(
                        "rate_limit.{name} {kind} window needs a positive ceiling and length"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-client state: one sliding window per kind
#[derive(Debug)]
struct ClientWindows {
    windows: [SlidingWindow; 3],
    /// Set once a sweep has dropped this entry from the map
    retired: bool,
}

impl ClientWindows {
    fn new(policy: &WindowPolicy) -> Self {
        Self {
            windows: WindowKind::ALL.map(|kind| SlidingWindow::new(kind, policy.limit(kind))),
            retired: false,
        }
    }

    fn evict(&mut self, now: Instant) {
        for window in &mut self.windows {
            window.evict(now);
        }
    }

    fn is_idle(&self) -> bool {
        self.windows.iter().all(SlidingWindow::is_empty)
    }

    fn admit(&mut self, now: Instant) -> Decision {
        self.evict(now);

        if let Some(saturated) = self.windows.iter().find(|w| w.is_saturated()) {
            let window = saturated.kind();
            let retry_after = saturated.reset_after(now);
            return Decision::RateLimited {
                window,
                retry_after,
                quotas: self.windows.iter().map(|w| w.quota(now)).collect(),
            };
        }

        for window in &mut self.windows {
            window.record(now);
        }
        Decision::Admitted {
            quotas: self.windows.iter().map(|w| w.quota(now)).collect(),
        }
    }
}

type ClientKey = (AdmissionClass, String);

/// Per-client rate limiter.
///
/// The client map is locked only to find or insert a client's entry; the
/// windows themselves sit behind a per-client mutex so unrelated clients
/// never contend.
pub struct AdmissionGate {
    config: RateLimitConfig,
    clients: RwLock<HashMap<ClientKey, Arc<Mutex<ClientWindows>>>>,
}

impl AdmissionGate {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and record one request for `client`.
    pub fn admit(&self, client: &str, class: AdmissionClass) -> Decision {
        self.admit_at(client, class, Instant::now())
    }

    /// Like [`admit`](Self::admit) with an explicit clock reading.
    pub fn admit_at(&self, client: &str, class: AdmissionClass, now: Instant) -> Decision {
        let entry = self.client_entry(client, class);
        let decision = self.admit_entry(entry, client, class, now);

        match &decision {
            Decision::Admitted { .. } => {
                tracing::debug!(client, ?class, "request admitted");
            }
            Decision::RateLimited {
                window,
                retry_after,
                ..
            } => {
                tracing::info!(
                    client,
                    ?class,
                    %window,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "request rate limited"
                );
            }
        }
        decision
    }

    /// Record into `entry`, or into the current map entry if a sweep
    /// retired `entry` after it was looked up.
    fn admit_entry(
        &self,
        mut entry: Arc<Mutex<ClientWindows>>,
        client: &str,
        class: AdmissionClass,
        now: Instant,
    ) -> Decision {
        loop {
            {
                let mut windows = entry.lock().unwrap_or_else(PoisonError::into_inner);
                if !windows.retired {
                    return windows.admit(now);
                }
            }
            entry = self.client_entry(client, class);
        }
    }

    fn client_entry(&self, client: &str, class: AdmissionClass) -> Arc<Mutex<ClientWindows>> {
        let key = (class, client.to_string());
        if let Some(entry) = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return entry.clone();
        }

        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        clients
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(ClientWindows::new(self.config.policy(class)))))
            .clone()
    }

    /// Forget clients whose windows have all drained. Returns how many were
    /// dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let before = clients.len();
        clients.retain(|_, entry| {
            let mut windows = entry.lock().unwrap_or_else(PoisonError::into_inner);
            windows.evict(now);
            windows.retired = windows.is_idle();
            !windows.retired
        });
        let dropped = before - clients.len();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = clients.len(), "swept idle rate-limit state");
        }
        dropped
    }

    /// Number of tracked (client, class) entries
    pub fn tracked_clients(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
