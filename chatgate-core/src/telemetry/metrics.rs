//! Chat metrics counters

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{AttemptEvent, AttemptObserver};
use crate::admission::{AdmissionClass, WindowKind};

#[derive(Debug, Default)]
struct Labelled {
    turns_by_outcome: HashMap<String, u64>,
    model_usage: HashMap<String, u64>,
    image_uploads: HashMap<String, u64>,
    rate_limit_denials: HashMap<String, u64>,
    errors_by_kind: HashMap<String, u64>,
}

/// Process-wide counters for chat traffic.
///
/// Plain counters and label maps only; [`ChatMetrics::snapshot`] is what
/// the metrics endpoint serves.
#[derive(Debug)]
pub struct ChatMetrics {
    started_at: DateTime<Utc>,
    upstream_attempts: AtomicU64,
    upstream_retries: AtomicU64,
    upstream_exhausted: AtomicU64,
    completed_turns: AtomicU64,
    completed_turn_ms: AtomicU64,
    labelled: Mutex<Labelled>,
}

/// Point-in-time view of [`ChatMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub turns_by_outcome: BTreeMap<String, u64>,
    pub model_usage: BTreeMap<String, u64>,
    pub image_uploads: BTreeMap<String, u64>,
    pub rate_limit_denials: BTreeMap<String, u64>,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub upstream_attempts: u64,
    pub upstream_retries: u64,
    pub upstream_exhausted: u64,
    pub avg_turn_ms: f64,
}

impl Default for ChatMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            upstream_attempts: AtomicU64::new(0),
            upstream_retries: AtomicU64::new(0),
            upstream_exhausted: AtomicU64::new(0),
            completed_turns: AtomicU64::new(0),
            completed_turn_ms: AtomicU64::new(0),
            labelled: Mutex::new(Labelled::default()),
        }
    }

    fn with_labels(&self, f: impl FnOnce(&mut Labelled)) {
        let mut labels = self.labelled.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *labels);
    }

    /// A chat turn completed against `model`.
    pub fn record_completed(&self, model: &str, elapsed: Duration) {
        self.completed_turns.fetch_add(1, Ordering::Relaxed);
        self.completed_turn_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.with_labels(|labels| {
            bump(&mut labels.turns_by_outcome, "completed");
            bump(&mut labels.model_usage, model);
        });
    }

    /// A chat turn failed with the given error kind.
    pub fn record_failed(&self, kind: &str) {
        self.with_labels(|labels| {
            bump(&mut labels.turns_by_outcome, "failed");
            bump(&mut labels.errors_by_kind, kind);
        });
    }

    pub fn record_image(&self, media_type: &str) {
        self.with_labels(|labels| bump(&mut labels.image_uploads, media_type));
    }

    pub fn record_rate_limited(&self, class: AdmissionClass, window: WindowKind) {
        let label = match class {
            AdmissionClass::Chat => format!("chat:{window}"),
            AdmissionClass::General => format!("general:{window}"),
        };
        self.with_labels(|labels| bump(&mut labels.rate_limit_denials, &label));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let labelled = self.labelled.lock().unwrap_or_else(PoisonError::into_inner);
        let completed = self.completed_turns.load(Ordering::Relaxed);
        let avg_turn_ms = if completed == 0 {
            0.0
        } else {
            self.completed_turn_ms.load(Ordering::Relaxed) as f64 / completed as f64
        };

        MetricsSnapshot {
            started_at: Some(self.started_at),
            turns_by_outcome: sorted(&labelled.turns_by_outcome),
            model_usage: sorted(&labelled.model_usage),
            image_uploads: sorted(&labelled.image_uploads),
            rate_limit_denials: sorted(&labelled.rate_limit_denials),
            errors_by_kind: sorted(&labelled.errors_by_kind),
            upstream_attempts: self.upstream_attempts.load(Ordering::Relaxed),
            upstream_retries: self.upstream_retries.load(Ordering::Relaxed),
            upstream_exhausted: self.upstream_exhausted.load(Ordering::Relaxed),
            avg_turn_ms,
        }
    }
}

impl AttemptObserver for ChatMetrics {
    fn on_attempt(&self, event: &AttemptEvent) {
        self.upstream_attempts.fetch_add(1, Ordering::Relaxed);
        if event.backoff.is_some() {
            self.upstream_retries.fetch_add(1, Ordering::Relaxed);
        }
        if event.exhausted {
            self.upstream_exhausted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn bump(map: &mut HashMap<String, u64>, label: &str) {
    *map.entry(label.to_string()).or_default() += 1;
}

fn sorted(map: &HashMap<String, u64>) -> BTreeMap<String, u64> {
    map.iter().map(|(k, v)| (k.clone(), *v)).collect()
}
