//! Retry Logic for Upstream Calls
//!
//! Exponential backoff with jitter around a pluggable [`HttpTransport`].
//! Attempt 0 is the initial call; a retryable status or a transient
//! transport error schedules another attempt until `max_retries` retries
//! have been spent.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::telemetry::{AttemptEvent, AttemptObserver, AttemptOutcome, TracingObserver};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for any delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Shrink each delay by up to 25%
    pub jitter: bool,

    /// Statuses treated as transient
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            jitter: true,
            retryable_statuses: vec![
                429, // Too Many Requests
                500, // Internal Server Error
                502, // Bad Gateway
                503, // Service Unavailable
                504, // Gateway Timeout
            ],
        }
    }
}

impl RetryPolicy {
    /// Policy with a single attempt
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay after the given attempt (0-indexed):
    /// `min(max_backoff, initial_backoff * 2^attempt)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay actually slept after the given attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_for(attempt);
        if self.jitter {
            let shrink: f64 = rand::thread_rng().gen_range(0.0..0.25);
            base.mul_f64(1.0 - shrink)
        } else {
            base
        }
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(ChatError::Configuration(
                "retry.initial_backoff must be positive".to_string(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ChatError::Configuration(format!(
                "retry.initial_backoff ({:?}) exceeds retry.max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

/// HTTP method of an upstream request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Everything needed to (re)issue one upstream request
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Applied to each attempt separately
    pub timeout: Duration,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            ..Self::get(url, timeout)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Raw upstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure below the HTTP status level
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection interrupted: {0}")]
    Interrupted(String),

    #[error("request could not be sent: {0}")]
    Request(String),
}

impl TransportError {
    /// Timeouts, connect failures and dropped connections are retried.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Request(_))
    }
}

/// Executes a single HTTP exchange
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        request: &RequestSpec,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// A response that needs no further retries
#[derive(Debug, Clone)]
pub struct CallSuccess {
    /// Final response; may carry a non-retryable error status
    pub response: TransportResponse,
    /// Attempts made, including the initial one
    pub attempts: u32,
}

/// Why an upstream call gave up
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallFailure {
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("transport error on attempt {attempts}: {error}")]
    Transport { attempts: u32, error: TransportError },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last: Option<String> },
}

impl CallFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            CallFailure::RetriesExhausted { attempts, .. }
            | CallFailure::Transport { attempts, .. }
            | CallFailure::Cancelled { attempts, .. } => *attempts,
        }
    }
}

impl From<CallFailure> for ChatError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::RetriesExhausted { attempts, last } => {
                ChatError::RetriesExhausted { attempts, last }
            }
            CallFailure::Transport { error, .. } => ChatError::UpstreamTransientFailure {
                reason: error.to_string(),
            },
            CallFailure::Cancelled { last, .. } => ChatError::UpstreamTransientFailure {
                reason: match last {
                    Some(last) => format!("cancelled while retrying ({last})"),
                    None => "cancelled".to_string(),
                },
            },
        }
    }
}

/// Resilient caller shared by every upstream request
#[derive(Clone)]
pub struct RetryingCaller {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    observers: Vec<Arc<dyn AttemptObserver>>,
}

impl fmt::Debug for RetryingCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingCaller")
            .field("policy", &self.policy)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl RetryingCaller {
    /// Create a caller that reports attempts to the tracing log.
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            observers: vec![Arc::new(TracingObserver)],
        }
    }

    /// Builder: report attempts to an additional observer
    pub fn with_observer(mut self, observer: Arc<dyn AttemptObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn notify(&self, event: &AttemptEvent) {
        for observer in &self.observers {
            observer.on_attempt(event);
        }
    }

    /// Issue `request`, retrying transient failures.
    ///
    /// Each attempt is bounded by `request.timeout`; an attempt that runs
    /// over counts as a transient timeout. Cancellation is checked before
    /// each attempt and raced against the in-flight attempt and every
    /// backoff sleep.
    pub async fn invoke(
        &self,
        request: &RequestSpec,
        cancel: &CancellationToken,
    ) -> std::result::Result<CallSuccess, CallFailure> {
        let mut attempt: u32 = 0;
        let mut last: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CallFailure::Cancelled {
                    attempts: attempt,
                    last,
                });
            }

            let started = Instant::now();
            let bounded = tokio::time::timeout(request.timeout, self.transport.execute(request));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CallFailure::Cancelled { attempts: attempt + 1, last });
                }
                result = bounded => result.unwrap_or(Err(TransportError::Timeout)),
            };
            let latency = started.elapsed();

            let (outcome, reason) = match result {
                Ok(response) if !self.policy.is_retryable_status(response.status) => {
                    self.notify(&AttemptEvent {
                        attempt,
                        outcome: AttemptOutcome::Status(response.status),
                        latency,
                        backoff: None,
                        exhausted: false,
                    });
                    return Ok(CallSuccess {
                        response,
                        attempts: attempt + 1,
                    });
                }
                Ok(response) => (
                    AttemptOutcome::Status(response.status),
                    format!("HTTP {}", response.status),
                ),
                Err(error) if error.is_transient() => {
                    let reason = error.to_string();
                    (AttemptOutcome::Transport(reason.clone()), reason)
                }
                Err(error) => {
                    self.notify(&AttemptEvent {
                        attempt,
                        outcome: AttemptOutcome::Transport(error.to_string()),
                        latency,
                        backoff: None,
                        exhausted: false,
                    });
                    return Err(CallFailure::Transport {
                        attempts: attempt + 1,
                        error,
                    });
                }
            };

            if attempt >= self.policy.max_retries {
                self.notify(&AttemptEvent {
                    attempt,
                    outcome,
                    latency,
                    backoff: None,
                    exhausted: true,
                });
                warn!(attempts = attempt + 1, last = %reason, url = %request.url, "upstream retries exhausted");
                return Err(CallFailure::RetriesExhausted {
                    attempts: attempt + 1,
                    last: reason,
                });
            }

            let backoff = self.policy.delay_for(attempt);
            self.notify(&AttemptEvent {
                attempt,
                outcome,
                latency,
                backoff: Some(backoff),
                exhausted: false,
            });
            last = Some(reason);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(attempts = attempt + 1, "upstream call cancelled during backoff");
                    return Err(CallFailure::Cancelled { attempts: attempt + 1, last });
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }
}
