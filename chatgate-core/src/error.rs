//! Error types for chatgate operations

use std::time::Duration;

use crate::admission::WindowKind;

/// Result type for chatgate operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Error types for the chat core.
///
/// Every non-success path of a chat turn ends in one of these variants.
/// [`ChatError::kind`] is the stable label used for logs and metrics,
/// [`ChatError::user_message`] is what an end user gets to see.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Admission denied by the rate limiter
    #[error("Rate limit exceeded on {window} window, retry after {retry_after:?}")]
    RateLimited {
        window: WindowKind,
        retry_after: Duration,
    },

    /// Session id is unknown to the store
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Image attached for a model that only accepts text
    #[error("Model {model} does not accept image input")]
    UnsupportedModality { model: String },

    /// Upstream failed transiently and the call was abandoned before the
    /// retry budget ran out
    #[error("Upstream transient failure: {reason}")]
    UpstreamTransientFailure { reason: String },

    /// Upstream kept failing until the retry budget was spent
    #[error("Upstream call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Upstream answered with a non-retryable error status
    #[error("Upstream rejected request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    /// Upstream payload could not be turned into a message
    #[error("Invalid provider response: {0}")]
    ProviderResponseInvalid(String),

    /// Malformed inbound request
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Stable snake_case label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::RateLimited { .. } => "rate_limited",
            ChatError::SessionNotFound(_) => "session_not_found",
            ChatError::UnsupportedModality { .. } => "unsupported_modality",
            ChatError::UpstreamTransientFailure { .. } => "upstream_transient_failure",
            ChatError::RetriesExhausted { .. } => "retries_exhausted",
            ChatError::UpstreamRejected { .. } => "upstream_rejected",
            ChatError::ProviderResponseInvalid(_) => "provider_response_invalid",
            ChatError::ValidationError(_) => "validation_error",
            ChatError::Configuration(_) => "configuration",
            ChatError::Serialization(_) => "serialization",
            ChatError::Io(_) => "io",
        }
    }

    /// Text safe to show to an end user.
    ///
    /// Upstream failures collapse into a generic "try again" message; attempt
    /// counts stay in logs and metrics only.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::RateLimited { retry_after, .. } => format!(
                "Too many requests. Please retry after {} seconds.",
                whole_seconds(*retry_after)
            ),
            ChatError::SessionNotFound(_) => "Session not found.".to_string(),
            ChatError::UnsupportedModality { model } => {
                format!("The model {model} does not support image input.")
            }
            ChatError::UpstreamTransientFailure { .. } | ChatError::RetriesExhausted { .. } => {
                "The model provider is temporarily unavailable. Please try again.".to_string()
            }
            ChatError::UpstreamRejected { message, .. } => {
                format!("The model provider rejected the request: {message}")
            }
            ChatError::ProviderResponseInvalid(_) => {
                "The model provider returned an unusable response. Please try again.".to_string()
            }
            ChatError::ValidationError(detail) => detail.clone(),
            ChatError::Configuration(_)
            | ChatError::Serialization(_)
            | ChatError::Io(_) => "Internal server error.".to_string(),
        }
    }
}

/// Rounds a delay up to whole seconds, never below one.
pub fn whole_seconds(delay: Duration) -> u64 {
    let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_seconds_rounds_up() {
        assert_eq!(whole_seconds(Duration::from_millis(1)), 1);
        assert_eq!(whole_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(whole_seconds(Duration::from_secs(3)), 3);
        assert_eq!(whole_seconds(Duration::ZERO), 1);
    }

    #[test]
    fn test_exhaustion_hides_attempt_count() {
        let err = ChatError::RetriesExhausted {
            attempts: 4,
            last: "status 503".to_string(),
        };
        assert_eq!(err.kind(), "retries_exhausted");
        assert!(!err.user_message().contains('4'));
        assert!(err.to_string().contains("4 attempts"));
    }

    #[test]
    fn test_rate_limited_message_mentions_delay() {
        let err = ChatError::RateLimited {
            window: WindowKind::Minute,
            retry_after: Duration::from_millis(12_300),
        };
        assert!(err.user_message().contains("13 seconds"));
    }

    #[test]
    fn test_internal_failures_hide_detail() {
        let errors = [
            ChatError::Configuration("retry.max_backoff unreadable".to_string()),
            ChatError::Io(std::io::Error::other("disk gone")),
        ];
        for err in errors {
            assert_eq!(err.user_message(), "Internal server error.");
            assert!(!err.kind().is_empty());
        }
    }
}
