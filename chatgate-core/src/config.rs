//! Configuration types for chatgate

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::admission::RateLimitConfig;
use crate::conversation::ConversationConfig;
use crate::error::{ChatError, Result};
use crate::llm::catalog::ModelsConfig;
use crate::llm::retry::RetryPolicy;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "chatgate.toml";

/// Environment prefix for overrides (`CHATGATE_RETRY__MAX_RETRIES=5`)
pub const ENV_PREFIX: &str = "CHATGATE_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChatgateConfig {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Upstream provider configuration
    pub upstream: UpstreamConfig,

    /// Retry tuning for upstream calls
    pub retry: RetryPolicy,

    /// Admission ceilings
    pub rate_limit: RateLimitConfig,

    /// Session and title policy
    pub conversation: ConversationConfig,

    /// Model catalog
    pub models: ModelsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: String,

    /// How often idle rate-limit state is swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Upstream (OpenRouter-compatible) provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// API credential; falls back to `OPENROUTER_API_KEY`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// API base URL
    pub base_url: String,

    /// Sent as `X-Title`
    pub app_name: String,

    /// Sent as `HTTP-Referer`
    pub referer: String,

    /// Per-attempt timeout for chat completions
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Per-attempt timeout for the model listing
    #[serde(with = "humantime_serde")]
    pub models_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            app_name: "AI Chat Application".to_string(),
            referer: "http://localhost:8000".to_string(),
            request_timeout: Duration::from_secs(120),
            models_timeout: Duration::from_secs(30),
        }
    }
}

impl ChatgateConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `chatgate.toml`, then the file named by `CHATGATE_CONFIG_PATH`
    /// 3. `CHATGATE_` environment overrides, `__` separating nested keys
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid or the merged
    /// configuration fails validation.
    pub fn load() -> Result<Self> {
        let extra = std::env::var("CHATGATE_CONFIG_PATH").ok();
        Self::load_with(extra.as_deref().map(Path::new))
    }

    /// Load configuration with an explicit extra file merged after the
    /// default one (e.g. from a `--config` flag).
    pub fn load_with(extra: Option<&Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ChatgateConfig::default()))
            .merge(Toml::file(DEFAULT_CONFIG_FILE));
        if let Some(path) = extra {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: ChatgateConfig = figment.extract().map_err(|e| {
            ChatError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.apply_env_fallbacks();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, without env overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: ChatgateConfig = Figment::from(Serialized::defaults(ChatgateConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                ChatError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_fallbacks(&mut self) {
        if self.upstream.api_key.is_none() {
            self.upstream.api_key = std::env::var("OPENROUTER_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty());
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any ceiling is zero or the backoff bounds are
    /// inverted.
    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;
        self.retry.validate()?;
        self.conversation.validate()?;

        if self.upstream.base_url.trim().is_empty() {
            return Err(ChatError::Configuration(
                "upstream.base_url must not be empty".to_string(),
            ));
        }
        if self.upstream.request_timeout.is_zero() {
            return Err(ChatError::Configuration(
                "upstream.request_timeout must be positive".to_string(),
            ));
        }
        if self.server.sweep_interval.is_zero() {
            return Err(ChatError::Configuration(
                "server.sweep_interval must be positive".to_string(),
            ));
        }
        if self.models.default_model.trim().is_empty() {
            return Err(ChatError::Configuration(
                "models.default_model must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_validate() {
        let config = ChatgateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.rate_limit.general.per_minute.max_requests, 60);
        assert_eq!(config.conversation.auto_title_max_turns, 5);
    }

    #[test]
    fn test_load_from_toml_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "chatgate.toml",
                r#"
                [retry]
                max_retries = 5
                initial_backoff = "250ms"
                max_backoff = "4s"

                [rate_limit.chat.per_minute]
                max_requests = 30
                window = "1m"
                "#,
            )?;
            jail.set_env("CHATGATE_UPSTREAM__API_KEY", "sk-test");
            jail.set_env("CHATGATE_CONVERSATION__TITLE_MAX_CHARS", "32");

            let config = ChatgateConfig::load_with(None).expect("config loads");
            assert_eq!(config.retry.max_retries, 5);
            assert_eq!(config.retry.initial_backoff, Duration::from_millis(250));
            assert_eq!(config.rate_limit.chat.per_minute.max_requests, 30);
            assert_eq!(config.rate_limit.chat.per_hour.max_requests, 200);
            assert_eq!(config.upstream.api_key.as_deref(), Some("sk-test"));
            assert_eq!(config.conversation.title_max_chars, 32);
            Ok(())
        });
    }

    #[test]
    fn test_openrouter_key_fallback() {
        Jail::expect_with(|jail| {
            jail.set_env("OPENROUTER_API_KEY", "sk-fallback");
            let config = ChatgateConfig::load_with(None).expect("config loads");
            assert_eq!(config.upstream.api_key.as_deref(), Some("sk-fallback"));
            Ok(())
        });
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let mut config = ChatgateConfig::default();
        config.server.sweep_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ChatError::Configuration(msg)) if msg.contains("sweep_interval")
        ));
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "custom.toml",
                r#"
                [retry]
                initial_backoff = "20s"
                max_backoff = "1s"
                "#,
            )?;
            let err = ChatgateConfig::from_file("custom.toml").unwrap_err();
            assert!(matches!(err, ChatError::Configuration(_)));
            Ok(())
        });
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let mut config = ChatgateConfig::default();
        config.rate_limit.general.burst.max_requests = 0;
        assert!(config.validate().is_err());
    }
}
