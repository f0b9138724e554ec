//! Conversation Session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ConversationConfig;
use super::message::{Message, Role};

/// Session identifier
pub type SessionId = Uuid;

/// Where the current title came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleSource {
    /// Placeholder title, eligible for automatic titling
    Default,
    /// Derived from the first user message
    Auto,
    /// Set explicitly; never overwritten automatically
    User,
}

/// Automatic titling rules
#[derive(Debug, Clone)]
pub struct TitlePolicy {
    pub default_title: String,
    /// Automatic titling stops once a session holds more user messages
    pub auto_title_max_turns: usize,
    pub title_max_chars: usize,
}

impl TitlePolicy {
    pub fn from_config(config: &ConversationConfig) -> Self {
        Self {
            default_title: config.default_title.clone(),
            auto_title_max_turns: config.auto_title_max_turns,
            title_max_chars: config.title_max_chars,
        }
    }

    /// Title derived from the leading characters of `content`, with `...`
    /// appended when truncated.
    pub fn derive_title(&self, content: &str) -> Option<String> {
        let normalized = content.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return None;
        }
        if normalized.chars().count() <= self.title_max_chars {
            return Some(normalized);
        }
        let head: String = normalized.chars().take(self.title_max_chars).collect();
        Some(format!("{}...", head.trim_end()))
    }
}

impl Default for TitlePolicy {
    fn default() -> Self {
        Self::from_config(&ConversationConfig::default())
    }
}

/// Listing entry for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Aggregates over a session's messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub avg_response_time_ms: f64,
}

/// A conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    title: String,
    title_source: TitleSource,
    messages: Vec<Message>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a session with the placeholder title
    pub fn new(policy: &TitlePolicy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: policy.default_title.clone(),
            title_source: TitleSource::Default,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a session with an explicit title
    pub fn with_title(policy: &TitlePolicy, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            title_source: TitleSource::User,
            ..Self::new(policy)
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn title_source(&self) -> TitleSource {
        self.title_source
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn user_turns(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    /// Append a message, applying automatic titling to user messages.
    pub fn push(&mut self, message: Message, policy: &TitlePolicy) {
        let is_user = message.role == Role::User;
        let content = is_user.then(|| message.content.clone());
        self.messages.push(message);

        if let Some(content) = content {
            if self.title_source == TitleSource::Default
                && self.user_turns() <= policy.auto_title_max_turns
            {
                if let Some(title) = policy.derive_title(&content) {
                    tracing::debug!(session_id = %self.id, %title, "auto-titled session");
                    self.title = title;
                    self.title_source = TitleSource::Auto;
                }
            }
        }
        self.touch();
    }

    /// Set an explicit title. Returns false when the title was unchanged.
    pub fn rename(&mut self, title: impl Into<String>) -> bool {
        let title = title.into();
        if title == self.title {
            // Still pin the source so automatic titling cannot replace it.
            self.title_source = TitleSource::User;
            return false;
        }
        self.title = title;
        self.title_source = TitleSource::User;
        self.touch();
        true
    }

    /// Remove all messages, keeping the session. Returns the removed count.
    pub fn clear(&mut self) -> usize {
        let removed = self.messages.len();
        self.messages.clear();
        self.touch();
        removed
    }

    pub fn summary(&self, is_active: bool) -> SessionSummary {
        SessionSummary {
            id: self.id,
            title: self.title.clone(),
            message_count: self.messages.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            is_active,
        }
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            session_id: self.id,
            total_messages: self.messages.len(),
            ..Default::default()
        };
        let mut timed = 0u64;
        let mut total_ms = 0u64;

        for message in &self.messages {
            match message.role {
                Role::User => stats.user_messages += 1,
                Role::Assistant => stats.assistant_messages += 1,
                Role::System => {}
            }
            if let Some(usage) = message.usage {
                stats.total_prompt_tokens += usage.prompt_tokens;
                stats.total_completion_tokens += usage.completion_tokens;
            }
            if let Some(ms) = message.response_time_ms {
                timed += 1;
                total_ms += ms;
            }
        }
        if timed > 0 {
            stats.avg_response_time_ms = total_ms as f64 / timed as f64;
        }
        stats
    }
}
