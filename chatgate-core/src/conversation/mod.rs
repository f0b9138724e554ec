//! Conversation Session Management
//!
//! Sessions, their ordered message history, and the active-session pointer
//! of each client.
//!
//! # Example
//!
//! ```rust,ignore
//! use chatgate_core::conversation::{ClientContext, ConversationStore, InMemoryConversationStore, Message};
//!
//! let store = InMemoryConversationStore::default();
//! let ctx = ClientContext::new("203.0.113.7");
//!
//! let session = store.get_active(&ctx).await?;
//! store.append_message(session.id(), Message::user("Hello!")).await?;
//! ```

mod inmemory;
mod message;
mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChatError, Result};

pub use inmemory::InMemoryConversationStore;
pub use message::{ImageAttachment, Message, Role, TokenUsage};
pub use session::{Session, SessionId, SessionStats, SessionSummary, TitlePolicy, TitleSource};

/// Owner of an active-session pointer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientContext(String);

impl ClientContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session and title settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Title given to new sessions
    pub default_title: String,

    /// Automatic titling applies while a session holds at most this many
    /// user messages
    pub auto_title_max_turns: usize,

    /// Maximum length of a derived title, in characters
    pub title_max_chars: usize,

    /// Most recent messages sent upstream; `None` sends all of them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_window: Option<usize>,

    /// Maximum decoded image size
    pub max_image_bytes: usize,

    /// Accepted image media types
    pub allowed_image_types: Vec<String>,

    /// Maximum user message length, in characters
    pub max_message_chars: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            default_title: "New Chat".to_string(),
            auto_title_max_turns: 5,
            title_max_chars: 50,
            history_window: None,
            max_image_bytes: 5 * 1024 * 1024,
            allowed_image_types: vec![
                "image/png".to_string(),
                "image/jpeg".to_string(),
                "image/gif".to_string(),
                "image/webp".to_string(),
            ],
            max_message_chars: 32_000,
        }
    }
}

impl ConversationConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.default_title.trim().is_empty() {
            return Err(ChatError::Configuration(
                "conversation.default_title must not be empty".to_string(),
            ));
        }
        if self.title_max_chars == 0 {
            return Err(ChatError::Configuration(
                "conversation.title_max_chars must be positive".to_string(),
            ));
        }
        if self.history_window == Some(0) {
            return Err(ChatError::Configuration(
                "conversation.history_window must be positive when set".to_string(),
            ));
        }
        if self.max_image_bytes == 0 || self.max_message_chars == 0 {
            return Err(ChatError::Configuration(
                "conversation size limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session storage.
///
/// Implementations must keep each session's message order append-only and
/// serialize mutations of the same session.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty session and make it active for `ctx`.
    async fn create_session(&self, ctx: &ClientContext, title: Option<String>) -> Result<Session>;

    /// Active session of `ctx`, created on first use.
    async fn get_active(&self, ctx: &ClientContext) -> Result<Session>;

    /// Point `ctx` at an existing session.
    async fn switch_active(&self, ctx: &ClientContext, id: SessionId) -> Result<Session>;

    async fn get_session(&self, id: SessionId) -> Result<Session>;

    /// Messages of a session in insertion order.
    async fn history(&self, id: SessionId) -> Result<Vec<Message>>;

    async fn append_message(&self, id: SessionId, message: Message) -> Result<()>;

    async fn rename_session(&self, id: SessionId, title: String) -> Result<()>;

    /// Delete a session and clear every active pointer naming it.
    async fn delete_session(&self, id: SessionId) -> Result<()>;

    /// Remove all messages of a session. Returns the removed count.
    async fn clear_session(&self, id: SessionId) -> Result<usize>;

    /// Sessions by most recent update first.
    async fn list_sessions(
        &self,
        ctx: &ClientContext,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionSummary>>;

    async fn session_stats(&self, id: SessionId) -> Result<SessionStats>;
}
