//! # Chatgate - Core of a Rate-Limited, Session-Aware Chat Backend
//!
//! Chatgate sits between chat clients and an OpenAI-compatible model
//! provider. The core crate carries everything but the HTTP surface:
//! - Per-client admission over burst, per-minute and per-hour windows
//! - Conversation sessions with automatic titling
//! - Upstream calls with exponential backoff, jitter and cancellation
//! - Multimodal request building with a model capability catalog
//! - A chat turn pipeline tying the above together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatgate_core::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ChatgateConfig::load()?;
//!     let metrics = Arc::new(ChatMetrics::new());
//!
//!     let caller = RetryingCaller::new(Arc::new(ReqwestTransport::new()?), config.retry.clone())
//!         .with_observer(metrics.clone());
//!     let catalog = Arc::new(ModelCatalog::new(config.models.clone()));
//!     let gateway = ModelGateway::new(caller, catalog, config.upstream.clone());
//!
//!     let pipeline = RequestPipeline::new(
//!         Arc::new(AdmissionGate::new(config.rate_limit.clone())),
//!         Arc::new(InMemoryConversationStore::new(&config.conversation)),
//!         Arc::new(gateway),
//!         metrics,
//!         config.conversation.clone(),
//!     );
//!
//!     let turn = ChatTurnRequest::new(ClientContext::new("127.0.0.1"), "Hello!");
//!     match pipeline.handle(turn, &CancellationToken::new()).await {
//!         Ok(done) => println!("{}", done.message.content),
//!         Err(failure) => eprintln!("{}", failure.error.user_message()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod telemetry;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admission::{
        AdmissionClass, AdmissionGate, Decision, RateLimitConfig, WindowKind, WindowLimit,
        WindowPolicy, WindowQuota,
    };
    pub use crate::config::{ChatgateConfig, ServerConfig, UpstreamConfig};
    pub use crate::conversation::{
        ClientContext, ConversationConfig, ConversationStore, ImageAttachment,
        InMemoryConversationStore, Message, Role, Session, SessionId, SessionStats,
        SessionSummary, TitlePolicy, TitleSource, TokenUsage,
    };
    pub use crate::error::{ChatError, Result};
    pub use crate::llm::{
        AssistantReply, CallFailure, CallSuccess, HttpTransport, ModelCatalog, ModelGateway,
        ModelInfo, ModelsConfig, ReqwestTransport, RequestSpec, RetryPolicy, RetryingCaller,
        TransportError, TransportResponse,
    };
    pub use crate::pipeline::{
        ChatTurnRequest, CompletedTurn, ImageUpload, PipelineState, RequestPipeline, TurnFailure,
    };
    pub use crate::telemetry::{
        AttemptEvent, AttemptObserver, AttemptOutcome, ChatMetrics, MetricsSnapshot,
        TracingObserver,
    };
}
