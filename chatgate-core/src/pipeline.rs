//! Chat turn pipeline
//!
//! One chat turn moves through
//! `Received -> Admitted -> HistoryLoaded -> UpstreamCalled -> Persisted -> Completed`.
//! A failure reports the last state reached, so callers can tell a turn
//! that never touched the store from one whose user message is already
//! recorded.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::admission::{AdmissionClass, AdmissionGate, Decision, WindowQuota};
use crate::conversation::{
    ClientContext, ConversationConfig, ConversationStore, ImageAttachment, Message, SessionId,
};
use crate::error::ChatError;
use crate::llm::ModelGateway;
use crate::telemetry::ChatMetrics;

/// Progress of a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Admitted,
    HistoryLoaded,
    UpstreamCalled,
    Persisted,
    Completed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Received => "received",
            PipelineState::Admitted => "admitted",
            PipelineState::HistoryLoaded => "history_loaded",
            PipelineState::UpstreamCalled => "upstream_called",
            PipelineState::Persisted => "persisted",
            PipelineState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Image as sent by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUpload {
    pub base64_data: String,
    #[serde(default = "default_media_type")]
    pub media_type: String,
}

fn default_media_type() -> String {
    "image/png".to_string()
}

/// One inbound chat turn
#[derive(Debug, Clone)]
pub struct ChatTurnRequest {
    pub client: ClientContext,
    /// Target session; the client's active session when absent
    pub session_id: Option<SessionId>,
    pub message: String,
    /// Model id; the catalog default when absent
    pub model: Option<String>,
    pub image: Option<ImageUpload>,
}

impl ChatTurnRequest {
    pub fn new(client: ClientContext, message: impl Into<String>) -> Self {
        Self {
            client,
            session_id: None,
            message: message.into(),
            model: None,
            image: None,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_image(mut self, image: ImageUpload) -> Self {
        self.image = Some(image);
        self
    }
}

/// A turn that reached `Completed`
#[derive(Debug, Clone)]
pub struct CompletedTurn {
    pub session_id: SessionId,
    /// The persisted assistant message
    pub message: Message,
    pub quotas: Vec<WindowQuota>,
    /// Upstream attempts spent on the turn
    pub attempts: u32,
}

/// A turn that stopped early
#[derive(Debug, thiserror::Error)]
#[error("chat turn failed after {reached}: {error}")]
pub struct TurnFailure {
    /// Last state the turn reached
    pub reached: PipelineState,
    #[source]
    pub error: ChatError,
    /// Quotas at admission time; empty only if admission itself never ran
    pub quotas: Vec<WindowQuota>,
}

/// Runs chat turns end to end
pub struct RequestPipeline {
    gate: Arc<AdmissionGate>,
    store: Arc<dyn ConversationStore>,
    gateway: Arc<ModelGateway>,
    metrics: Arc<ChatMetrics>,
    conversation: ConversationConfig,
}

impl RequestPipeline {
    pub fn new(
        gate: Arc<AdmissionGate>,
        store: Arc<dyn ConversationStore>,
        gateway: Arc<ModelGateway>,
        metrics: Arc<ChatMetrics>,
        conversation: ConversationConfig,
    ) -> Self {
        Self {
            gate,
            store,
            gateway,
            metrics,
            conversation,
        }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<ModelGateway> {
        &self.gateway
    }

    pub fn metrics(&self) -> &Arc<ChatMetrics> {
        &self.metrics
    }

    fn fail(&self, reached: PipelineState, error: ChatError, quotas: Vec<WindowQuota>) -> TurnFailure {
        self.metrics.record_failed(error.kind());
        warn!(%reached, kind = error.kind(), error = %error, "chat turn failed");
        TurnFailure {
            reached,
            error,
            quotas,
        }
    }

    /// Build the user turn, rejecting anything the store or model must not
    /// see.
    fn validate(&self, message: String, image: Option<ImageUpload>, model: &str) -> Result<Message, ChatError> {
        if message.trim().is_empty() {
            return Err(ChatError::ValidationError(
                "Message must not be empty".to_string(),
            ));
        }
        if message.chars().count() > self.conversation.max_message_chars {
            return Err(ChatError::ValidationError(format!(
                "Message exceeds {} characters",
                self.conversation.max_message_chars
            )));
        }

        let mut turn = Message::user(message);
        if let Some(upload) = image {
            let attachment = ImageAttachment::from_base64(
                &upload.media_type,
                &upload.base64_data,
                &self.conversation,
            )?;
            turn = turn.with_image(attachment);
        }
        self.gateway.check_modality(&turn, model)?;
        Ok(turn)
    }

    /// Admit one chat turn for `client` under the chat ceilings.
    pub fn admit(&self, client: &ClientContext) -> Result<Vec<WindowQuota>, TurnFailure> {
        match self.gate.admit(client.as_str(), AdmissionClass::Chat) {
            Decision::Admitted { quotas } => Ok(quotas),
            Decision::RateLimited {
                window,
                retry_after,
                quotas,
            } => {
                self.metrics.record_rate_limited(AdmissionClass::Chat, window);
                Err(self.fail(
                    PipelineState::Received,
                    ChatError::RateLimited {
                        window,
                        retry_after,
                    },
                    quotas,
                ))
            }
        }
    }

    /// Run one chat turn.
    ///
    /// Nothing is written before admission and validation pass. Once the
    /// user message is appended it stays recorded even if the upstream call
    /// fails.
    pub async fn handle(
        &self,
        request: ChatTurnRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletedTurn, TurnFailure> {
        let quotas = self.admit(&request.client)?;
        self.handle_admitted(request, quotas, cancel).await
    }

    /// Run a turn whose admission was already granted by [`Self::admit`].
    #[instrument(skip(self, request, quotas, cancel), fields(client = %request.client, session_id = ?request.session_id))]
    pub async fn handle_admitted(
        &self,
        request: ChatTurnRequest,
        quotas: Vec<WindowQuota>,
        cancel: &CancellationToken,
    ) -> Result<CompletedTurn, TurnFailure> {
        let started = Instant::now();
        let ChatTurnRequest {
            client,
            session_id,
            message,
            model,
            image,
        } = request;

        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.gateway.catalog().default_model().to_string());
        let turn = match self.validate(message, image, &model) {
            Ok(turn) => turn,
            Err(error) => return Err(self.fail(PipelineState::Admitted, error, quotas)),
        };
        if let Some(image) = &turn.image {
            self.metrics.record_image(&image.media_type);
        }

        // Admitted -> HistoryLoaded
        let session = match session_id {
            Some(id) => self.store.get_session(id).await,
            None => self.store.get_active(&client).await,
        };
        let session = match session {
            Ok(session) => session,
            Err(error) => return Err(self.fail(PipelineState::Admitted, error, quotas)),
        };
        let session_id = session.id();
        let history = session.messages().to_vec();
        if let Err(error) = self.store.append_message(session_id, turn.clone()).await {
            return Err(self.fail(PipelineState::Admitted, error, quotas));
        }

        // HistoryLoaded -> UpstreamCalled
        let reply = match self.gateway.send(&history, &turn, &model, cancel).await {
            Ok(reply) => reply,
            Err(error) => return Err(self.fail(PipelineState::HistoryLoaded, error, quotas)),
        };

        // UpstreamCalled -> Persisted
        let attempts = reply.attempts;
        let assistant = Message::assistant(reply.content, reply.model)
            .with_usage(reply.usage)
            .with_response_time_ms(reply.elapsed.as_millis() as u64);
        if let Err(error) = self.store.append_message(session_id, assistant.clone()).await {
            return Err(self.fail(PipelineState::UpstreamCalled, error, quotas));
        }

        // Persisted -> Completed
        let elapsed = started.elapsed();
        self.metrics.record_completed(&model, elapsed);
        info!(
            %session_id,
            %model,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "chat turn completed"
        );

        Ok(CompletedTurn {
            session_id,
            message: assistant,
            quotas,
            attempts,
        })
    }
}
