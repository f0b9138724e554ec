//! Model gateway
//!
//! Turns stored history plus a new user turn into an OpenAI-style chat
//! completion request, sends it through the [`RetryingCaller`], and parses
//! the reply.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use super::catalog::{ModelCatalog, ModelInfo};
use super::retry::{RequestSpec, RetryingCaller};
use crate::config::UpstreamConfig;
use crate::conversation::{Message, TokenUsage};
use crate::error::{ChatError, Result};

/// Parsed provider reply
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantReply {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    /// Upstream attempts, including the initial one
    pub attempts: u32,
    /// Wall time across all attempts and backoffs
    pub elapsed: Duration,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<CompletionContent>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CompletionContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ProviderError {
    error: ProviderErrorDetail,
}

#[derive(Deserialize)]
struct ProviderErrorDetail {
    message: String,
}

/// Chat completion client for the configured provider
#[derive(Debug, Clone)]
pub struct ModelGateway {
    caller: RetryingCaller,
    catalog: Arc<ModelCatalog>,
    upstream: UpstreamConfig,
    history_window: Option<usize>,
}

impl ModelGateway {
    pub fn new(caller: RetryingCaller, catalog: Arc<ModelCatalog>, upstream: UpstreamConfig) -> Self {
        Self {
            caller,
            catalog,
            upstream,
            history_window: None,
        }
    }

    /// Builder: send only the most recent `window` history messages
    pub fn with_history_window(mut self, window: Option<usize>) -> Self {
        self.history_window = window;
        self
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.upstream.base_url.trim_end_matches('/'), path)
    }

    fn with_headers(&self, mut request: RequestSpec) -> RequestSpec {
        if let Some(key) = &self.upstream.api_key {
            request = request.with_header("Authorization", format!("Bearer {key}"));
        }
        request
            .with_header("HTTP-Referer", self.upstream.referer.clone())
            .with_header("X-Title", self.upstream.app_name.clone())
    }

    /// Fail with [`ChatError::UnsupportedModality`] when `turn` carries an
    /// image the model cannot take.
    pub fn check_modality(&self, turn: &Message, model_id: &str) -> Result<()> {
        if turn.has_image() && !self.catalog.supports_images(model_id) {
            return Err(ChatError::UnsupportedModality {
                model: model_id.to_string(),
            });
        }
        Ok(())
    }

    /// Request body for `history` followed by `turn`.
    ///
    /// History goes out text-only; only the new turn embeds its image.
    pub fn build_payload(&self, history: &[Message], turn: &Message, model_id: &str) -> Value {
        let start = self
            .history_window
            .map_or(0, |window| history.len().saturating_sub(window));

        let mut messages: Vec<Value> = history[start..]
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let content = match &turn.image {
            Some(image) => json!([
                { "type": "text", "text": turn.content },
                { "type": "image_url", "image_url": { "url": image.data_url() } }
            ]),
            None => json!(turn.content),
        };
        messages.push(json!({ "role": turn.role.as_str(), "content": content }));

        json!({ "model": model_id, "messages": messages })
    }

    /// Send one chat turn and return the assistant's reply.
    ///
    /// `history` must not include `turn`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnsupportedModality`] before any network call,
    /// the retry outcome when the provider stays unavailable,
    /// [`ChatError::UpstreamRejected`] for a non-retryable error status and
    /// [`ChatError::ProviderResponseInvalid`] when no content comes back.
    #[instrument(skip(self, history, turn, cancel), fields(history_len = history.len(), has_image = turn.has_image()))]
    pub async fn send(
        &self,
        history: &[Message],
        turn: &Message,
        model_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AssistantReply> {
        self.check_modality(turn, model_id)?;

        let request = self.with_headers(RequestSpec::post(
            self.endpoint("chat/completions"),
            self.build_payload(history, turn, model_id),
            self.upstream.request_timeout,
        ));

        let started = Instant::now();
        let success = self.caller.invoke(&request, cancel).await?;
        let elapsed = started.elapsed();
        let response = success.response;

        if !response.is_success() {
            let message = serde_json::from_str::<ProviderError>(&response.body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}", response.status));
            warn!(status = response.status, %message, "provider rejected request");
            return Err(ChatError::UpstreamRejected {
                status: response.status,
                message,
            });
        }

        let parsed: CompletionResponse = serde_json::from_str(&response.body).map_err(|e| {
            ChatError::ProviderResponseInvalid(format!("malformed completion body: {e}"))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(|content| match content {
                CompletionContent::Text(text) => text,
                CompletionContent::Parts(parts) => parts
                    .into_iter()
                    .filter(|part| part.kind == "text")
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join(""),
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                ChatError::ProviderResponseInvalid("no content in first choice".to_string())
            })?;

        Ok(AssistantReply {
            content,
            model: model_id.to_string(),
            usage: parsed.usage,
            attempts: success.attempts,
            elapsed,
        })
    }

    /// Refresh the catalog from the provider's model listing.
    ///
    /// Never fails: any upstream problem yields the fallback list.
    #[instrument(skip(self, cancel))]
    pub async fn list_models(&self, cancel: &CancellationToken) -> Vec<ModelInfo> {
        let request = self.with_headers(RequestSpec::get(
            self.endpoint("models"),
            self.upstream.models_timeout,
        ));

        match self.caller.invoke(&request, cancel).await {
            Ok(success) if success.response.is_success() => {
                match serde_json::from_str::<Value>(&success.response.body) {
                    Ok(listing) => self.catalog.refresh_from_listing(&listing),
                    Err(e) => {
                        warn!(error = %e, "malformed model listing, using fallback list");
                        self.catalog.fallback()
                    }
                }
            }
            Ok(success) => {
                warn!(status = success.response.status, "model listing rejected, using fallback list");
                self.catalog.fallback()
            }
            Err(failure) => {
                warn!(error = %failure, "model listing unavailable, using fallback list");
                self.catalog.fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ImageAttachment;
    use crate::llm::retry::{RetryPolicy, TransportResponse};
    use crate::llm::testing::ScriptedTransport;

    fn gateway(transport: Arc<ScriptedTransport>) -> ModelGateway {
        let caller = RetryingCaller::new(transport, RetryPolicy::no_retry());
        let upstream = UpstreamConfig {
            api_key: Some("sk-test".to_string()),
            base_url: "http://upstream.test/api/v1/".to_string(),
            ..Default::default()
        };
        ModelGateway::new(caller, Arc::new(ModelCatalog::default()), upstream)
    }

    fn completion(content: Value) -> TransportResponse {
        TransportResponse::new(
            200,
            json!({
                "choices": [{"message": {"role": "assistant", "content": content}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
            })
            .to_string(),
        )
    }

    fn image() -> ImageAttachment {
        ImageAttachment {
            media_type: "image/png".to_string(),
            data: b"hello".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_image_to_text_model_never_calls_upstream() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(completion(json!("hi")))]));
        let gateway = gateway(transport.clone());
        let turn = Message::user("what is this").with_image(image());

        let err = gateway
            .send(&[], &turn, "meta-llama/llama-3.2-3b-instruct:free", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::UnsupportedModality { .. }));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_send_builds_request_and_parses_reply() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(completion(json!("It is a cat.")))]));
        let gateway = gateway(transport.clone());
        let history = vec![
            Message::user("earlier").with_image(image()),
            Message::assistant("noted", "google/gemma-2-9b-it:free"),
        ];
        let turn = Message::user("what is this").with_image(image());

        let reply = gateway
            .send(&history, &turn, "google/gemma-2-9b-it:free", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, "It is a cat.");
        assert_eq!(reply.model, "google/gemma-2-9b-it:free");
        assert_eq!(reply.attempts, 1);
        assert_eq!(reply.usage.map(|u| u.total_tokens), Some(15));

        let requests = transport.requests();
        let request = &requests[0];
        assert_eq!(request.url, "http://upstream.test/api/v1/chat/completions");
        assert_eq!(request.header("authorization"), Some("Bearer sk-test"));
        assert_eq!(request.header("X-Title"), Some("AI Chat Application"));
        assert_eq!(request.header("HTTP-Referer"), Some("http://localhost:8000"));

        let body = request.body.as_ref().unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"], "earlier");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["content"][0]["text"], "what is this");
        assert_eq!(
            messages[2]["content"][1]["image_url"]["url"],
            "data:image/png;base64,aGVsbG8="
        );
    }

    #[tokio::test]
    async fn test_content_parts_are_joined() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(completion(json!([
            {"type": "text", "text": "Hello "},
            {"type": "text", "text": "there"}
        ])))]));
        let reply = gateway(transport)
            .send(&[], &Message::user("hi"), "m", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, "Hello there");
    }

    #[tokio::test]
    async fn test_empty_content_is_invalid() {
        for response in [
            completion(json!("")),
            completion(Value::Null),
            TransportResponse::new(200, r#"{"choices": []}"#),
            TransportResponse::new(200, "<html>"),
        ] {
            let transport = Arc::new(ScriptedTransport::new(vec![Ok(response)]));
            let err = gateway(transport)
                .send(&[], &Message::user("hi"), "m", &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, ChatError::ProviderResponseInvalid(_)), "{err:?}");
        }
    }

    #[tokio::test]
    async fn test_rejection_carries_provider_message() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(TransportResponse::new(
            400,
            r#"{"error": {"message": "model not found", "code": 400}}"#,
        ))]));
        let err = gateway(transport.clone())
            .send(&[], &Message::user("hi"), "nope", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ChatError::UpstreamRejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "model not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_as_retries_exhausted() {
        let transport = Arc::new(ScriptedTransport::statuses(&[503]));
        let err = gateway(transport)
            .send(&[], &Message::user("hi"), "m", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RetriesExhausted { attempts: 1, .. }));
    }

    #[test]
    fn test_history_window_keeps_latest() {
        let transport = Arc::new(ScriptedTransport::statuses(&[]));
        let gateway = gateway(transport).with_history_window(Some(2));
        let history: Vec<Message> = (0..5).map(|i| Message::user(format!("m{i}"))).collect();

        let body = gateway.build_payload(&history, &Message::user("now"), "m");
        let contents: Vec<_> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents, vec!["m3", "m4", "now"]);
    }

    #[tokio::test]
    async fn test_list_models_refreshes_catalog() {
        let listing = json!({"data": [
            {"id": "x/pixel-vision:free", "name": "Pixel"},
            {"id": "y/paid", "pricing": {"prompt": "1", "completion": "1"}}
        ]});
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(TransportResponse::new(
            200,
            listing.to_string(),
        ))]));
        let gateway = gateway(transport.clone());

        let models = gateway.list_models(&CancellationToken::new()).await;
        assert_eq!(models.len(), 1);
        assert!(models[0].supports_images);
        assert!(gateway.catalog().get("x/pixel-vision:free").is_some());
        assert_eq!(transport.requests()[0].url, "http://upstream.test/api/v1/models");
    }

    #[tokio::test]
    async fn test_list_models_falls_back_on_failure() {
        let transport = Arc::new(ScriptedTransport::statuses(&[503]));
        let gateway = gateway(transport);

        let models = gateway.list_models(&CancellationToken::new()).await;
        assert_eq!(models, gateway.catalog().fallback());
    }
}
