//! End-to-end tests for the chat turn pipeline
//!
//! The upstream provider is replaced by a scripted transport; everything
//! else (gate, store, retry loop, gateway, metrics) is the real thing.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatgate_core::prelude::*;
use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct FakeProvider {
    script: Mutex<VecDeque<TransportResponse>>,
    seen: Mutex<Vec<RequestSpec>>,
}

impl FakeProvider {
    fn new(script: Vec<TransportResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn last_body(&self) -> serde_json::Value {
        self.seen
            .lock()
            .unwrap()
            .last()
            .and_then(|r| r.body.clone())
            .expect("a request was sent")
    }
}

#[async_trait]
impl HttpTransport for FakeProvider {
    async fn execute(
        &self,
        request: &RequestSpec,
    ) -> std::result::Result<TransportResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        // An empty script answers every call with the same reply.
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| completion("default reply")))
    }
}

fn completion(content: &str) -> TransportResponse {
    TransportResponse::new(
        200,
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9}
        })
        .to_string(),
    )
}

fn build(config: &ChatgateConfig, provider: Arc<FakeProvider>) -> (RequestPipeline, Arc<ChatMetrics>) {
    let metrics = Arc::new(ChatMetrics::new());
    let caller = RetryingCaller::new(provider, config.retry.clone()).with_observer(metrics.clone());
    let gateway = ModelGateway::new(
        caller,
        Arc::new(ModelCatalog::new(config.models.clone())),
        config.upstream.clone(),
    )
    .with_history_window(config.conversation.history_window);

    let pipeline = RequestPipeline::new(
        Arc::new(AdmissionGate::new(config.rate_limit.clone())),
        Arc::new(InMemoryConversationStore::new(&config.conversation)),
        Arc::new(gateway),
        metrics.clone(),
        config.conversation.clone(),
    );
    (pipeline, metrics)
}

#[tokio::test(start_paused = true)]
async fn test_transient_upstream_failures_are_absorbed() {
    let provider = FakeProvider::new(vec![
        TransportResponse::new(503, "{}"),
        TransportResponse::new(502, "{}"),
        completion("recovered"),
    ]);
    let (pipeline, metrics) = build(&ChatgateConfig::default(), provider.clone());

    let done = pipeline
        .handle(
            ChatTurnRequest::new(ClientContext::new("10.0.0.1"), "are you there?"),
            &CancellationToken::new(),
        )
        .await
        .expect("turn completes");

    assert_eq!(done.message.content, "recovered");
    assert_eq!(done.attempts, 3);
    assert_eq!(done.message.usage.map(|u| u.prompt_tokens), Some(7));
    assert_eq!(provider.calls(), 3);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.upstream_attempts, 3);
    assert_eq!(snapshot.upstream_retries, 2);
    assert_eq!(snapshot.turns_by_outcome["completed"], 1);
}

#[tokio::test]
async fn test_file_configured_ceiling_denies_turns() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [rate_limit.chat.per_minute]
        max_requests = 2
        window = "1m"
        "#
    )
    .unwrap();
    let config = ChatgateConfig::from_file(file.path()).unwrap();
    let (pipeline, metrics) = build(&config, FakeProvider::new(vec![]));
    let client = ClientContext::new("10.0.0.2");
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        pipeline
            .handle(ChatTurnRequest::new(client.clone(), "hi"), &cancel)
            .await
            .unwrap();
    }
    let failure = pipeline
        .handle(ChatTurnRequest::new(client.clone(), "hi"), &cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.reached, PipelineState::Received);
    match failure.error {
        ChatError::RateLimited {
            window,
            retry_after,
        } => {
            assert_eq!(window, WindowKind::Minute);
            assert!(!retry_after.is_zero());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let minute = failure
        .quotas
        .iter()
        .find(|q| q.kind == WindowKind::Minute)
        .unwrap();
    assert_eq!(minute.remaining, 0);
    assert_eq!(metrics.snapshot().rate_limit_denials["chat:minute"], 1);

    // General traffic has its own budget.
    assert!(pipeline.gate().admit(client.as_str(), AdmissionClass::General).is_admitted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_keep_their_own_order() {
    let (pipeline, _) = build(&ChatgateConfig::default(), FakeProvider::new(vec![]));
    let pipeline = Arc::new(pipeline);

    let runs = (0..6).map(|n| {
        let pipeline = pipeline.clone();
        async move {
            let client = ClientContext::new(format!("10.0.1.{n}"));
            let cancel = CancellationToken::new();
            for turn in 0..3 {
                pipeline
                    .handle(ChatTurnRequest::new(client.clone(), format!("turn {turn}")), &cancel)
                    .await
                    .unwrap();
            }
            client
        }
    });
    let clients = join_all(runs).await;

    for client in clients {
        let session = pipeline.store().get_active(&client).await.unwrap();
        let roles: Vec<_> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [Role::User, Role::Assistant].repeat(3),
            "client {client}"
        );
        let users: Vec<_> = session
            .messages()
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(users, vec!["turn 0", "turn 1", "turn 2"]);
    }
}

#[tokio::test]
async fn test_cancelled_turn_keeps_user_message() {
    let provider = FakeProvider::new(vec![]);
    let (pipeline, _) = build(&ChatgateConfig::default(), provider.clone());
    let client = ClientContext::new("10.0.0.3");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = pipeline
        .handle(ChatTurnRequest::new(client.clone(), "never answered"), &cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.reached, PipelineState::HistoryLoaded);
    assert!(matches!(failure.error, ChatError::UpstreamTransientFailure { .. }));
    assert_eq!(provider.calls(), 0);

    let session = pipeline.store().get_active(&client).await.unwrap();
    assert_eq!(session.message_count(), 1);
}

#[tokio::test]
async fn test_image_turn_for_multimodal_model() {
    let provider = FakeProvider::new(vec![completion("A red square.")]);
    let (pipeline, metrics) = build(&ChatgateConfig::default(), provider.clone());
    let client = ClientContext::new("10.0.0.4");

    let done = pipeline
        .handle(
            ChatTurnRequest::new(client.clone(), "Describe this")
                .with_model("google/gemma-2-9b-it:free")
                .with_image(ImageUpload {
                    base64_data: "data:image/jpeg;base64,aGVsbG8=".to_string(),
                    media_type: "image/jpeg".to_string(),
                }),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(done.message.model.as_deref(), Some("google/gemma-2-9b-it:free"));

    let body = provider.last_body();
    assert_eq!(body["model"], "google/gemma-2-9b-it:free");
    assert_eq!(
        body["messages"][0]["content"][1]["image_url"]["url"],
        "data:image/jpeg;base64,aGVsbG8="
    );

    let history = pipeline.store().history(done.session_id).await.unwrap();
    assert!(history[0].has_image());
    assert_eq!(metrics.snapshot().image_uploads["image/jpeg"], 1);
}
