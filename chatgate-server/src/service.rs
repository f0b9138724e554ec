use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Query, Request};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatgate_core::error::whole_seconds;
use chatgate_core::prelude::*;
use serde::de::DeserializeOwned;
use serde_json::json;

/// Shared handles every route works against
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
}

impl AppState {
    /// Wire the full stack against the real upstream.
    pub fn from_config(config: &ChatgateConfig) -> Result<Self> {
        Ok(Self::with_transport(config, Arc::new(ReqwestTransport::new()?)))
    }

    /// Wire the full stack over any transport.
    pub fn with_transport(config: &ChatgateConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let metrics = Arc::new(ChatMetrics::new());
        let caller =
            RetryingCaller::new(transport, config.retry.clone()).with_observer(metrics.clone());
        let catalog = Arc::new(ModelCatalog::new(config.models.clone()));
        let gateway = ModelGateway::new(caller, catalog, config.upstream.clone())
            .with_history_window(config.conversation.history_window);

        let pipeline = RequestPipeline::new(
            Arc::new(AdmissionGate::new(config.rate_limit.clone())),
            Arc::new(InMemoryConversationStore::new(&config.conversation)),
            Arc::new(gateway),
            metrics,
            config.conversation.clone(),
        );
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        self.pipeline.gate()
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        self.pipeline.store()
    }

    pub fn metrics(&self) -> &Arc<ChatMetrics> {
        self.pipeline.metrics()
    }
}

/// Rate-limit key of the caller.
///
/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub ClientContext);

impl ClientIdentity {
    pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let id = match (forwarded, real_ip, peer) {
            (Some(ip), _, _) | (None, Some(ip), _) => ip.to_string(),
            (None, None, Some(addr)) => addr.ip().to_string(),
            (None, None, None) => "unknown".to_string(),
        };
        Self(ClientContext::new(id))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::resolve(&parts.headers, peer))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Chat(ChatError::ValidationError(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Chat(ChatError::ValidationError(rejection.body_text()))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Chat(err) => match err {
                ChatError::ValidationError(_) | ChatError::UnsupportedModality { .. } => {
                    StatusCode::BAD_REQUEST
                }
                ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                ChatError::RetriesExhausted { .. } | ChatError::UpstreamTransientFailure { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                ChatError::UpstreamRejected { .. } | ChatError::ProviderResponseInvalid(_) => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status();
        if code.is_server_error() {
            tracing::warn!(status = code.as_u16(), error = %self, "request failed");
        }

        match self {
            ApiError::Chat(ChatError::RateLimited {
                window,
                retry_after,
            }) => {
                let secs = whole_seconds(retry_after);
                let detail = ChatError::RateLimited {
                    window,
                    retry_after,
                }
                .user_message();
                let body = Json(json!({
                    "error": "rate_limit_exceeded",
                    "detail": detail,
                    "retry_after": secs,
                }));
                let mut resp = (code, body).into_response();
                resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
                resp
            }
            ApiError::Chat(err) => (
                code,
                Json(json!({ "error": err.kind(), "detail": err.user_message() })),
            )
                .into_response(),
            ApiError::BadRequest(detail) => (
                code,
                Json(json!({ "error": "bad_request", "detail": detail })),
            )
                .into_response(),
            ApiError::Internal(_) => (
                code,
                Json(json!({ "error": "internal", "detail": "Internal server error." })),
            )
                .into_response(),
        }
    }
}

/// JSON body whose rejection is a typed validation error
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, ApiError> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Query string whose rejection is a typed validation error
#[derive(Debug)]
pub struct ApiQuery<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, ApiError> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// Chat-class admission granted ahead of the chat handler
#[derive(Debug, Clone)]
pub struct ChatAdmission(pub Vec<WindowQuota>);

/// Writes `X-RateLimit-Limit-*` and `X-RateLimit-Remaining-*` for each window.
pub fn with_quota_headers(mut resp: Response, quotas: &[WindowQuota]) -> Response {
    let headers = resp.headers_mut();
    for quota in quotas {
        let suffix = quota.kind.header_suffix();
        for (prefix, value) in [("Limit", quota.limit), ("Remaining", quota.remaining)] {
            let name = format!("x-ratelimit-{prefix}-{suffix}").to_ascii_lowercase();
            if let Ok(name) = HeaderName::try_from(name) {
                headers.insert(name, HeaderValue::from(value));
            }
        }
    }
    resp
}

pub fn parse_session_id(raw: &str) -> std::result::Result<SessionId, ApiError> {
    raw.trim()
        .parse::<SessionId>()
        .map_err(|_| ApiError::BadRequest(format!("invalid session id: {raw}")))
}
