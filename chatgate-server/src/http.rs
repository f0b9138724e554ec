use axum::extract::{Extension, Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chatgate_core::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::service::{
    parse_session_id, with_quota_headers, ApiError, ApiJson, ApiQuery, AppState, ChatAdmission,
    ClientIdentity,
};

pub const HEALTH_PATH: &str = "/health";
pub const API_PREFIX: &str = "/api";
pub const MODELS_PATH: &str = "/models";
pub const CHAT_PATH: &str = "/chat";
pub const HISTORY_PATH: &str = "/chat/history";
pub const CLEAR_PATH: &str = "/chat/clear";
pub const NEW_SESSION_PATH: &str = "/chat/new-session";
pub const SESSIONS_PATH: &str = "/chat/sessions";
pub const SESSION_PATH: &str = "/chat/sessions/:id";
pub const SESSION_SWITCH_PATH: &str = "/chat/sessions/:id/switch";
pub const SESSION_STATS_PATH: &str = "/chat/sessions/:id/stats";
pub const METRICS_PATH: &str = "/metrics";

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// The full application router.
///
/// Chat turns are admitted under the chat class and every other `/api`
/// route under the general class, in both cases before the request is
/// parsed.
pub fn router(state: AppState) -> Router {
    let general = Router::new()
        .route(MODELS_PATH, get(list_models))
        .route(HISTORY_PATH, get(history))
        .route(CLEAR_PATH, post(clear))
        .route(NEW_SESSION_PATH, post(new_session))
        .route(SESSIONS_PATH, get(list_sessions))
        .route(
            SESSION_PATH,
            axum::routing::patch(rename_session).delete(delete_session),
        )
        .route(SESSION_SWITCH_PATH, post(switch_session))
        .route(SESSION_STATS_PATH, get(session_stats))
        .route(METRICS_PATH, get(metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), admit_general));

    let chat = Router::new()
        .route(CHAT_PATH, post(chat))
        .route_layer(middleware::from_fn_with_state(state.clone(), admit_chat));
    let api = general.merge(chat);

    Router::new()
        .merge(health_routes())
        .nest(API_PREFIX, api)
        .with_state(state)
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route(HEALTH_PATH, get(health))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "version": chatgate_core::VERSION }))
}

async fn admit_general(
    State(st): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    request: Request,
    next: Next,
) -> Response {
    match st.gate().admit(client.as_str(), AdmissionClass::General) {
        Decision::Admitted { quotas } => with_quota_headers(next.run(request).await, &quotas),
        Decision::RateLimited {
            window,
            retry_after,
            quotas,
        } => {
            debug!(client = %client, %window, "general request denied");
            st.metrics().record_rate_limited(AdmissionClass::General, window);
            let denied = ApiError::from(ChatError::RateLimited {
                window,
                retry_after,
            });
            with_quota_headers(denied.into_response(), &quotas)
        }
    }
}

async fn admit_chat(
    State(st): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    mut request: Request,
    next: Next,
) -> Response {
    match st.pipeline.admit(&client) {
        Ok(quotas) => {
            request.extensions_mut().insert(ChatAdmission(quotas.clone()));
            with_quota_headers(next.run(request).await, &quotas)
        }
        Err(failure) => {
            let denied = ApiError::from(failure.error).into_response();
            with_quota_headers(denied, &failure.quotas)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

impl SessionQuery {
    fn parsed(&self) -> ApiResult<Option<SessionId>> {
        self.session_id.as_deref().map(parse_session_id).transpose()
    }
}

#[derive(Debug, Deserialize)]
struct ChatPayload {
    message: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    image: Option<ImageUpload>,
}

async fn chat(
    State(st): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    Extension(ChatAdmission(quotas)): Extension<ChatAdmission>,
    ApiQuery(query): ApiQuery<SessionQuery>,
    ApiJson(payload): ApiJson<ChatPayload>,
) -> ApiResult<Json<Value>> {
    let mut turn = ChatTurnRequest::new(client, payload.message);
    if let Some(id) = query.parsed()? {
        turn = turn.with_session(id);
    }
    if let Some(model) = payload.model {
        turn = turn.with_model(model);
    }
    if let Some(image) = payload.image {
        turn = turn.with_image(image);
    }

    // A dropped connection fires the guard; the detached turn then stops at
    // its next attempt boundary.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let pipeline = st.pipeline.clone();
    let outcome =
        tokio::spawn(async move { pipeline.handle_admitted(turn, quotas, &cancel).await })
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

    match outcome {
        Ok(done) => Ok(Json(json!({
            "message": done.message,
            "success": true,
            "session_id": done.session_id,
        }))),
        Err(failure) => Err(failure.error.into()),
    }
}

async fn list_models(State(st): State<AppState>) -> Json<Value> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let models = st.pipeline.gateway().list_models(&cancel).await;
    Json(json!({
        "count": models.len(),
        "default_model": st.pipeline.gateway().catalog().default_model(),
        "models": models,
    }))
}

async fn resolve_session(
    st: &AppState,
    client: &ClientContext,
    query: &SessionQuery,
) -> ApiResult<SessionId> {
    match query.parsed()? {
        Some(id) => Ok(id),
        None => Ok(st.store().get_active(client).await?.id()),
    }
}

async fn history(
    State(st): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    ApiQuery(query): ApiQuery<SessionQuery>,
) -> ApiResult<Json<Value>> {
    let id = resolve_session(&st, &client, &query).await?;
    let messages = st.store().history(id).await?;
    Ok(Json(json!({
        "session_id": id,
        "count": messages.len(),
        "messages": messages,
    })))
}

async fn clear(
    State(st): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    ApiQuery(query): ApiQuery<SessionQuery>,
) -> ApiResult<Json<Value>> {
    let id = resolve_session(&st, &client, &query).await?;
    let cleared = st.store().clear_session(id).await?;
    Ok(Json(json!({
        "success": true,
        "session_id": id,
        "cleared": cleared,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct NewSessionQuery {
    title: Option<String>,
}

async fn new_session(
    State(st): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    ApiQuery(query): ApiQuery<NewSessionQuery>,
) -> ApiResult<Json<SessionSummary>> {
    let title = query.title.filter(|t| !t.trim().is_empty());
    let session = st.store().create_session(&client, title).await?;
    Ok(Json(session.summary(true)))
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_sessions(
    State(st): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    ApiQuery(page): ApiQuery<PageQuery>,
) -> ApiResult<Json<Value>> {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = page.offset.unwrap_or(0);
    let sessions = st.store().list_sessions(&client, limit, offset).await?;
    Ok(Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

async fn switch_session(
    State(st): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    let id = parse_session_id(&id)?;
    let session = st.store().switch_active(&client, id).await?;
    Ok(Json(session.summary(true)))
}

#[derive(Debug, Deserialize)]
struct RenamePayload {
    title: String,
}

async fn rename_session(
    State(st): State<AppState>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<RenamePayload>,
) -> ApiResult<Json<Value>> {
    let id = parse_session_id(&id)?;
    st.store().rename_session(id, payload.title).await?;
    let session = st.store().get_session(id).await?;
    Ok(Json(json!({
        "success": true,
        "session_id": id,
        "title": session.title(),
    })))
}

async fn delete_session(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_session_id(&id)?;
    st.store().delete_session(id).await?;
    Ok(Json(json!({ "success": true, "session_id": id })))
}

async fn session_stats(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionStats>> {
    let id = parse_session_id(&id)?;
    Ok(Json(st.store().session_stats(id).await?))
}

async fn metrics(State(st): State<AppState>) -> Json<Value> {
    Json(json!({
        "metrics": st.metrics().snapshot(),
        "tracked_clients": st.gate().tracked_clients(),
    }))
}
