//! HTTP API for the conversation streaming core.
//!
//! JSON endpoints for chats and turns, plus one SSE feed per turn.

// Allow clippy lint triggered by utoipa's OpenApi derive macro
#![allow(clippy::needless_for_each)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::{Stream, StreamExt};
use llm_core::Block;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::core::chat::{Chat, Turn, TurnBlock};
use crate::core::Error;
use crate::core::store::{Exchange, PageDirection};
use crate::core::stream::{GenerationOptions, StreamingEngine, TurnRequest};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Shared application state.
pub struct AppState {
    pub engine: Arc<StreamingEngine>,

    /// API token for authentication (if configured).
    pub token: Option<String>,
}

type SharedState = Arc<AppState>;

/// `OpenAPI` documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Meridian API",
        description = "Conversation turns and live generation feeds",
        version = "0.1.0",
        license(name = "MIT")
    ),
    paths(
        health,
        create_turn,
        cold_start,
        get_chat,
        list_chats,
        delete_chat,
        list_turns,
        turn_path,
        turn_siblings,
        turn_blocks,
        interrupt_turn,
        regenerate_turn,
        stream_turn
    ),
    components(schemas(
        CreateTurnRequest,
        RegenerateRequest,
        ExchangeResponse,
        ChatResponse,
        ChatListResponse,
        TurnPageResponse,
        TurnListResponse,
        TurnResponse,
        SiblingsResponse,
        BlocksResponse,
        ErrorBody
    ))
)]
struct ApiDoc;

/// Error response body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Machine-readable category.
    pub error: String,
    pub message: String,
}

/// Core error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::NotStreaming(_) => (StatusCode::NOT_FOUND, "not_streaming"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::InvalidMarker(_) => (StatusCode::BAD_REQUEST, "invalid_event_id"),
            Error::Config(_) => (StatusCode::BAD_REQUEST, "configuration"),
            Error::AlreadyStreaming(_) => (StatusCode::CONFLICT, "already_streaming"),
            Error::Provider(_) => (StatusCode::BAD_GATEWAY, "provider"),
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) | Error::Task(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: kind.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Authentication middleware.
///
/// Validates the `Authorization: Bearer <token>` header if a token is configured.
async fn auth_middleware(
    State(state): State<SharedState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    // If no token configured, allow all requests (localhost-only mode)
    let Some(expected_token) = state.token.as_deref() else {
        return next.run(request).await;
    };

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match auth_header {
        Some(token) if token == expected_token => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "unauthorized".to_string(),
                message: "Missing or invalid Authorization header. Use: Bearer <token>"
                    .to_string(),
            }),
        )
            .into_response(),
    }
}

/// Build the application router.
pub fn router(state: SharedState) -> Router {
    let protected_routes = Router::new()
        .route("/api/projects/{project_id}/turns", post(cold_start))
        .route("/api/projects/{project_id}/chats", get(list_chats))
        .route("/api/chats/{chat_id}", get(get_chat).delete(delete_chat))
        .route(
            "/api/chats/{chat_id}/turns",
            post(create_turn).get(list_turns),
        )
        .route("/api/turns/{turn_id}/path", get(turn_path))
        .route("/api/turns/{turn_id}/siblings", get(turn_siblings))
        .route("/api/turns/{turn_id}/blocks", get(turn_blocks))
        .route("/api/turns/{turn_id}/interrupt", post(interrupt_turn))
        .route("/api/turns/{turn_id}/regenerate", post(regenerate_turn))
        .route("/api/turns/{turn_id}/stream", get(stream_turn))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", ApiDoc::openapi()));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .with_state(state)
}

/// Start the HTTP API server.
///
/// # Errors
///
/// Returns an error if the server fails to bind or start.
pub async fn serve(
    engine: Arc<StreamingEngine>,
    token: Option<String>,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let auth_enabled = token.is_some();
    let sweeper = engine.streams().spawn_sweeper(SWEEP_PERIOD);
    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        token,
    });

    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    if auth_enabled {
        tracing::info!(addr = %addr, "starting HTTP API server (auth enabled)");
    } else {
        tracing::warn!(addr = %addr, "starting HTTP API server (NO AUTH - localhost only recommended)");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    engine.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service healthy", body = String))
)]
async fn health() -> &'static str {
    "ok"
}

/// Request body for a new user turn.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct CreateTurnRequest {
    /// Turn this message answers. Omit to start a new root branch.
    pub prev_turn_id: Option<String>,
    /// Plain-text message. Prepended as a text block when `blocks` is also set.
    pub content: Option<String>,
    /// Structured message blocks.
    #[schema(value_type = Vec<Object>)]
    pub blocks: Vec<Block>,
    /// System prompt for a new chat. Only used by cold start.
    pub system_prompt: Option<String>,
    /// `provider/model` or a bare model name.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub thinking: bool,
    pub thinking_budget: Option<u32>,
    /// Offer tools to the model (default true).
    pub tools: Option<bool>,
}

impl CreateTurnRequest {
    fn options(&self) -> GenerationOptions {
        GenerationOptions {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            thinking: self.thinking,
            thinking_budget: self.thinking_budget,
            tools: self.tools.unwrap_or(true),
        }
    }

    fn into_turn_request(self) -> TurnRequest {
        let options = self.options();
        let mut blocks = Vec::with_capacity(self.blocks.len() + 1);
        if let Some(content) = self.content {
            blocks.push(Block::text(content));
        }
        blocks.extend(self.blocks);
        TurnRequest {
            prev_turn_id: self.prev_turn_id,
            blocks,
            options,
        }
    }
}

/// Request body for regenerating a reply.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct RegenerateRequest {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub thinking: bool,
    pub thinking_budget: Option<u32>,
    pub tools: Option<bool>,
}

impl RegenerateRequest {
    fn options(self) -> GenerationOptions {
        GenerationOptions {
            model: self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            thinking: self.thinking,
            thinking_budget: self.thinking_budget,
            tools: self.tools.unwrap_or(true),
        }
    }
}

/// Turns created for a new message.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ExchangeResponse {
    #[schema(value_type = Object)]
    pub chat: Chat,
    #[schema(value_type = Object)]
    pub user_turn: Turn,
    #[schema(value_type = Object)]
    pub assistant_turn: Turn,
    /// Event feed of the assistant turn.
    pub stream_url: String,
}

impl From<Exchange> for ExchangeResponse {
    fn from(exchange: Exchange) -> Self {
        Self {
            stream_url: stream_url(&exchange.assistant_turn.id),
            chat: exchange.chat,
            user_turn: exchange.user_turn,
            assistant_turn: exchange.assistant_turn,
        }
    }
}

fn stream_url(turn_id: &str) -> String {
    format!("/api/turns/{turn_id}/stream")
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChatResponse {
    #[schema(value_type = Object)]
    pub chat: Chat,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChatListResponse {
    #[schema(value_type = Vec<Object>)]
    pub chats: Vec<Chat>,
}

/// One page of a chat's history.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TurnPageResponse {
    #[schema(value_type = Vec<Object>)]
    pub turns: Vec<Turn>,
    /// Blocks of each returned turn.
    #[schema(value_type = Object)]
    pub blocks: HashMap<String, Vec<TurnBlock>>,
    /// Sibling ids of each returned turn.
    #[schema(value_type = Object)]
    pub siblings: HashMap<String, Vec<String>>,
    pub has_more_before: bool,
    pub has_more_after: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TurnListResponse {
    #[schema(value_type = Vec<Object>)]
    pub turns: Vec<Turn>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TurnResponse {
    #[schema(value_type = Object)]
    pub turn: Turn,
    pub stream_url: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SiblingsResponse {
    pub sibling_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BlocksResponse {
    #[schema(value_type = Vec<Object>)]
    pub blocks: Vec<TurnBlock>,
}

/// History page query.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Anchor turn. Defaults to the chat's last viewed turn.
    pub from_turn_id: Option<String>,
    /// `before`, `after` or `both` (default).
    #[param(value_type = Option<String>)]
    pub direction: Option<PageDirection>,
    pub limit: Option<usize>,
}

/// Event feed query.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StreamQuery {
    /// Last event id the client saw. The `Last-Event-ID` header wins.
    pub last_event_id: Option<String>,
}

/// Add a user turn to a chat and start generating the reply.
#[utoipa::path(
    post,
    path = "/api/chats/{chat_id}/turns",
    params(("chat_id" = String, Path, description = "Chat id")),
    request_body = CreateTurnRequest,
    responses(
        (status = 201, description = "Turns created, generation started", body = ExchangeResponse),
        (status = 400, description = "Invalid request or unknown model", body = ErrorBody),
        (status = 404, description = "Chat or previous turn not found", body = ErrorBody)
    )
)]
async fn create_turn(
    State(state): State<SharedState>,
    Path(chat_id): Path<String>,
    Json(req): Json<CreateTurnRequest>,
) -> ApiResult<(StatusCode, Json<ExchangeResponse>)> {
    let exchange = state
        .engine
        .create_turn(&chat_id, req.into_turn_request())?;
    Ok((StatusCode::CREATED, Json(exchange.into())))
}

/// Create a chat with its first message and start generating the reply.
#[utoipa::path(
    post,
    path = "/api/projects/{project_id}/turns",
    params(("project_id" = String, Path, description = "Project id")),
    request_body = CreateTurnRequest,
    responses(
        (status = 201, description = "Chat and turns created", body = ExchangeResponse),
        (status = 400, description = "Invalid request or unknown model", body = ErrorBody)
    )
)]
async fn cold_start(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Json(mut req): Json<CreateTurnRequest>,
) -> ApiResult<(StatusCode, Json<ExchangeResponse>)> {
    let system_prompt = req.system_prompt.take();
    let exchange =
        state
            .engine
            .start_chat(&project_id, system_prompt, req.into_turn_request())?;
    Ok((StatusCode::CREATED, Json(exchange.into())))
}

#[utoipa::path(
    get,
    path = "/api/chats/{chat_id}",
    params(("chat_id" = String, Path, description = "Chat id")),
    responses(
        (status = 200, description = "Chat", body = ChatResponse),
        (status = 404, description = "Chat not found", body = ErrorBody)
    )
)]
async fn get_chat(
    State(state): State<SharedState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<ChatResponse>> {
    let chat = state.engine.chat(&chat_id)?;
    Ok(Json(ChatResponse { chat }))
}

#[utoipa::path(
    get,
    path = "/api/projects/{project_id}/chats",
    params(("project_id" = String, Path, description = "Project id")),
    responses((status = 200, description = "Chats, most recent first", body = ChatListResponse))
)]
async fn list_chats(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ChatListResponse>> {
    let chats = state.engine.chats(&project_id)?;
    Ok(Json(ChatListResponse { chats }))
}

#[utoipa::path(
    delete,
    path = "/api/chats/{chat_id}",
    params(("chat_id" = String, Path, description = "Chat id")),
    responses(
        (status = 204, description = "Chat deleted"),
        (status = 404, description = "Chat not found", body = ErrorBody)
    )
)]
async fn delete_chat(
    State(state): State<SharedState>,
    Path(chat_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete_chat(&chat_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Paginated history along one branch.
#[utoipa::path(
    get,
    path = "/api/chats/{chat_id}/turns",
    params(("chat_id" = String, Path, description = "Chat id"), HistoryQuery),
    responses(
        (status = 200, description = "History page", body = TurnPageResponse),
        (status = 404, description = "Chat or anchor turn not found", body = ErrorBody)
    )
)]
async fn list_turns(
    State(state): State<SharedState>,
    Path(chat_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<TurnPageResponse>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let page = state.engine.history(
        &chat_id,
        query.from_turn_id.as_deref(),
        query.direction.unwrap_or_default(),
        limit,
    )?;

    let ids: Vec<String> = page.turns.iter().map(|t| t.id.clone()).collect();
    let blocks = state.engine.store().blocks_for_turns(&ids)?;
    let siblings = state.engine.sibling_map(&ids)?;

    Ok(Json(TurnPageResponse {
        turns: page.turns,
        blocks,
        siblings,
        has_more_before: page.has_more_before,
        has_more_after: page.has_more_after,
    }))
}

/// Root-to-turn path.
#[utoipa::path(
    get,
    path = "/api/turns/{turn_id}/path",
    params(("turn_id" = String, Path, description = "Turn id")),
    responses(
        (status = 200, description = "Turns from the root to this turn", body = TurnListResponse),
        (status = 404, description = "Turn not found", body = ErrorBody)
    )
)]
async fn turn_path(
    State(state): State<SharedState>,
    Path(turn_id): Path<String>,
) -> ApiResult<Json<TurnListResponse>> {
    let turns = state.engine.path(&turn_id)?;
    Ok(Json(TurnListResponse { turns }))
}

#[utoipa::path(
    get,
    path = "/api/turns/{turn_id}/siblings",
    params(("turn_id" = String, Path, description = "Turn id")),
    responses(
        (status = 200, description = "Ids of turns sharing this turn's parent, itself included", body = SiblingsResponse),
        (status = 404, description = "Turn not found", body = ErrorBody)
    )
)]
async fn turn_siblings(
    State(state): State<SharedState>,
    Path(turn_id): Path<String>,
) -> ApiResult<Json<SiblingsResponse>> {
    let sibling_ids = state.engine.siblings(&turn_id)?;
    Ok(Json(SiblingsResponse { sibling_ids }))
}

#[utoipa::path(
    get,
    path = "/api/turns/{turn_id}/blocks",
    params(("turn_id" = String, Path, description = "Turn id")),
    responses(
        (status = 200, description = "Persisted blocks in sequence order", body = BlocksResponse),
        (status = 404, description = "Turn not found", body = ErrorBody)
    )
)]
async fn turn_blocks(
    State(state): State<SharedState>,
    Path(turn_id): Path<String>,
) -> ApiResult<Json<BlocksResponse>> {
    let blocks = state.engine.blocks(&turn_id)?;
    Ok(Json(BlocksResponse { blocks }))
}

#[utoipa::path(
    post,
    path = "/api/turns/{turn_id}/interrupt",
    params(("turn_id" = String, Path, description = "Turn id")),
    responses(
        (status = 202, description = "Interrupt requested"),
        (status = 404, description = "Turn is not streaming", body = ErrorBody)
    )
)]
async fn interrupt_turn(
    State(state): State<SharedState>,
    Path(turn_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.interrupt(&turn_id)?;
    Ok(StatusCode::ACCEPTED)
}

/// Generate another reply next to a turn.
#[utoipa::path(
    post,
    path = "/api/turns/{turn_id}/regenerate",
    params(("turn_id" = String, Path, description = "Assistant turn to replace, or user turn to answer")),
    request_body(content = RegenerateRequest, description = "Optional generation settings"),
    responses(
        (status = 201, description = "New assistant turn created", body = TurnResponse),
        (status = 404, description = "Turn not found", body = ErrorBody)
    )
)]
async fn regenerate_turn(
    State(state): State<SharedState>,
    Path(turn_id): Path<String>,
    body: Option<Json<RegenerateRequest>>,
) -> ApiResult<(StatusCode, Json<TurnResponse>)> {
    let options = body.map(|Json(req)| req).unwrap_or_default().options();
    let turn = state.engine.regenerate(&turn_id, &options)?;
    Ok((
        StatusCode::CREATED,
        Json(TurnResponse {
            stream_url: stream_url(&turn.id),
            turn,
        }),
    ))
}

/// Live event feed of a turn.
///
/// Reconnect with `Last-Event-ID` (or `last_event_id`) to receive only
/// what was missed.
#[utoipa::path(
    get,
    path = "/api/turns/{turn_id}/stream",
    params(("turn_id" = String, Path, description = "Turn id"), StreamQuery),
    responses(
        (status = 200, description = "Server-sent event feed", body = String, content_type = "text/event-stream"),
        (status = 400, description = "Malformed event id", body = ErrorBody),
        (status = 404, description = "Turn not found", body = ErrorBody)
    )
)]
async fn stream_turn(
    State(state): State<SharedState>,
    Path(turn_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let marker = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.last_event_id);

    let feed = state.engine.subscribe(&turn_id, marker.as_deref())?;
    let events = feed.map(|sequenced| {
        Ok(Event::default()
            .id(sequenced.id.to_string())
            .event(sequenced.event.name())
            .data(sequenced.event.data()))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use llm_core::LlmProvider;
    use llm_core::providers::{LoremConfig, LoremProvider};
    use tower::ServiceExt;

    use crate::config::StreamingConfig;
    use crate::core::registry::ProviderRegistry;
    use crate::core::store::ConversationStore;
    use crate::core::tools::ToolRegistry;

    fn create_test_state(token: Option<String>) -> SharedState {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let providers = Arc::new(ProviderRegistry::new(Arc::new(|name: &str| {
            if name != "lorem" {
                return Err(Error::Config(format!("unknown provider '{name}'")));
            }
            Ok(Arc::new(LoremProvider::new(LoremConfig {
                words_per_second: 0.0,
                response_words: 4,
                thinking_words: 2,
            })) as Arc<dyn LlmProvider>)
        })));
        let engine = StreamingEngine::new(
            store,
            providers,
            ToolRegistry::new(),
            StreamingConfig::default(),
            "lorem/lorem",
        );
        Arc::new(AppState {
            engine: Arc::new(engine),
            token,
        })
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn cold_start_exchange(state: &SharedState) -> ExchangeResponse {
        let response = router(state.clone())
            .oneshot(post_json(
                "/api/projects/proj_1/turns",
                r#"{"content": "Tell me a story"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let state = create_test_state(Some("secret-token".to_string()));
        let response = router(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_middleware_rejects_request_without_token() {
        let state = create_test_state(Some("secret-token".to_string()));
        let response = router(state)
            .oneshot(get("/api/projects/proj_1/chats"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_middleware_allows_valid_token() {
        let state = create_test_state(Some("secret-token".to_string()));
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/projects/proj_1/chats")
                    .header("Authorization", "Bearer secret-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cold_start_streams_to_completion() {
        let state = create_test_state(None);
        let exchange = cold_start_exchange(&state).await;
        assert_eq!(exchange.chat.title, "Tell me a story");
        assert_eq!(
            exchange.stream_url,
            format!("/api/turns/{}/stream", exchange.assistant_turn.id)
        );

        let response = router(state.clone())
            .oneshot(get(&exchange.stream_url))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let feed = body_text(response).await;
        assert!(feed.contains("turn_start"));
        assert!(feed.contains("turn_complete"));
        assert!(!feed.contains("turn_error"));

        let blocks_uri = format!("/api/turns/{}/blocks", exchange.assistant_turn.id);
        let response = router(state).oneshot(get(&blocks_uri)).await.unwrap();
        let blocks: BlocksResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(blocks.blocks.len(), 1);
        assert_eq!(blocks.blocks[0].block.text_content(), Some("Lorem ipsum dolor sit."));
    }

    #[tokio::test]
    async fn reconnect_skips_seen_events() {
        let state = create_test_state(None);
        let exchange = cold_start_exchange(&state).await;
        let full = body_text(
            router(state.clone())
                .oneshot(get(&exchange.stream_url))
                .await
                .unwrap(),
        )
        .await;
        assert!(full.contains("turn_start"));

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri(&exchange.stream_url)
                    .header("Last-Event-ID", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let resumed = body_text(response).await;
        assert!(!resumed.contains("turn_start"));
        assert!(resumed.contains("block_catchup"));
        assert!(resumed.contains("turn_complete"));
    }

    #[tokio::test]
    async fn malformed_marker_is_rejected() {
        let state = create_test_state(None);
        let exchange = cold_start_exchange(&state).await;
        let uri = format!("{}?last_event_id=abc", exchange.stream_url);
        let response = router(state).oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body.error, "invalid_event_id");
    }

    #[tokio::test]
    async fn unknown_model_fails_without_side_effects() {
        let state = create_test_state(None);
        let response = router(state.clone())
            .oneshot(post_json(
                "/api/projects/proj_1/turns",
                r#"{"content": "hi", "model": "nowhere/model-x"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router(state)
            .oneshot(get("/api/projects/proj_1/chats"))
            .await
            .unwrap();
        let chats: ChatListResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(chats.chats.is_empty());
    }

    #[tokio::test]
    async fn interrupt_without_stream_is_not_found() {
        let state = create_test_state(None);
        let response = router(state)
            .oneshot(post_json("/api/turns/turn_missing/interrupt", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_chat_is_not_found() {
        let state = create_test_state(None);
        let response = router(state)
            .oneshot(post_json("/api/chats/chat_missing/turns", r#"{"content": "hi"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn regenerate_creates_sibling() {
        let state = create_test_state(None);
        let exchange = cold_start_exchange(&state).await;
        let uri = format!("/api/turns/{}/regenerate", exchange.assistant_turn.id);
        let response = router(state.clone())
            .oneshot(Request::builder().method("POST").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let regenerated: TurnResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(
            regenerated.turn.prev_turn_id.as_deref(),
            Some(exchange.user_turn.id.as_str())
        );

        let uri = format!("/api/turns/{}/siblings", regenerated.turn.id);
        let response = router(state).oneshot(get(&uri)).await.unwrap();
        let siblings: SiblingsResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(siblings.sibling_ids.len(), 2);
        assert!(siblings.sibling_ids.contains(&exchange.assistant_turn.id));
    }
}
