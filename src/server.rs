//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness, version, default model, collection |
//! | `POST` | `/v1/chat/completions` | Retrieve, then answer with citations |
//! | `POST` | `/v1/retrieve` | Retrieval only |
//! | `GET`  | `/admin/raw-files` | List raw files (`?recursive=true&ext=.txt`) |
//! | `POST` | `/admin/raw-files/upload` | Save a multipart `file` into the data repository |
//! | `POST` | `/admin/raw-files/upload-and-ingest` | Save and ingest; the file is removed if ingestion fails |
//! | `DELETE` | `/admin/raw-files/{*path}` | Delete a file, its embeddings, then rebuild |
//! | `POST` | `/admin/ingest/{*path}` | Ingest a file already in the repository |
//! | `DELETE` | `/admin/vector/file/{*path}` | Delete a file's embeddings, keep the file |
//! | `DELETE` | `/admin/vector/reset` | Empty the collection |
//! | `POST` | `/admin/rebuild` | Reopen the retriever's index handle |
//!
//! When `[server].api_key_env` names a variable that is set, every route
//! except `/health` requires a matching `X-API-Key` header.
//!
//! Errors use the body described in [`crate::error`].

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Multipart, Path, Query, State,
    },
    http::HeaderMap,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::admin::{AdminService, DataRepo};
use crate::config::Config;
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::error::ApiError;
use crate::index::sqlite::SqliteCollectionProvider;
use crate::llm::{ChatClient, OpenAIChatClient};
use crate::models::{Citation, ConversationTurn, RetrievalQuery, RetrievedChunk, Usage};
use crate::orchestrator::{Orchestrator, OrchestratorInput};
use crate::prompt::FsPromptStore;
use crate::retriever::RetrievalEngine;

const API_KEY_HEADER: &str = "x-api-key";

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    admin: Arc<AdminService>,
    api_key: Option<String>,
}

impl AppState {
    /// Wire up store, retriever, orchestrator and admin service around the
    /// given providers. The API key is read from `[server].api_key_env`.
    pub fn build(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatClient>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteCollectionProvider::new(&config.store, embedder)?);
        let retriever = Arc::new(RetrievalEngine::from_config(
            store.clone(),
            &config.retrieval,
        )?);
        let prompts = FsPromptStore::new(&config.prompts.dir);
        let orchestrator = Arc::new(Orchestrator::from_config(
            config,
            retriever.clone(),
            chat,
            &prompts,
            None,
        ));
        let repo = DataRepo::open(&config.ingest)?;
        let admin = Arc::new(AdminService::new(
            repo,
            store,
            retriever,
            config.embedding.batch_size,
        ));

        let api_key = config
            .server
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            config: Arc::new(config.clone()),
            orchestrator,
            admin,
            api_key,
        })
    }

    /// Override the API key (`None` disables the check).
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn admin(&self) -> &Arc<AdminService> {
        &self.admin
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/chat/completions", post(handle_chat))
        .route("/v1/retrieve", post(handle_retrieve))
        .route("/admin/raw-files", get(handle_list_files))
        .route("/admin/raw-files/upload", post(handle_upload))
        .route(
            "/admin/raw-files/upload-and-ingest",
            post(handle_upload_and_ingest),
        )
        .route("/admin/raw-files/{*path}", delete(handle_delete_file))
        .route("/admin/ingest/{*path}", post(handle_ingest))
        .route("/admin/vector/file/{*path}", delete(handle_delete_vectors))
        .route("/admin/vector/reset", delete(handle_reset))
        .route("/admin/rebuild", post(handle_rebuild))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already-bound listener until the process stops.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Build the production providers from `config` and serve on `[server].bind`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let embedder = create_embedder(&config.embedding)?;
    let chat: Arc<dyn ChatClient> = Arc::new(OpenAIChatClient::new(&config.chat)?);
    let state = AppState::build(config, embedder, chat)?;
    if state.api_key.is_none() {
        tracing::warn!("no API key configured; admin routes are unauthenticated");
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(
        bind = %config.server.bind,
        collection = %config.store.collection,
        model = %config.chat.default_model,
        "server listening"
    );
    serve(listener, state).await
}

fn require_api_key(headers: &HeaderMap, state: &AppState) -> Result<(), ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        tracing::warn!("rejected request with missing or invalid API key");
        Err(ApiError::Unauthorized)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    default_model: String,
    collection: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        default_model: state.config.chat.default_model.clone(),
        collection: state.config.store.collection.clone(),
    })
}

// ============ POST /v1/chat/completions ============

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
    pub sources: Vec<Citation>,
}

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    require_api_key(&headers, &state)?;
    let Json(req) = body?;

    let user = req.user.trim();
    if user.is_empty() {
        return Err(ApiError::BadRequest("user must not be empty".to_string()));
    }
    let question = req.input.trim();
    if question.is_empty() {
        return Err(ApiError::BadRequest("input must not be empty".to_string()));
    }
    let model = req
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(state.config.chat.default_model.as_str())
        .to_string();

    tracing::info!(user, model = %model, session = ?req.session_id, "chat request");

    let input = OrchestratorInput {
        user: user.to_string(),
        question: question.to_string(),
        model: model.clone(),
        session_id: req.session_id.clone(),
        history: req.history,
    };
    let result = state.orchestrator.run(&input).await?;

    let created = chrono::Utc::now().timestamp();
    Ok(Json(ChatResponse {
        id: format!("chatcmpl_{}", created),
        object: "chat.completion",
        created,
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant",
                content: result.answer,
            },
            finish_reason: "stop",
        }],
        usage: result.usage,
        sources: result.sources,
    }))
}

// ============ POST /v1/retrieve ============

#[derive(Debug, Deserialize)]
struct RetrieveRequest {
    #[serde(default)]
    input: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Serialize)]
struct RetrieveResponse {
    chunks: Vec<RetrievedChunk>,
}

async fn handle_retrieve(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RetrieveRequest>, JsonRejection>,
) -> Result<Json<RetrieveResponse>, ApiError> {
    require_api_key(&headers, &state)?;
    let Json(req) = body?;

    let question = req.input.trim();
    if question.is_empty() {
        return Err(ApiError::BadRequest("input must not be empty".to_string()));
    }
    let query = RetrievalQuery::new(req.user.unwrap_or_default(), question);
    let chunks = state.orchestrator.retriever().retrieve(&query).await?;
    Ok(Json(RetrieveResponse { chunks }))
}

// ============ Admin ============

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    ext: Option<String>,
}

async fn handle_list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&headers, &state)?;
    let Query(params) = params?;

    let repo = state.admin.repo();
    let files = repo.list(params.recursive, params.ext.as_deref())?;
    tracing::info!(recursive = params.recursive, ext = ?params.ext, count = files.len(), "listing raw files");
    Ok(Json(serde_json::json!({
        "data_path": repo.root().display().to_string(),
        "files": files,
    })))
}

/// Read the multipart `file` field: `(file name, bytes)`.
async fn read_upload(mut multipart: Multipart) -> Result<(String, Vec<u8>), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().trim().to_string();
        if file_name.is_empty() {
            return Err(ApiError::BadRequest("missing filename".to_string()));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        return Ok((file_name, bytes.to_vec()));
    }
    Err(ApiError::BadRequest("missing multipart field 'file'".to_string()))
}

async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&headers, &state)?;

    let (file_name, bytes) = read_upload(multipart).await?;
    let saved = state.admin.repo().save(&file_name, &bytes)?;
    Ok(Json(serde_json::to_value(saved).map_err(ApiError::internal)?))
}

async fn handle_upload_and_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&headers, &state)?;

    let (file_name, bytes) = read_upload(multipart).await?;
    let outcome = state.admin.upload_and_ingest(&file_name, &bytes).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(ApiError::internal)?))
}

async fn handle_delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&headers, &state)?;

    let outcome = state.admin.delete_document(&path).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(ApiError::internal)?))
}

async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&headers, &state)?;

    let outcome = state.admin.ingest(&path).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(ApiError::internal)?))
}

async fn handle_delete_vectors(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&headers, &state)?;

    let outcome = state.admin.delete_vectors(&path).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(ApiError::internal)?))
}

async fn handle_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&headers, &state)?;

    let outcome = state.admin.reset_collection().await?;
    Ok(Json(serde_json::to_value(outcome).map_err(ApiError::internal)?))
}

async fn handle_rebuild(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_api_key(&headers, &state)?;

    state.admin.rebuild().await?;
    tracing::info!("retriever rebuilt on request");
    Ok(Json(serde_json::json!({
        "status": "ok",
        "collection": state.admin.collection_name(),
    })))
}
