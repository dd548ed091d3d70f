//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/actors` | List actor profiles |
//! | `POST` | `/actors` | Create an actor profile |
//! | `POST` | `/actors/{id}/sources` | Upsert one source (URL and fingerprint dedup) |
//! | `GET`  | `/actors/{id}/evidence` | Ranked evidence with optional filters |
//! | `POST` | `/actors/{id}/taxii/sync` | Sync one TAXII collection window |
//! | `GET`  | `/actors/{id}/taxii/runs` | Sync run history, newest first |
//! | `POST` | `/actors/{id}/refresh` | Queue a notebook generation |
//! | `GET`  | `/actors/{id}/jobs/{job_id}` | One generation job with its phases |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "url must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `rate_limited`
//! (429, with `Retry-After`), `internal` (500).
//!
//! # Admission
//!
//! Every request passes through the [`RateLimiter`] before routing and is
//! reported as a `request_completed` event afterwards, rejected or not.

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::actors;
use crate::collection_sync::{build_collection_sync, list_sync_runs, CollectionSync};
use crate::config::Config;
use crate::db;
use crate::events::{self, Event};
use crate::evidence::{rank_evidence, scoring_available, EvidenceFilter};
use crate::generation::{build_generation_service, GenerationService};
use crate::ingest::SourceStore;
use crate::models::{ActorProfile, GenerationJob, RankedEvidence, SourceUpsert, SyncRun, SyncSummary};
use crate::rate_limit::{self, Admission, RateLimiter};
use crate::scheduler::Scheduler;
use crate::scoring;
use crate::traits::{Clock, IdGenerator, SystemClock, UuidGenerator};

pub const MANUAL_REFRESH_TRIGGER: &str = "manual_refresh";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub sync: Arc<CollectionSync>,
    pub generation: GenerationService,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Production wiring: system clock, v4 ids, reqwest client, STIX importer.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        Ok(Self {
            config: Arc::new(config.clone()),
            pool: pool.clone(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            sync: Arc::new(build_collection_sync(config, pool.clone())?),
            generation: build_generation_service(config, pool)?,
            limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
        })
    }

    fn store(&self) -> &SourceStore {
        self.sync.store()
    }
}

/// Starts the HTTP server, plus the auto-refresh loop when enabled.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let state = AppState::from_config(config, pool.clone())?;

    if config.scheduler.enabled {
        let scheduler = Scheduler::new(
            pool,
            state.generation.clone(),
            state.clock.clone(),
            config.scheduler.clone(),
        );
        tokio::spawn(scheduler.run());
    }

    let app = build_router(state);
    let bind_addr = config.server.bind.clone();
    tracing::info!(bind = %bind_addr, "notebook server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/actors", get(handle_list_actors).post(handle_create_actor))
        .route("/actors/{id}/sources", post(handle_upsert_source))
        .route("/actors/{id}/evidence", get(handle_evidence))
        .route("/actors/{id}/taxii/sync", post(handle_sync))
        .route("/actors/{id}/taxii/runs", get(handle_sync_runs))
        .route("/actors/{id}/refresh", post(handle_refresh))
        .route("/actors/{id}/jobs/{job_id}", get(handle_job_detail))
        .layer(middleware::from_fn_with_state(state.clone(), admission))
        .layer(cors)
        .with_state(state)
}

// ============ Admission ============

async fn admission(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = rate_limit::client_id(request.headers(), peer);

    let response = match state.limiter.check(&method, &path, &client) {
        Admission::Allow => next.run(request).await,
        Admission::Deny { retry_after, limit } => {
            tracing::debug!(client = %client, path = %path, retry_after, "request rate limited");
            let mut response = AppError {
                status: StatusCode::TOO_MANY_REQUESTS,
                code: "rate_limited".to_string(),
                message: format!(
                    "Rate limit exceeded for write requests. Try again in {} seconds.",
                    retry_after
                ),
            }
            .into_response();
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            response
        }
    };

    events::emit(&Event::RequestCompleted {
        method,
        path,
        status: response.status().as_u16(),
        duration_ms: started.elapsed().as_millis() as u64,
    });
    response
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

async fn require_actor(state: &AppState, actor_id: &str) -> Result<ActorProfile, AppError> {
    actors::get_actor(&state.pool, actor_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("actor not found: {}", actor_id)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /actors ============

#[derive(Deserialize)]
struct CreateActorRequest {
    display_name: String,
    #[serde(default = "default_tracked")]
    is_tracked: bool,
}

fn default_tracked() -> bool {
    true
}

async fn handle_list_actors(State(state): State<AppState>) -> Result<Json<Vec<ActorProfile>>, AppError> {
    let actors = actors::list_actors(&state.pool).await.map_err(internal)?;
    Ok(Json(actors))
}

async fn handle_create_actor(
    State(state): State<AppState>,
    Json(request): Json<CreateActorRequest>,
) -> Result<(StatusCode, Json<ActorProfile>), AppError> {
    if request.display_name.trim().is_empty() {
        return Err(bad_request("display_name must not be empty"));
    }
    let actor = actors::create_actor(
        &state.pool,
        &*state.clock,
        &*state.ids,
        &request.display_name,
        request.is_tracked,
    )
    .await
    .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(actor)))
}

// ============ POST /actors/{id}/sources ============

#[derive(Serialize)]
struct UpsertSourceResponse {
    source_id: String,
}

async fn handle_upsert_source(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
    Json(mut upsert): Json<SourceUpsert>,
) -> Result<Json<UpsertSourceResponse>, AppError> {
    let actor = require_actor(&state, &actor_id).await?;
    if upsert.url.trim().is_empty() {
        return Err(bad_request("url must not be empty"));
    }
    upsert.actor_id = actor_id;
    let store = state.store();
    let source_id = store.upsert_source(&upsert).await.map_err(internal)?;

    if let Some(source) = store.get_source(&source_id).await.map_err(internal)? {
        scoring::score_source(
            &state.pool,
            &*state.ids,
            state.clock.now(),
            &source,
            &[actor.display_name],
            scoring::DEFAULT_NOVELTY,
        )
        .await
        .map_err(internal)?;
    }
    Ok(Json(UpsertSourceResponse { source_id }))
}

// ============ GET /actors/{id}/evidence ============

#[derive(Serialize)]
struct EvidenceResponse {
    actor_id: String,
    scoring_available: bool,
    count: usize,
    items: Vec<RankedEvidence>,
}

async fn handle_evidence(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
    Query(filter): Query<EvidenceFilter>,
) -> Result<Json<EvidenceResponse>, AppError> {
    require_actor(&state, &actor_id).await?;
    let items = rank_evidence(&state.pool, &actor_id, &filter, state.config.ranking.default_limit)
        .await
        .map_err(internal)?;
    let scoring_available = scoring_available(&state.pool).await.map_err(internal)?;
    Ok(Json(EvidenceResponse {
        actor_id,
        scoring_available,
        count: items.len(),
        items,
    }))
}

// ============ /actors/{id}/taxii ============

#[derive(Deserialize)]
struct SyncRequest {
    collection_url: String,
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default)]
    lookback_hours: Option<i64>,
}

async fn handle_sync(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncSummary>, AppError> {
    require_actor(&state, &actor_id).await?;
    if request.collection_url.trim().is_empty() {
        return Err(bad_request("collection_url must not be empty"));
    }
    let token = request
        .auth_token
        .as_deref()
        .or(state.config.sync.bearer_token.as_deref());
    let lookback = request
        .lookback_hours
        .unwrap_or(state.config.sync.default_lookback_hours);

    let summary = state
        .sync
        .sync_collection(&actor_id, &request.collection_url, token, lookback)
        .await
        .map_err(internal)?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct RunsQuery {
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_sync_runs(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<SyncRun>>, AppError> {
    require_actor(&state, &actor_id).await?;
    let runs = list_sync_runs(&state.pool, &actor_id, query.limit.unwrap_or(20))
        .await
        .map_err(internal)?;
    Ok(Json(runs))
}

// ============ Generation ============

async fn handle_refresh(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
) -> Result<(StatusCode, Json<GenerationJob>), AppError> {
    require_actor(&state, &actor_id).await?;
    let job = state
        .generation
        .enqueue_generation(&actor_id, MANUAL_REFRESH_TRIGGER)
        .await
        .map_err(internal)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn handle_job_detail(
    State(state): State<AppState>,
    Path((actor_id, job_id)): Path<(String, String)>,
) -> Result<Json<GenerationJob>, AppError> {
    let job = state
        .generation
        .journal()
        .job_detail(&actor_id, &job_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("job not found: {}", job_id)))?;
    Ok(Json(job))
}
