use agentcanvas_engine::{Engine, EngineError, ErrorKind};
use agentcanvas_protocol::{
    palette, requests, Analytics, CanvasSnapshot, Color, ErrorBody, FactionStat, LeaderboardPage,
    LeaderboardSort,
};
use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod cache;
pub mod config;

#[cfg(test)]
mod tests;

pub use cache::{Lookup, TtlCache};
pub use config::ServerConfig;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

pub struct AppState {
    pub engine: Engine,
    pub request_timeout: Duration,
    leaderboard: TtlCache<(usize, LeaderboardSort, usize), LeaderboardPage>,
    factions: TtlCache<(), Vec<FactionStat>>,
    analytics: TtlCache<(), Analytics>,
}

impl AppState {
    pub fn new(engine: Engine, request_timeout: Duration) -> Self {
        Self {
            engine,
            request_timeout,
            leaderboard: TtlCache::new(Duration::from_secs(60), 20),
            factions: TtlCache::new(Duration::from_secs(120), 1),
            analytics: TtlCache::new(Duration::from_secs(30), 1),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/register", post(register))
        .route("/api/pixel", post(place_pixel))
        .route("/api/agent/status", post(agent_status))
        .route("/api/canvas", get(canvas))
        .route("/api/canvas/since", get(canvas_since))
        .route("/api/canvas/activity", get(canvas_activity))
        .route("/api/canvas/dimensions", get(dimensions))
        .route("/api/canvas/palette", get(palette_table))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/analytics", get(analytics))
        .route("/api/factions", get(factions))
        .route("/api/factions/join", post(join_faction))
        .route("/api/factions/leaderboard", get(faction_leaderboard))
        .route("/api/factions/conflicts", get(conflict_zones))
        .route("/api/factions/{slug}", get(faction_detail))
        .route("/api/admin/territory", post(admin_territory))
        .route("/api/admin/conflicts", post(admin_record_conflict))
        .route("/api/admin/clear", post(admin_clear))
        .route("/api/admin/config", post(admin_config))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        // Agents call from anywhere; credentials travel in headers or bodies, never cookies.
        .layer(public_cors())
}

fn public_cors() -> CorsLayer {
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, X_API_KEY])
        .allow_origin(Any)
}

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    Timeout,
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Engine(e) => {
                let status = match e.kind() {
                    ErrorKind::Validation => StatusCode::BAD_REQUEST,
                    ErrorKind::Authorization => StatusCode::UNAUTHORIZED,
                    ErrorKind::Exhausted => StatusCode::TOO_MANY_REQUESTS,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::Conflict => StatusCode::CONFLICT,
                    ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                // Storage details stay in the log.
                let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %e, "engine failure");
                    "internal server error".to_string()
                } else {
                    e.to_string()
                };
                (
                    status,
                    ErrorBody {
                        error,
                        code: e.code().to_string(),
                        retry_after_seconds: e.retry_after_seconds(),
                    },
                )
            }
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: msg.clone(),
                    code: "bad_request".to_string(),
                    retry_after_seconds: None,
                },
            ),
            ApiError::Timeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error: "request timed out".to_string(),
                    code: "timeout".to_string(),
                    retry_after_seconds: None,
                },
            ),
            ApiError::Internal(detail) => {
                tracing::error!(%detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "internal server error".to_string(),
                        code: "internal".to_string(),
                        retry_after_seconds: None,
                    },
                )
            }
        };
        let retry = body.retry_after_seconds;
        let mut resp = (status, Json(body)).into_response();
        if let Some(secs) = retry {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        resp
    }
}

/// Run engine work off the async executor, bounded by the request timeout.
/// A timed-out call keeps running to commit or roll back on its own; only the
/// response is abandoned.
async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Engine) -> agentcanvas_engine::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let engine = state.engine.clone();
    let task = tokio::task::spawn_blocking(move || f(&engine));
    match tokio::time::timeout(state.request_timeout, task).await {
        Err(_) => Err(ApiError::Timeout),
        Ok(Err(join)) => Err(ApiError::Internal(join.to_string())),
        Ok(Ok(result)) => result.map_err(ApiError::from),
    }
}

/// `x-api-key` header, then `Authorization: Bearer`, then the body field.
fn extract_api_key(headers: &HeaderMap, body_key: Option<&str>) -> Option<String> {
    let header_key = headers
        .get(X_API_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty());
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .filter(|s| !s.is_empty());
    header_key
        .or(bearer)
        .or(body_key.filter(|s| !s.is_empty()))
        .map(str::to_string)
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let start = Instant::now();
    let probe = run_blocking(&state, |e| Ok((e.dimensions()?, e.analytics()?.totals))).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let timestamp = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();

    let (status, body) = match probe {
        Ok((dimensions, totals)) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "timestamp": timestamp,
                "checks": { "database": "ok", "latencyMs": latency_ms },
                "stats": {
                    "canvas": dimensions,
                    "totalAgents": totals.total_agents,
                    "totalPixels": totals.total_pixels,
                },
            }),
        ),
        Err(e) => {
            tracing::warn!(error = ?e, "health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "degraded",
                    "version": env!("CARGO_PKG_VERSION"),
                    "timestamp": timestamp,
                    "checks": { "database": "error", "latencyMs": latency_ms },
                }),
            )
        }
    };
    (
        status,
        [(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")],
        Json(body),
    )
        .into_response()
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(input): Json<requests::Register>,
) -> Result<Json<agentcanvas_protocol::Registration>, ApiError> {
    let reg = run_blocking(&state, move |e| e.register(&input.name)).await?;
    Ok(Json(reg))
}

async fn place_pixel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<requests::PlacePixel>,
) -> Result<Json<agentcanvas_protocol::Placement>, ApiError> {
    let api_key = extract_api_key(&headers, input.api_key.as_deref())
        .ok_or_else(|| ApiError::BadRequest("apiKey is required".to_string()))?;
    let color = Color::from_json(&input.color).ok_or(EngineError::InvalidColor)?;
    let (x, y) = (input.x, input.y);
    let placed = run_blocking(&state, move |e| e.place_pixel(&api_key, x, y, color)).await?;
    Ok(Json(placed))
}

async fn agent_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<requests::WithApiKey>,
) -> Result<Json<agentcanvas_protocol::AgentStatus>, ApiError> {
    let api_key = extract_api_key(&headers, Some(&input.api_key))
        .ok_or_else(|| ApiError::BadRequest("apiKey is required".to_string()))?;
    let status = run_blocking(&state, move |e| e.get_status(&api_key)).await?;
    Ok(Json(status))
}

async fn canvas(State(state): State<Arc<AppState>>) -> Result<Json<CanvasSnapshot>, ApiError> {
    let snapshot = run_blocking(&state, |e| {
        Ok(CanvasSnapshot {
            pixels: e.get_all()?,
            dimensions: e.dimensions()?,
        })
    })
    .await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    #[serde(default)]
    since: i64,
    limit: Option<i64>,
}

async fn canvas_since(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SinceQuery>,
) -> Result<Json<Vec<agentcanvas_protocol::HistoryEntry>>, ApiError> {
    let entries = run_blocking(&state, move |e| e.get_since(q.since, q.limit)).await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn canvas_activity(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<agentcanvas_protocol::HistoryEntry>>, ApiError> {
    let entries = run_blocking(&state, move |e| e.get_latest_activity(q.limit)).await?;
    Ok(Json(entries))
}

async fn dimensions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<agentcanvas_protocol::Dimensions>, ApiError> {
    Ok(Json(run_blocking(&state, |e| e.dimensions()).await?))
}

async fn palette_table() -> Json<Vec<String>> {
    Json((0..palette::PALETTE.len()).filter_map(palette::hex).collect())
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
    sort: Option<String>,
    cursor: Option<String>,
}

fn parse_sort(sort: Option<&str>) -> LeaderboardSort {
    match sort {
        Some("name") => LeaderboardSort::Name,
        Some("newest") => LeaderboardSort::Newest,
        Some("oldest") => LeaderboardSort::Oldest,
        _ => LeaderboardSort::Pixels,
    }
}

async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LeaderboardQuery>,
) -> Result<Response, ApiError> {
    let limit = q.limit.unwrap_or(10).clamp(1, 50);
    let sort = parse_sort(q.sort.as_deref());
    let offset = agentcanvas_engine::stats::parse_cursor(q.cursor.as_deref());
    let (page, lookup) = state
        .leaderboard
        .get_or_try_insert((limit, sort, offset), || {
            run_blocking(&state, move |e| e.leaderboard(limit, sort, offset))
        })
        .await?;
    Ok(cached(lookup, "public, max-age=30, stale-while-revalidate=60", page))
}

async fn analytics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let (analytics, lookup) = state
        .analytics
        .get_or_try_insert((), || run_blocking(&state, |e| e.analytics()))
        .await?;
    Ok(cached(lookup, "public, max-age=30, stale-while-revalidate=60", analytics))
}

async fn factions(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let (stats, lookup) = state
        .factions
        .get_or_try_insert((), || run_blocking(&state, |e| e.get_faction_stats()))
        .await?;
    Ok(cached(
        lookup,
        "public, max-age=60, stale-while-revalidate=120",
        serde_json::json!({ "factions": stats }),
    ))
}

fn cached(lookup: Lookup, cache_control: &'static str, body: impl serde::Serialize) -> Response {
    (
        [
            (header::CACHE_CONTROL, cache_control),
            (X_CACHE, lookup.header_value()),
        ],
        Json(body),
    )
        .into_response()
}

async fn faction_detail(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<agentcanvas_protocol::FactionDetail>, ApiError> {
    Ok(Json(run_blocking(&state, move |e| e.get_faction(&slug)).await?))
}

async fn join_faction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<requests::JoinFaction>,
) -> Result<Json<agentcanvas_protocol::JoinedFaction>, ApiError> {
    let api_key = extract_api_key(&headers, Some(&input.api_key))
        .ok_or_else(|| ApiError::BadRequest("apiKey is required".to_string()))?;
    let joined = run_blocking(&state, move |e| {
        e.join_faction(&api_key, &input.faction_slug)
    })
    .await?;
    Ok(Json(joined))
}

async fn faction_leaderboard(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LeaderboardQuery>,
) -> Result<Json<Vec<agentcanvas_protocol::RankedFaction>>, ApiError> {
    let limit = q.limit;
    Ok(Json(
        run_blocking(&state, move |e| e.faction_leaderboard(limit)).await?,
    ))
}

async fn conflict_zones(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<agentcanvas_protocol::ConflictZoneView>>, ApiError> {
    Ok(Json(
        run_blocking(&state, move |e| e.get_conflict_zones(q.limit)).await?,
    ))
}

async fn admin_territory(
    State(state): State<Arc<AppState>>,
    Json(input): Json<requests::Admin>,
) -> Result<Json<agentcanvas_protocol::TerritoryReport>, ApiError> {
    let report = run_blocking(&state, move |e| e.recalculate_territory(&input.admin_key)).await?;
    state.factions.clear();
    Ok(Json(report))
}

async fn admin_record_conflict(
    State(state): State<Arc<AppState>>,
    Json(input): Json<requests::RecordConflict>,
) -> Result<Json<agentcanvas_protocol::ConflictRecorded>, ApiError> {
    let recorded = run_blocking(&state, move |e| {
        e.record_conflict(
            &input.admin_key,
            input.x,
            input.y,
            &input.faction_a_slug,
            &input.faction_b_slug,
            input.intensity,
        )
    })
    .await?;
    Ok(Json(recorded))
}

async fn admin_clear(
    State(state): State<Arc<AppState>>,
    Json(input): Json<requests::Admin>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cleared = run_blocking(&state, move |e| e.clear(&input.admin_key)).await?;
    state.analytics.clear();
    Ok(Json(serde_json::json!({
        "cleared": true,
        "pixels": cleared.pixels,
        "history": cleared.history,
    })))
}

async fn admin_config(
    State(state): State<Arc<AppState>>,
    Json(input): Json<requests::SetConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cfg = run_blocking(&state, move |e| {
        e.set_config(&input.admin_key, &input.key, &input.value)
    })
    .await?;
    Ok(Json(serde_json::json!({
        "width": cfg.width,
        "height": cfg.height,
        "poolStart": cfg.pool_start,
        "poolMax": cfg.pool_max,
        "regenIntervalMs": cfg.regen_interval_ms,
    })))
}

/// Periodic territory pass. Stops when `cancel` is set.
pub fn spawn_territory_refresher(
    engine: Engine,
    every: Duration,
    cancel: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let engine = engine.clone();
            let flag = cancel.clone();
            match tokio::task::spawn_blocking(move || engine.refresh_territory(&flag)).await {
                Ok(Ok(report)) => {
                    tracing::debug!(factions = report.recalculated, "scheduled territory refresh")
                }
                Ok(Err(EngineError::Cancelled)) => break,
                Ok(Err(e)) => tracing::warn!(error = %e, "scheduled territory refresh failed"),
                Err(e) => tracing::error!(error = %e, "territory refresh task panicked"),
            }
        }
    })
}

pub async fn serve(cfg: ServerConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(cfg.addr)
        .await
        .with_context(|| format!("bind {}", cfg.addr))?;
    serve_listener(listener, cfg, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    cfg: ServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let engine = Engine::new(cfg.db_path()).with_admin_key(cfg.admin_key.as_deref());
    let seeds = cfg.faction_seeds()?;
    let seeded = {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.ensure_factions(&seeds)).await??
    };
    tracing::info!(db = %engine.db_path().display(), seeded, "engine ready");

    let cancel = Arc::new(AtomicBool::new(false));
    let refresher = cfg
        .territory_interval()
        .map(|every| spawn_territory_refresher(engine.clone(), every, cancel.clone()));

    let app = build_router(AppState::new(engine, cfg.request_timeout()));
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    cancel.store(true, Ordering::Relaxed);
    if let Some(handle) = refresher {
        handle.abort();
    }
    Ok(addr)
}
