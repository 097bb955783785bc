use crate::codex::{CodexBackend, CodexClient};
use crate::config::GatewayConfig;
use crate::credentials::{CredentialManager, GoogleTokenRefresher, RefreshOutcome};
use crate::error::{GatewayError, Result};
use crate::logging::{RequestStats, SharedLogger};
use crate::proxy::{self, ProxyBody, ProxyResult, RequestContext};
use crate::router::{ModelRouter, ProviderPolicy, RouteProtocol};
use crate::store::{JsonFileAccountStore, MemoryRouteStore, ModelRoute};
use crate::upstream::{CloudCodeClient, UpstreamClient};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub const ACCOUNT_HEADER: &str = "x-nexus-account";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
    pub credentials: Arc<CredentialManager>,
    pub router: Arc<ModelRouter>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub codex: Option<Arc<dyn CodexBackend>>,
}

impl AppState {
    /// Wire up the production collaborators from config.
    pub fn from_config(config: GatewayConfig, logger: SharedLogger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream.timeout_secs))
            .build()?;

        let accounts = Arc::new(JsonFileAccountStore::open(&config.credentials.accounts_file)?);
        let refresher = Arc::new(GoogleTokenRefresher::new(
            client.clone(),
            config.credentials.token_url.clone(),
            config.credentials.client_id.clone(),
            config.client_secret(),
        ));
        let credentials = Arc::new(CredentialManager::new(
            accounts,
            refresher,
            config.credentials.default_project_id.clone(),
            chrono::Duration::seconds(config.credentials.refresh_window_secs as i64),
        )?);

        let routes = Arc::new(MemoryRouteStore::seeded(config.routes.clone())?);
        let router = Arc::new(ModelRouter::new(
            routes,
            ProviderPolicy::new(&config.compat_providers),
        )?);

        let upstream: Arc<dyn UpstreamClient> =
            Arc::new(CloudCodeClient::with_client(client.clone(), &config.upstream));
        let codex = CodexClient::from_config(client.clone(), &config.codex, config.codex_auth_file())
            .map(|c| Arc::new(c) as Arc<dyn CodexBackend>);

        Ok(Self {
            config,
            client,
            logger,
            credentials,
            router,
            upstream,
            codex,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/anthropic/v1/messages", post(handle_messages))
        .route("/anthropic/v1/models", get(handle_anthropic_models))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/responses", post(handle_responses))
        .route("/v1/models", get(handle_models))
        .route("/v1/codex/quota", get(handle_codex_quota))
        .route("/genai/v1beta/models/:model_action", post(handle_genai))
        .route("/healthz", get(handle_health))
        .route("/api/request-logs", get(handle_request_logs))
        .route("/api/request-stats", get(handle_request_stats))
        .route("/api/events", get(handle_events))
        .route("/api/accounts", get(handle_accounts))
        .route("/api/accounts/reload", post(handle_reload_accounts))
        .route("/api/accounts/:id/refresh", post(handle_refresh_account))
        .route("/api/refresh", post(handle_refresh_all))
        .route("/api/model-routes", get(handle_list_routes).post(handle_create_route))
        .route(
            "/api/model-routes/:id",
            put(handle_update_route).delete(handle_delete_route),
        )
        .route("/api/providers/allowed", get(handle_allowed_providers))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };
    RequestContext {
        request_id: header(REQUEST_ID_HEADER).unwrap_or_else(|| format!("agent-{}", uuid::Uuid::new_v4())),
        account: header(ACCOUNT_HEADER),
    }
}

/// Turn a proxy outcome into an HTTP response.
fn render(result: ProxyResult, request_id: &str) -> Response {
    let ProxyResult {
        status,
        headers,
        body,
    } = result;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut response = match body {
        ProxyBody::Json(value) => (status, Json(value)).into_response(),
        ProxyBody::Sse(events) => {
            let events = events.map(|result| -> std::result::Result<Event, Infallible> {
                match result {
                    Ok(sse_event) => {
                        let event = Event::default().data(sse_event.data);
                        Ok(match sse_event.event {
                            Some(name) => event.event(name),
                            None => event,
                        })
                    }
                    Err(_) => Ok(Event::default().event("error").data("{}")),
                }
            });
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        ProxyBody::Relay { content_type, body } => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .header(CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
    };

    for (name, value) in headers {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn handle_messages(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let ctx = request_context(&headers);
    let result = proxy::anthropic_messages(&state, &ctx, &body).await;
    render(result, &ctx.request_id)
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let ctx = request_context(&headers);
    let result = proxy::chat_completions(&state, &ctx, &body).await;
    render(result, &ctx.request_id)
}

async fn handle_responses(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let ctx = request_context(&headers);
    let result = proxy::responses(&state, &ctx, &body).await;
    render(result, &ctx.request_id)
}

async fn handle_genai(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = request_context(&headers);
    let result = proxy::genai(&state, &ctx, &model_action, &body).await;
    render(result, &ctx.request_id)
}

async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let created = chrono::Utc::now().timestamp();
    let models: Vec<Value> = state
        .router
        .client_models()
        .into_iter()
        .map(|name| {
            let route = state.router.resolve(&name, &state.config.default_provider);
            json!({
                "id": name,
                "object": "model",
                "created": created,
                "owned_by": route.provider,
            })
        })
        .collect();

    Json(json!({ "data": models, "object": "list" }))
}

async fn handle_anthropic_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let created_at = chrono::Utc::now().to_rfc3339();
    let names = state.router.client_models();
    let models: Vec<Value> = names
        .iter()
        .map(|name| {
            json!({
                "type": "model",
                "id": name,
                "display_name": name,
                "created_at": created_at,
            })
        })
        .collect();

    Json(json!({
        "data": models,
        "has_more": false,
        "first_id": names.first(),
        "last_id": names.last(),
    }))
}

async fn handle_codex_quota(State(state): State<Arc<AppState>>) -> Response {
    let Some(codex) = state.codex.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Codex provider not initialized" })),
        )
            .into_response();
    };
    match codex.quota() {
        Ok(quota) => Json(quota).into_response(),
        Err(e) => admin_error(e),
    }
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

fn admin_error(e: GatewayError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn handle_request_logs(State(state): State<Arc<AppState>>, Query(query): Query<LogsQuery>) -> Json<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let logs = state.logger.recent(limit);
    Json(json!({ "count": logs.len(), "logs": logs }))
}

async fn handle_events(State(state): State<Arc<AppState>>, Query(query): Query<LogsQuery>) -> Json<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let events = state.logger.recent_events(limit);
    Json(json!({ "count": events.len(), "events": events }))
}

async fn handle_request_stats(State(state): State<Arc<AppState>>) -> Json<RequestStats> {
    Json(state.logger.stats())
}

async fn handle_accounts(State(state): State<Arc<AppState>>) -> Response {
    match state.credentials.accounts() {
        Ok(accounts) => Json(json!({ "accounts": accounts })).into_response(),
        Err(e) => admin_error(e),
    }
}

async fn handle_reload_accounts(State(state): State<Arc<AppState>>) -> Response {
    match state.credentials.reload() {
        Ok(()) => {
            let active = state.credentials.snapshot().len();
            state.logger.info("admin", format!("Credential cache reloaded, {} active", active));
            Json(json!({ "status": "reloaded", "active": active })).into_response()
        }
        Err(e) => admin_error(e),
    }
}

async fn handle_refresh_account(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.credentials.refresh(&id).await {
        Ok(RefreshOutcome::Refreshed(cred)) => {
            state.logger.info("admin", format!("Manual refresh succeeded for {}", cred.email));
            Json(json!({ "status": "refreshed", "account": cred })).into_response()
        }
        Ok(RefreshOutcome::Failed { kind, message }) => {
            state
                .logger
                .warn("admin", format!("Manual refresh failed for {}: {}", id, message));
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": message, "classification": kind })),
            )
                .into_response()
        }
        Err(e) => admin_error(e),
    }
}

async fn handle_refresh_all(State(state): State<Arc<AppState>>) -> Response {
    let credentials = state.credentials.clone();
    tokio::spawn(async move {
        match credentials.refresh_all().await {
            Ok(summary) => tracing::info!(?summary, "Manual refresh pass finished"),
            Err(e) => tracing::error!(error = %e, "Manual refresh pass failed"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response()
}

async fn handle_list_routes(State(state): State<Arc<AppState>>) -> Response {
    match state.router.list_routes() {
        Ok(routes) => Json(json!({ "routes": routes })).into_response(),
        Err(e) => admin_error(e),
    }
}

async fn handle_create_route(State(state): State<Arc<AppState>>, Json(route): Json<ModelRoute>) -> Response {
    match state.router.create_route(route) {
        Ok(created) => {
            state.logger.info(
                "admin",
                format!("Route created: {} -> {}/{}", created.client_model, created.target_provider, created.target_model),
            );
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(e) => admin_error(e),
    }
}

async fn handle_update_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(mut route): Json<ModelRoute>,
) -> Response {
    route.id = id;
    match state.router.update_route(route) {
        Ok(updated) => {
            state.logger.info("admin", format!("Route {} updated", id));
            Json(updated).into_response()
        }
        Err(e) => admin_error(e),
    }
}

async fn handle_delete_route(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Response {
    match state.router.delete_route(id) {
        Ok(()) => {
            state.logger.info("admin", format!("Route {} deleted", id));
            Json(json!({ "deleted": id })).into_response()
        }
        Err(e) => admin_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct AllowedQuery {
    client_model: Option<String>,
    protocol: Option<String>,
}

async fn handle_allowed_providers(State(state): State<Arc<AppState>>, Query(query): Query<AllowedQuery>) -> Response {
    let policy = state.router.policy();
    if let Some(protocol) = query.protocol.as_deref() {
        return match protocol.parse::<RouteProtocol>() {
            Ok(protocol) => Json(json!({
                "protocol": protocol.as_str(),
                "allowed": policy.allowed_providers_for_protocol(protocol),
            }))
            .into_response(),
            Err(e) => admin_error(e),
        };
    }
    let client_model = query.client_model.unwrap_or_default();
    Json(json!({
        "client_model": client_model,
        "allowed": policy.allowed_providers(&client_model),
    }))
    .into_response()
}
