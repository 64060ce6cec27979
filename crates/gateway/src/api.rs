//! HTTP API: routes, middleware, and the error envelope.
//!
//! Routes:
//! - GET  /health - liveness, exempt from the internal key check
//! - POST /oauth/exchange - OAuth code -> tokens, persisted encrypted
//! - POST /oauth/refresh - refresh grant using the stored refresh token
//! - GET  /accounts - trading accounts for the caller's access token
//! - POST /auth/account - authorize an account on the upstream channel
//! - GET  /symbols - search the symbol catalog (refreshing when empty)
//! - GET  /quote - subscribe and return the last/next spot quote
//! - GET  /account - trader details for the active account
//! - POST /trade - validate and submit an order
//!
//! Request bodies are never logged; they carry OAuth codes and tokens.

use crate::context::{RequestContext, RequestId, ENV_HEADER, INTERNAL_KEY_HEADER, REQUEST_ID_HEADER, USER_ID_HEADER};
use crate::error::GatewayError;
use crate::service::{
    AccountsResponse, AuthorizeAccountResponse, GatewayService, SymbolsResponse, TradeOutcome,
    TradeRequest,
};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use external_services::TokenResponse;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use upstream::Quote;
use uuid::Uuid;

const DEFAULT_SYMBOL_LIMIT: usize = 200;
const MAX_SYMBOL_LIMIT: usize = 2000;

/// Application state shared across handlers.
pub struct AppState {
    pub service: GatewayService,
    pub internal_api_key: Option<String>,
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/oauth/exchange", post(oauth_exchange_handler))
        .route("/oauth/refresh", post(oauth_refresh_handler))
        .route("/accounts", get(accounts_handler))
        .route("/auth/account", post(authorize_account_handler))
        .route("/symbols", get(symbols_handler))
        .route("/quote", get(quote_handler))
        .route("/account", get(account_handler))
        .route("/trade", post(trade_handler))
        // Layers wrap outward: per request this runs request_id_mw, then
        // internal_key_mw, then context_mw. The key check must come before
        // context parsing so unauthenticated callers never reach it.
        .layer(middleware::from_fn(context_mw))
        .layer(middleware::from_fn_with_state(state.clone(), internal_key_mw))
        .layer(middleware::from_fn(request_id_mw))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Middleware
// ============================================================================

/// Assigns a request id, logs request metadata (never bodies), and echoes
/// the id on the response.
async fn request_id_mw(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user_id = header_str(&req, USER_ID_HEADER);
    let env = header_str(&req, ENV_HEADER);

    let mut response = next.run(req).await;

    info!(
        "{} {} {} reqId={} userId={} env={}",
        method,
        path,
        response.status().as_u16(),
        request_id,
        user_id.as_deref().unwrap_or("-"),
        env.as_deref().unwrap_or("-"),
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Extracts the caller context from headers before any handler runs.
async fn context_mw(mut req: Request, next: Next) -> Response {
    let request_id = request_id_of(&req);
    match RequestContext::from_headers(req.headers()) {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(err) => ApiError::new(err, &request_id).into_response(),
    }
}

/// Rejects requests without the configured internal key; /health stays open.
async fn internal_key_mw(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if let Some(expected) = &state.internal_api_key {
        if req.uri().path() != "/health" {
            let provided = req
                .headers()
                .get(INTERNAL_KEY_HEADER)
                .and_then(|v| v.to_str().ok());
            if provided != Some(expected.as_str()) {
                let request_id = request_id_of(&req);
                return ApiError::new(GatewayError::InternalAuth, &request_id).into_response();
            }
        }
    }
    next.run(req).await
}

fn request_id_of(req: &Request) -> RequestId {
    req.extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(|| RequestId("unknown".to_string()))
}

fn header_str(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ============================================================================
// Error envelope
// ============================================================================

/// Error response carrying `{error, details, requestId}` with the mapped
/// status. Server-side failures log at error, everything else at warn.
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(err: GatewayError, request_id: &RequestId) -> Self {
        let status = err.status();
        if status.is_server_error() {
            error!("request {} failed ({}): {}", request_id.0, status.as_u16(), err);
        } else {
            warn!("request {} rejected ({}): {}", request_id.0, status.as_u16(), err);
        }
        Self {
            status,
            body: json!({
                "error": err.to_string(),
                "details": err.details(),
                "requestId": request_id.0,
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthExchangeBody {
    user_id: Option<String>,
    code: Option<String>,
}

async fn oauth_exchange_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<OAuthExchangeBody>,
) -> Result<Json<TokenResponse>, ApiError> {
    let result = async {
        let ctx = ctx.with_user_override(body.user_id);
        let user_id = ctx.require_user()?;
        let code = body
            .code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| GatewayError::Validation("code is required".to_string()))?;
        state.service.oauth_exchange(user_id, code).await
    }
    .await;
    result.map(Json).map_err(|e| ApiError::new(e, &request_id))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct OAuthRefreshBody {
    user_id: Option<String>,
}

async fn oauth_refresh_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(ctx): Extension<RequestContext>,
    body: Option<Json<OAuthRefreshBody>>,
) -> Result<Json<TokenResponse>, ApiError> {
    let result = async {
        let body = body.map(|Json(b)| b).unwrap_or_default();
        let ctx = ctx.with_user_override(body.user_id);
        let user_id = ctx.require_user()?;
        state.service.oauth_refresh(user_id).await
    }
    .await;
    result.map(Json).map_err(|e| ApiError::new(e, &request_id))
}

async fn accounts_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<AccountsResponse>, ApiError> {
    state
        .service
        .list_accounts(&ctx)
        .await
        .map(Json)
        .map_err(|e| ApiError::new(e, &request_id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountBody {
    user_id: Option<String>,
    account_id: Option<i64>,
}

async fn authorize_account_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<AuthorizeAccountBody>,
) -> Result<Json<AuthorizeAccountResponse>, ApiError> {
    let result = async {
        let ctx = ctx.with_user_override(body.user_id);
        let account_id = body.account_id.ok_or_else(|| {
            GatewayError::Validation("accountId must be a positive integer".to_string())
        })?;
        state.service.authorize_account(&ctx, account_id).await
    }
    .await;
    result.map(Json).map_err(|e| ApiError::new(e, &request_id))
}

#[derive(Debug, Deserialize)]
struct SymbolsQuery {
    q: Option<String>,
    limit: Option<usize>,
}

async fn symbols_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(ctx): Extension<RequestContext>,
    Query(params): Query<SymbolsQuery>,
) -> Result<Json<SymbolsResponse>, ApiError> {
    let result = async {
        let limit = params.limit.unwrap_or(DEFAULT_SYMBOL_LIMIT);
        if limit < 1 || limit > MAX_SYMBOL_LIMIT {
            return Err(GatewayError::Validation(format!(
                "limit must be between 1 and {MAX_SYMBOL_LIMIT}"
            )));
        }
        state
            .service
            .list_symbols(&ctx, params.q.as_deref().unwrap_or(""), limit)
            .await
    }
    .await;
    result.map(Json).map_err(|e| ApiError::new(e, &request_id))
}

#[derive(Debug, Deserialize)]
struct QuoteQuery {
    symbol: Option<String>,
    wait: Option<f64>,
}

async fn quote_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(ctx): Extension<RequestContext>,
    Query(params): Query<QuoteQuery>,
) -> Result<Json<Quote>, ApiError> {
    let result = async {
        let symbol = params
            .symbol
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Validation("symbol is required".to_string()))?;
        let wait = params.wait.unwrap_or(0.0);
        if !wait.is_finite() {
            return Err(GatewayError::Validation("wait must be a number of seconds".to_string()));
        }
        state.service.get_quote(&ctx, symbol, wait).await
    }
    .await;
    result.map(Json).map_err(|e| ApiError::new(e, &request_id))
}

async fn account_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .get_account_info(&ctx)
        .await
        .map(Json)
        .map_err(|e| ApiError::new(e, &request_id))
}

async fn trade_handler(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Extension(ctx): Extension<RequestContext>,
    Json(trade): Json<TradeRequest>,
) -> Result<Json<TradeOutcome>, ApiError> {
    let result = async {
        let ctx = ctx.with_user_override(trade.user_id.clone());
        state.service.place_trade(&ctx, trade).await
    }
    .await;
    result.map(Json).map_err(|e| ApiError::new(e, &request_id))
}
