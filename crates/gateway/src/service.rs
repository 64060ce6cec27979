//! Gateway orchestration.
//!
//! Every public operation resolves its environment, access token, active
//! account, and symbol id per request, re-authorizes the account on the
//! upstream channel on demand, and talks to the venue through the shared
//! connection handle.

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use common::Environment;
use external_services::{
    OAuthClient, SessionPatch, SessionStore, SymbolEntry, SymbolStore, TokenResponse,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use upstream::{
    Quote, QuoteBus, QuoteKey, SpotRoute, SubscriptionIndex, UpstreamHandle, UpstreamResponse,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const TRADE_TIMEOUT: Duration = Duration::from_secs(15);
const SYMBOLS_TIMEOUT: Duration = Duration::from_secs(20);

const TRADE_SIDES: &[&str] = &["BUY", "SELL"];
const ORDER_TYPES: &[&str] = &["MARKET", "LIMIT", "STOP", "STOP_LIMIT"];

/// Order submission request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub user_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub order_type: Option<String>,
    pub volume_units: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub relative_stop_loss: Option<i64>,
    pub relative_take_profit: Option<i64>,
    pub comment: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountsResponse {
    pub count: usize,
    pub items: Vec<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeAccountResponse {
    pub authorized: bool,
    pub active_account_id: i64,
    pub response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolsResponse {
    pub active_account_id: i64,
    pub count: usize,
    pub items: Vec<SymbolEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOutcome {
    pub request: Value,
    pub response: Value,
}

/// Process-wide orchestrator. Owns nothing upstream: it holds references
/// to the single connection, the quote bus, both stores, and the
/// subscription index.
#[derive(Clone)]
pub struct GatewayService {
    upstream: UpstreamHandle,
    quotes: Arc<QuoteBus>,
    subscriptions: Arc<SubscriptionIndex>,
    sessions: SessionStore,
    symbols: SymbolStore,
    oauth: OAuthClient,
}

impl GatewayService {
    pub fn new(
        upstream: UpstreamHandle,
        quotes: Arc<QuoteBus>,
        subscriptions: Arc<SubscriptionIndex>,
        sessions: SessionStore,
        symbols: SymbolStore,
        oauth: OAuthClient,
    ) -> Self {
        Self {
            upstream,
            quotes,
            subscriptions,
            sessions,
            symbols,
            oauth,
        }
    }

    // ========================================================================
    // Resolution helpers
    // ========================================================================

    /// Header override, then session, then demo.
    pub async fn resolve_env(
        &self,
        user_id: &str,
        override_env: Option<Environment>,
    ) -> Result<Environment> {
        if let Some(env) = override_env {
            return Ok(env);
        }
        Ok(self
            .sessions
            .load_session(user_id)
            .await?
            .and_then(|s| s.env)
            .unwrap_or_default())
    }

    async fn resolve_access_token(
        &self,
        user_id: &str,
        token_override: Option<&str>,
    ) -> Result<String> {
        if let Some(token) = token_override {
            return Ok(token.to_string());
        }
        self.sessions.access_token(user_id).await?.ok_or_else(|| {
            GatewayError::AuthMissing(
                "No access token for user; exchange an OAuth code via POST /oauth/exchange first"
                    .to_string(),
            )
        })
    }

    async fn resolve_account_id(&self, user_id: &str, override_id: Option<i64>) -> Result<i64> {
        if let Some(id) = override_id.filter(|id| *id > 0) {
            return Ok(id);
        }
        self.sessions
            .load_session(user_id)
            .await?
            .and_then(|s| s.active_account_id)
            .ok_or_else(|| {
                GatewayError::AuthMissing(
                    "No active account; authorize one via POST /auth/account first".to_string(),
                )
            })
    }

    fn upstream_error(response: &UpstreamResponse) -> Option<GatewayError> {
        if !response.payload_name.ends_with("ERROR_RES") {
            return None;
        }
        Some(GatewayError::Upstream {
            error_code: response
                .decoded
                .get("errorCode")
                .and_then(Value::as_str)
                .map(str::to_string),
            description: response
                .decoded
                .get("description")
                .and_then(Value::as_str)
                .or_else(|| response.decoded.get("errorCode").and_then(Value::as_str))
                .unwrap_or("upstream error")
                .to_string(),
        })
    }

    fn expect_ok(response: UpstreamResponse) -> Result<UpstreamResponse> {
        match Self::upstream_error(&response) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    /// Account auth is per-channel state upstream; re-authorizing an
    /// already-authorized account reports an error frame that we treat as
    /// success.
    pub async fn ensure_account_authorized(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        token_override: Option<&str>,
    ) -> Result<UpstreamResponse> {
        let access_token = self.resolve_access_token(user_id, token_override).await?;
        let response = self
            .upstream
            .send(
                "PROTO_OA_ACCOUNT_AUTH_REQ",
                json!({
                    "ctidTraderAccountId": account_id,
                    "accessToken": access_token,
                }),
                DEFAULT_TIMEOUT,
                Some(env),
            )
            .await?;

        if let Some(err) = Self::upstream_error(&response) {
            if err
                .to_string()
                .to_lowercase()
                .contains("already authorized")
            {
                debug!("account {} already authorized on channel", account_id);
                return Ok(response);
            }
            return Err(err);
        }
        Ok(response)
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    pub async fn list_accounts(&self, ctx: &RequestContext) -> Result<AccountsResponse> {
        let user_id = ctx.require_user()?;
        let env = self.resolve_env(user_id, ctx.env).await?;
        let access_token = self
            .resolve_access_token(user_id, ctx.token_override.as_deref())
            .await?;

        let response = Self::expect_ok(
            self.upstream
                .send(
                    "PROTO_OA_GET_ACCOUNT_LIST_BY_ACCESS_TOKEN_REQ",
                    json!({ "accessToken": access_token }),
                    DEFAULT_TIMEOUT,
                    Some(env),
                )
                .await?,
        )?;

        let items = response
            .decoded
            .get("ctidTraderAccount")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(AccountsResponse {
            count: items.len(),
            items,
        })
    }

    pub async fn authorize_account(
        &self,
        ctx: &RequestContext,
        account_id: i64,
    ) -> Result<AuthorizeAccountResponse> {
        if account_id <= 0 {
            return Err(GatewayError::Validation(
                "accountId must be a positive integer".to_string(),
            ));
        }
        let user_id = ctx.require_user()?;
        let env = self.resolve_env(user_id, ctx.env).await?;
        let response = self
            .ensure_account_authorized(user_id, env, account_id, ctx.token_override.as_deref())
            .await?;

        self.sessions
            .patch_session(
                user_id,
                SessionPatch {
                    env: Some(env),
                    active_account_id: Some(account_id),
                    ..Default::default()
                },
                None,
            )
            .await?;
        info!("account {} authorized for user {} on {}", account_id, user_id, env);

        Ok(AuthorizeAccountResponse {
            authorized: true,
            active_account_id: account_id,
            response: response.decoded,
        })
    }

    pub async fn list_symbols(
        &self,
        ctx: &RequestContext,
        query: &str,
        limit: usize,
    ) -> Result<SymbolsResponse> {
        let user_id = ctx.require_user()?;
        let env = self.resolve_env(user_id, ctx.env).await?;
        let account_id = self.resolve_account_id(user_id, None).await?;
        self.ensure_account_authorized(user_id, env, account_id, ctx.token_override.as_deref())
            .await?;

        if self.symbols.count(user_id, env, account_id).await? == 0 {
            self.refresh_symbols(user_id, env, account_id, ctx.token_override.as_deref())
                .await?;
        }

        let items = self
            .symbols
            .search(user_id, env, account_id, query, limit)
            .await?;
        Ok(SymbolsResponse {
            active_account_id: account_id,
            count: items.len(),
            items,
        })
    }

    /// Pull the full symbol list from the venue and atomically replace the
    /// persisted catalog.
    pub async fn refresh_symbols(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        token_override: Option<&str>,
    ) -> Result<usize> {
        self.ensure_account_authorized(user_id, env, account_id, token_override)
            .await?;

        let response = Self::expect_ok(
            self.upstream
                .send(
                    "PROTO_OA_SYMBOLS_LIST_REQ",
                    json!({
                        "ctidTraderAccountId": account_id,
                        "includeArchivedSymbols": false,
                    }),
                    SYMBOLS_TIMEOUT,
                    Some(env),
                )
                .await?,
        )?;

        let mut catalog: HashMap<String, i64> = HashMap::new();
        if let Some(symbols) = response.decoded.get("symbol").and_then(Value::as_array) {
            for symbol in symbols {
                let name = symbol.get("symbolName").and_then(Value::as_str);
                let id = symbol.get("symbolId").and_then(Value::as_i64);
                if let (Some(name), Some(id)) = (name, id) {
                    if id > 0 {
                        catalog.insert(name.to_uppercase(), id);
                    }
                }
            }
        }
        self.symbols
            .replace_all(user_id, env, account_id, &catalog)
            .await?;
        info!(
            "symbol catalog refreshed: {} symbols for account {} on {}",
            catalog.len(),
            account_id,
            env
        );
        Ok(catalog.len())
    }

    /// Local catalog lookup with a single refresh-and-retry on miss.
    pub async fn ensure_symbol_id(
        &self,
        user_id: &str,
        env: Environment,
        account_id: i64,
        symbol: &str,
        token_override: Option<&str>,
    ) -> Result<i64> {
        if let Some(id) = self
            .symbols
            .get_symbol_id(user_id, env, account_id, symbol)
            .await?
        {
            return Ok(id);
        }
        self.refresh_symbols(user_id, env, account_id, token_override)
            .await?;
        self.symbols
            .get_symbol_id(user_id, env, account_id, symbol)
            .await?
            .ok_or_else(|| {
                GatewayError::NotFound(format!("Symbol not found: {}", symbol.trim().to_uppercase()))
            })
    }

    pub async fn get_quote(
        &self,
        ctx: &RequestContext,
        symbol: &str,
        wait_secs: f64,
    ) -> Result<Quote> {
        let user_id = ctx.require_user()?;
        let env = self.resolve_env(user_id, ctx.env).await?;
        let account_id = self.resolve_account_id(user_id, None).await?;
        self.ensure_account_authorized(user_id, env, account_id, ctx.token_override.as_deref())
            .await?;
        let symbol_id = self
            .ensure_symbol_id(user_id, env, account_id, symbol, ctx.token_override.as_deref())
            .await?;

        // Register the owner before subscribing so the first tick can be
        // attributed.
        self.subscriptions.register(
            account_id,
            symbol_id,
            SpotRoute {
                user_id: user_id.to_string(),
                env,
                account_id,
            },
        );
        Self::expect_ok(
            self.upstream
                .send(
                    "PROTO_OA_SUBSCRIBE_SPOTS_REQ",
                    json!({
                        "ctidTraderAccountId": account_id,
                        "symbolId": [symbol_id],
                        "subscribeToSpotTimestamp": true,
                    }),
                    DEFAULT_TIMEOUT,
                    Some(env),
                )
                .await?,
        )?;

        let key = QuoteKey {
            user_id: user_id.to_string(),
            env,
            account_id,
            symbol_id,
        };
        if wait_secs <= 0.0 {
            return self
                .quotes
                .get_last(&key)
                .ok_or_else(|| GatewayError::NotFound("No quote received yet".to_string()));
        }
        counter!("gateway_quote_waits_total").increment(1);
        let quote = self
            .quotes
            .wait_for_next(&key, Duration::from_secs_f64(wait_secs))
            .await
            .inspect_err(|e| {
                if matches!(e, upstream::QuoteBusError::Timeout) {
                    counter!("gateway_quote_wait_timeouts_total").increment(1);
                }
            })?;
        Ok(quote)
    }

    pub async fn get_account_info(&self, ctx: &RequestContext) -> Result<Value> {
        let user_id = ctx.require_user()?;
        let env = self.resolve_env(user_id, ctx.env).await?;
        let account_id = self.resolve_account_id(user_id, None).await?;
        self.ensure_account_authorized(user_id, env, account_id, ctx.token_override.as_deref())
            .await?;

        let response = Self::expect_ok(
            self.upstream
                .send(
                    "PROTO_OA_TRADER_REQ",
                    json!({ "ctidTraderAccountId": account_id }),
                    DEFAULT_TIMEOUT,
                    Some(env),
                )
                .await?,
        )?;
        Ok(response.decoded)
    }

    pub async fn place_trade(
        &self,
        ctx: &RequestContext,
        trade: TradeRequest,
    ) -> Result<TradeOutcome> {
        let user_id = ctx.require_user()?;
        let env = self.resolve_env(user_id, ctx.env).await?;
        let account_id = self.resolve_account_id(user_id, None).await?;
        self.ensure_account_authorized(user_id, env, account_id, ctx.token_override.as_deref())
            .await?;
        let symbol_id = self
            .ensure_symbol_id(
                user_id,
                env,
                account_id,
                &trade.symbol,
                ctx.token_override.as_deref(),
            )
            .await?;

        let order = build_order_payload(account_id, symbol_id, &trade)?;
        counter!("gateway_orders_submitted_total").increment(1);
        let response = Self::expect_ok(
            self.upstream
                .send("PROTO_OA_NEW_ORDER_REQ", order.clone(), TRADE_TIMEOUT, Some(env))
                .await?,
        )?;
        info!(
            "order submitted for user {} account {} symbol {}",
            user_id, account_id, symbol_id
        );

        Ok(TradeOutcome {
            request: order,
            response: response.decoded,
        })
    }

    // ========================================================================
    // OAuth
    // ========================================================================

    pub async fn oauth_exchange(&self, user_id: &str, code: &str) -> Result<TokenResponse> {
        let tokens = self.oauth.exchange_code(code).await?;
        self.sessions
            .save_tokens(
                user_id,
                &tokens.access_token,
                tokens.refresh_token.as_deref(),
                tokens.expires_in,
            )
            .await?;
        info!("OAuth code exchanged for user {}", user_id);
        Ok(tokens)
    }

    pub async fn oauth_refresh(&self, user_id: &str) -> Result<TokenResponse> {
        let refresh_token = self.sessions.refresh_token(user_id).await?.ok_or_else(|| {
            GatewayError::AuthMissing(
                "No refresh token stored; exchange an OAuth code via POST /oauth/exchange first"
                    .to_string(),
            )
        })?;
        let tokens = self.oauth.refresh(&refresh_token).await?;
        self.sessions
            .save_tokens(
                user_id,
                &tokens.access_token,
                tokens.refresh_token.as_deref(),
                tokens.expires_in,
            )
            .await?;
        info!("access token refreshed for user {}", user_id);
        Ok(tokens)
    }
}

/// Validate a trade request and build the order payload.
///
/// Volume is scaled from units to the venue's centi-units. Absolute stop
/// loss / take profit are rejected on MARKET orders (only relative
/// distances are meaningful before the fill price is known).
fn build_order_payload(account_id: i64, symbol_id: i64, trade: &TradeRequest) -> Result<Value> {
    let side = trade.side.trim().to_uppercase();
    if !TRADE_SIDES.contains(&side.as_str()) {
        return Err(GatewayError::Validation(
            "side must be BUY or SELL".to_string(),
        ));
    }

    let order_type = trade
        .order_type
        .as_deref()
        .unwrap_or("MARKET")
        .trim()
        .to_uppercase();
    if !ORDER_TYPES.contains(&order_type.as_str()) {
        return Err(GatewayError::Validation(format!(
            "orderType must be one of {}",
            ORDER_TYPES.join(", ")
        )));
    }

    let volume = (trade.volume_units * 100.0).round() as i64;
    if volume <= 0 {
        return Err(GatewayError::Validation(
            "volumeUnits must scale to a positive volume".to_string(),
        ));
    }

    match order_type.as_str() {
        "LIMIT" if trade.limit_price.is_none() => {
            return Err(GatewayError::Validation(
                "limitPrice is required for LIMIT orders".to_string(),
            ));
        }
        "STOP" | "STOP_LIMIT" if trade.stop_price.is_none() => {
            return Err(GatewayError::Validation(format!(
                "stopPrice is required for {order_type} orders"
            )));
        }
        "MARKET" if trade.stop_loss.is_some() || trade.take_profit.is_some() => {
            return Err(GatewayError::Validation(
                "MARKET orders accept only relativeStopLoss/relativeTakeProfit distances"
                    .to_string(),
            ));
        }
        _ => {}
    }

    let mut order = json!({
        "ctidTraderAccountId": account_id,
        "symbolId": symbol_id,
        "orderType": order_type,
        "tradeSide": side,
        "volume": volume,
    });
    let fields = order.as_object_mut().ok_or_else(|| {
        GatewayError::Internal("order payload is not an object".to_string())
    })?;
    if let Some(price) = trade.limit_price {
        fields.insert("limitPrice".to_string(), json!(price));
    }
    if let Some(price) = trade.stop_price {
        fields.insert("stopPrice".to_string(), json!(price));
    }
    if let Some(price) = trade.stop_loss {
        fields.insert("stopLoss".to_string(), json!(price));
    }
    if let Some(price) = trade.take_profit {
        fields.insert("takeProfit".to_string(), json!(price));
    }
    if let Some(points) = trade.relative_stop_loss {
        fields.insert("relativeStopLoss".to_string(), json!(points));
    }
    if let Some(points) = trade.relative_take_profit {
        fields.insert("relativeTakeProfit".to_string(), json!(points));
    }
    if let Some(comment) = &trade.comment {
        fields.insert("comment".to_string(), json!(comment));
    }
    if let Some(label) = &trade.label {
        fields.insert("label".to_string(), json!(label));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(side: &str, order_type: Option<&str>, volume_units: f64) -> TradeRequest {
        TradeRequest {
            user_id: None,
            symbol: "EURUSD".to_string(),
            side: side.to_string(),
            order_type: order_type.map(str::to_string),
            volume_units,
            limit_price: None,
            stop_price: None,
            stop_loss: None,
            take_profit: None,
            relative_stop_loss: None,
            relative_take_profit: None,
            comment: None,
            label: None,
        }
    }

    #[test]
    fn test_market_order_payload() {
        let order = build_order_payload(42, 1, &trade("buy", None, 10.0)).unwrap();
        assert_eq!(order["ctidTraderAccountId"], 42);
        assert_eq!(order["symbolId"], 1);
        assert_eq!(order["tradeSide"], "BUY");
        assert_eq!(order["orderType"], "MARKET");
        assert_eq!(order["volume"], 1000);
        assert!(order.get("limitPrice").is_none());
    }

    #[test]
    fn test_volume_scaling_rounds() {
        let order = build_order_payload(1, 1, &trade("SELL", None, 0.015)).unwrap();
        assert_eq!(order["volume"], 2);
    }

    #[test]
    fn test_zero_volume_rejected() {
        assert!(matches!(
            build_order_payload(1, 1, &trade("BUY", None, 0.001)),
            Err(GatewayError::Validation(_))
        ));
        assert!(build_order_payload(1, 1, &trade("BUY", None, -5.0)).is_err());
    }

    #[test]
    fn test_invalid_side_rejected() {
        assert!(matches!(
            build_order_payload(1, 1, &trade("HOLD", None, 1.0)),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_order_type_rejected() {
        assert!(build_order_payload(1, 1, &trade("BUY", Some("ICEBERG"), 1.0)).is_err());
    }

    #[test]
    fn test_limit_requires_limit_price() {
        let mut request = trade("BUY", Some("LIMIT"), 1.0);
        assert!(build_order_payload(1, 1, &request).is_err());
        request.limit_price = Some(1.1);
        let order = build_order_payload(1, 1, &request).unwrap();
        assert_eq!(order["limitPrice"], 1.1);
    }

    #[test]
    fn test_stop_orders_require_stop_price() {
        for order_type in ["STOP", "STOP_LIMIT"] {
            let mut request = trade("SELL", Some(order_type), 1.0);
            assert!(build_order_payload(1, 1, &request).is_err());
            request.stop_price = Some(1.05);
            assert!(build_order_payload(1, 1, &request).is_ok());
        }
    }

    #[test]
    fn test_market_forbids_absolute_stops() {
        let mut request = trade("buy", Some("MARKET"), 10.0);
        request.stop_loss = Some(1.0);
        assert!(matches!(
            build_order_payload(1, 1, &request),
            Err(GatewayError::Validation(_))
        ));

        let mut request = trade("buy", None, 10.0);
        request.take_profit = Some(1.2);
        assert!(build_order_payload(1, 1, &request).is_err());

        // Relative distances are fine on MARKET orders.
        let mut request = trade("buy", None, 10.0);
        request.relative_stop_loss = Some(100);
        request.relative_take_profit = Some(200);
        let order = build_order_payload(1, 1, &request).unwrap();
        assert_eq!(order["relativeStopLoss"], 100);
        assert_eq!(order["relativeTakeProfit"], 200);
    }

    #[test]
    fn test_limit_allows_absolute_stops() {
        let mut request = trade("SELL", Some("LIMIT"), 2.0);
        request.limit_price = Some(1.2);
        request.stop_loss = Some(1.25);
        request.take_profit = Some(1.1);
        request.comment = Some("hedge".to_string());
        request.label = Some("bot-7".to_string());
        let order = build_order_payload(1, 1, &request).unwrap();
        assert_eq!(order["stopLoss"], 1.25);
        assert_eq!(order["takeProfit"], 1.1);
        assert_eq!(order["comment"], "hedge");
        assert_eq!(order["label"], "bot-7");
    }
}
