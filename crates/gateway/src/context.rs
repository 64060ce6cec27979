//! Per-request context extracted from headers.

use crate::error::{GatewayError, Result};
use axum::http::HeaderMap;
use common::Environment;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ENV_HEADER: &str = "x-ctrader-env";
pub const TOKEN_HEADER: &str = "x-ctrader-access-token";
pub const INTERNAL_KEY_HEADER: &str = "x-internal-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Caller identity and overrides. Absent optional headers stay `None`.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub env: Option<Environment>,
    pub token_override: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let env = match header_value(headers, ENV_HEADER) {
            Some(raw) => Some(raw.parse::<Environment>().map_err(|e| {
                GatewayError::Validation(format!("invalid {ENV_HEADER}: {e}"))
            })?),
            None => None,
        };
        Ok(Self {
            user_id: header_value(headers, USER_ID_HEADER),
            env,
            token_override: header_value(headers, TOKEN_HEADER),
        })
    }

    /// Bodies may name the user explicitly; that wins over the header.
    pub fn with_user_override(mut self, user_id: Option<String>) -> Self {
        if let Some(user) = user_id.filter(|u| !u.trim().is_empty()) {
            self.user_id = Some(user);
        }
        self
    }

    pub fn require_user(&self) -> Result<&str> {
        self.user_id
            .as_deref()
            .ok_or_else(|| GatewayError::AuthMissing(format!("Missing {USER_ID_HEADER} header")))
    }
}

/// Request id assigned by middleware, echoed in the response header and
/// every error body.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_full_context() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u1"));
        headers.insert(ENV_HEADER, HeaderValue::from_static("live"));
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("tok"));
        let ctx = RequestContext::from_headers(&headers).unwrap();
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert_eq!(ctx.env, Some(Environment::Live));
        assert_eq!(ctx.token_override.as_deref(), Some("tok"));
    }

    #[test]
    fn test_absent_headers_stay_none() {
        let ctx = RequestContext::from_headers(&HeaderMap::new()).unwrap();
        assert!(ctx.user_id.is_none());
        assert!(ctx.env.is_none());
        assert!(ctx.token_override.is_none());
        assert!(ctx.require_user().is_err());
    }

    #[test]
    fn test_invalid_env_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(ENV_HEADER, HeaderValue::from_static("staging"));
        assert!(matches!(
            RequestContext::from_headers(&headers),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_body_user_override_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("header-user"));
        let ctx = RequestContext::from_headers(&headers)
            .unwrap()
            .with_user_override(Some("body-user".to_string()));
        assert_eq!(ctx.require_user().unwrap(), "body-user");
        // Empty body value does not clobber the header.
        let ctx = ctx.with_user_override(Some("  ".to_string()));
        assert_eq!(ctx.require_user().unwrap(), "body-user");
    }
}
