//! Gateway error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use serde_json::Value;
use thiserror::Error;
use upstream::{QuoteBusError, UpstreamError};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad request parameters or body.
    #[error("{0}")]
    Validation(String),

    /// Missing credentials or account selection, with guidance.
    #[error("{0}")]
    AuthMissing(String),

    #[error("internal API key mismatch")]
    InternalAuth,

    #[error("{0}")]
    NotFound(String),

    /// The venue answered with an error frame; its description is
    /// forwarded verbatim.
    #[error("{description}")]
    Upstream {
        error_code: Option<String>,
        description: String,
    },

    #[error(transparent)]
    Connection(#[from] UpstreamError),

    #[error(transparent)]
    Quotes(#[from] QuoteBusError),

    #[error(transparent)]
    Store(#[from] external_services::Error),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) | GatewayError::AuthMissing(_) => StatusCode::BAD_REQUEST,
            GatewayError::InternalAuth => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Connection(err) => match err {
                UpstreamError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                UpstreamError::Disconnected | UpstreamError::ShuttingDown => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::BAD_GATEWAY,
            },
            GatewayError::Quotes(err) => match err {
                QuoteBusError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                QuoteBusError::TooManyWaiters => StatusCode::TOO_MANY_REQUESTS,
                QuoteBusError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            },
            GatewayError::Store(err) => match err {
                external_services::Error::OAuthRejected { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured detail included in the error body, when there is any.
    pub fn details(&self) -> Option<Value> {
        match self {
            GatewayError::Upstream {
                error_code: Some(code),
                ..
            } => Some(serde_json::json!({ "errorCode": code })),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
