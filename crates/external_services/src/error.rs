//! Error types for external services.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("token endpoint returned status {status}: {body}")]
    OAuthRejected { status: u16, body: String },

    #[error("token endpoint response carried no access token")]
    OAuthMalformed,

    #[error("invalid encryption key: {0}")]
    InvalidKey(&'static str),

    #[error("encryption failed")]
    Encrypt,

    #[error("ciphertext is not valid base64: {0}")]
    CiphertextEncoding(#[from] base64::DecodeError),

    #[error("ciphertext shorter than iv+tag")]
    CiphertextTooShort,

    #[error("ciphertext authentication failed")]
    Decrypt,
}

pub type Result<T> = std::result::Result<T, Error>;
