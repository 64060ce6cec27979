//! Upstream connection errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Wire(#[from] wire::WireError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timeout dialing {0}")]
    ConnectTimeout(String),

    #[error("invalid upstream host '{0}'")]
    InvalidHost(String),

    /// Per-request timer fired before a correlated response arrived.
    #[error("Request timeout ({payload_key}) clientMsgId={client_msg_id}")]
    Timeout {
        payload_key: String,
        client_msg_id: String,
    },

    /// The channel dropped while the request was pending.
    #[error("Disconnected")]
    Disconnected,

    #[error("shutting down")]
    ShuttingDown,

    #[error("application auth failed: {0}")]
    AppAuth(String),
}
