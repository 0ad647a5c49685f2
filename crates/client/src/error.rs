//! Error types for the sync core.
//!
//! None of these reach presentation code: transport failures are retried
//! inside the session and only show up as a [`ConnectionState`].
//!
//! [`ConnectionState`]: crate::sync::ConnectionState

use billsync_shared::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("channel open timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("stream closed by server")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
