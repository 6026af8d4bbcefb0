use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the shared cache store.
///
/// These never reach a client: the cache adapter logs them and degrades to a
/// miss, a no-op write or a lost lock race.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache entry codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache store {0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

/// Failures on the client-facing request path.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("BACKEND_URL not set")]
    MissingBackend,
    #[error("invalid target url: {0}")]
    InvalidTarget(String),
    #[error("origin request failed: {0}")]
    Origin(#[from] hyper_util::client::legacy::Error),
    #[error("origin did not respond within {0:?}")]
    OriginTimeout(Duration),
    #[error("failed to read origin body: {0}")]
    Body(#[from] hyper::Error),
    #[error("failed to build origin request: {0}")]
    Http(#[from] http::Error),
}

impl ProxyError {
    /// Status code reported to the client when this error ends a request.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingBackend | ProxyError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::OriginTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Origin(_) | ProxyError::Body(_) => StatusCode::BAD_GATEWAY,
        }
    }
}
