//! Unified error taxonomy for the scanning pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("transport error: {0}")]
    Transport(#[from] crate::http::TransportError),

    #[error("auth invalid: {0}")]
    AuthInvalid(String),

    #[error("rate limit pressure on endpoint {endpoint}")]
    RateLimited { endpoint: String },

    #[error("incomplete market data for candidate {0}")]
    DataIncomplete(String),

    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("cache i/o failure: {0}")]
    CacheIo(String),

    #[error("fatal: {0}")]
    Fatal(String),
}
