//! Error types for the proxy.

use std::net::SocketAddr;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] allowgate_storage::StorageError),

    /// Failed to bind the listening socket.
    #[error("failed to bind to {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    /// The client sent something that is not an HTTP/1 request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request head exceeded the size limit.
    #[error("request head larger than {0} bytes")]
    HeadTooLarge(usize),

    /// The upstream HTTP client could not be built or the request failed.
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
