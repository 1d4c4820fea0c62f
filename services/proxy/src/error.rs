//! Error types for the proxy engine and backend clients.

use std::io;

use relayd_pool::PoolError;
use thiserror::Error;

/// Proxy errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No backend is available and the proxy is not elastic.
    #[error("pool_exhausted: no more available connections")]
    PoolExhausted,

    /// No backend is bound to the inbound connection.
    #[error("client_not_found: no backend bound to this connection")]
    ClientNotFound,

    /// The backend client is closed, or an elastic client was discarded.
    #[error("client_not_connected: backend client is not connected")]
    ClientNotConnected,

    /// Could not establish the backend connection.
    #[error("client_connect_failed: {0}")]
    ClientConnectFailed(#[source] io::Error),

    /// Could not send to the backend.
    #[error("client_send_failed: {0}")]
    ClientSendFailed(#[source] io::Error),

    /// Could not receive from the backend.
    #[error("client_receive_failed: {0}")]
    ClientReceiveFailed(#[source] io::Error),

    /// Could not submit the response to the inbound connection.
    #[error("server_send_failed: {0}")]
    ServerSendFailed(#[source] io::Error),

    /// Backend address could not be resolved.
    #[error("resolve_failed: {0}")]
    ResolveFailed(#[source] io::Error),

    /// Backend network type is not supported.
    #[error("network_not_supported: {0}")]
    NetworkNotSupported(String),

    /// A pool invariant was violated.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::PoolExhausted => "pool_exhausted",
            ProxyError::ClientNotFound => "client_not_found",
            ProxyError::ClientNotConnected => "client_not_connected",
            ProxyError::ClientConnectFailed(_) => "client_connect_failed",
            ProxyError::ClientSendFailed(_) => "client_send_failed",
            ProxyError::ClientReceiveFailed(_) => "client_receive_failed",
            ProxyError::ServerSendFailed(_) => "server_send_failed",
            ProxyError::ResolveFailed(_) => "resolve_failed",
            ProxyError::NetworkNotSupported(_) => "network_not_supported",
            ProxyError::Pool(_) => "pool_error",
        }
    }

    /// Returns true if the backend closed its end of the connection.
    pub fn is_eof(&self) -> bool {
        match self {
            ProxyError::ClientReceiveFailed(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
