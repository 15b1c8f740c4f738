//! Client error taxonomy.
//!
//! Transport failures, pool exhaustion and backend-reported conditions are
//! kept apart so callers can match on exactly the case they care about. All
//! variants are `Clone`: one connection failure is fanned out to every
//! request that was pending on it.

use rkv_common::{AppError, AppErrorKind};
use thiserror::Error;

/// Result type for the async client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Why an RPC connection stopped serving requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionFailure {
    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Closed,
    /// Read or write failed.
    #[error("connection reset: {0}")]
    Reset(String),
    /// The peer sent an undecodable frame or an unexpected reply.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A request did not complete within the request timeout.
    #[error("request timed out")]
    Timeout,
    /// The pool shut the connection down.
    #[error("connection shut down")]
    Shutdown,
}

/// Errors surfaced by the async client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Invalid input or configuration; never reaches the network.
    #[error("configuration error: {0}")]
    Config(String),
    /// No connection became available before the acquire deadline.
    #[error("timed out waiting for a connection ({population}/{max} connections)")]
    ResourceTimeout { population: usize, max: usize },
    /// A new connection could not be established.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    /// The connection carrying the request failed.
    #[error(transparent)]
    Connection(#[from] ConnectionFailure),
    /// The backend rejected the request.
    #[error("application error: {0}")]
    Application(#[from] AppError),
    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl ClientError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        ClientError::Config(message.into())
    }

    /// Returns true when repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::ResourceTimeout { .. } | ClientError::Connect { .. } => true,
            ClientError::Connection(failure) => *failure != ConnectionFailure::Shutdown,
            ClientError::Config(_) | ClientError::Application(_) | ClientError::PoolClosed => false,
        }
    }

    /// Backend error kind, if this is an application error.
    pub fn app_kind(&self) -> Option<AppErrorKind> {
        match self {
            ClientError::Application(err) => Some(err.kind),
            _ => None,
        }
    }
}
