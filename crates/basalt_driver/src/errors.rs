//! Driver error taxonomy.
//!
//! Every failure surfaces as a typed error. Per-attempt errors are aggregated
//! into [`NoHostAvailable`] in attempt order when the whole host plan is
//! exhausted; fatal server responses are rethrown directly.

use std::net::SocketAddr;
use std::time::Duration;

use basalt_proto::messages::{ErrorCode, ErrorDetails};
use thiserror::Error;

/// Codec registry lookup and conversion failures.
#[derive(Clone, Debug, Error)]
pub enum CodecError {
    #[error("codec not found for requested operation: [{cql} <-> {rust}]")]
    NotFound { cql: String, rust: String },
    #[error("codec for {cql} cannot handle {kind} value")]
    ValueMismatch { cql: String, kind: &'static str },
    #[error("malformed {cql} cell: {detail}")]
    BadCell { cql: String, detail: String },
    #[error("cannot parse {literal:?} as {cql}: {detail}")]
    BadLiteral {
        cql: String,
        literal: String,
        detail: String,
    },
    #[error("cannot format value as a {cql} literal: {detail}")]
    Unformattable { cql: String, detail: String },
}

/// A connection-level failure; completes every pending request on the
/// connection so the request handler can move to another host.
#[derive(Clone, Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error on connection to {address}: {detail}")]
    Io { address: SocketAddr, detail: String },
    #[error("connection to {address} is closed")]
    Closed { address: SocketAddr },
    #[error("wire protocol violation on {address}: {detail}")]
    Wire { address: SocketAddr, detail: String },
    #[error("heartbeat to {address} failed")]
    HeartbeatFailed { address: SocketAddr },
    #[error("connection to {address} was not established: {detail}")]
    ConnectFailed { address: SocketAddr, detail: String },
}

impl ConnectionError {
    pub fn address(&self) -> SocketAddr {
        match self {
            ConnectionError::Io { address, .. }
            | ConnectionError::Closed { address }
            | ConnectionError::Wire { address, .. }
            | ConnectionError::HeartbeatFailed { address }
            | ConnectionError::ConnectFailed { address, .. } => *address,
        }
    }
}

/// An ERROR response tied to the host that produced it.
#[derive(Clone, Debug, Error)]
#[error("{code:?} from {address}: {message}")]
pub struct ServerException {
    pub address: SocketAddr,
    pub code: ErrorCode,
    pub message: String,
    pub details: ErrorDetails,
}

impl ServerException {
    /// Fatal errors abort the request instead of moving to another host.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::AuthenticationError
                | ErrorCode::SyntaxError
                | ErrorCode::Unauthorized
                | ErrorCode::InvalidQuery
                | ErrorCode::AlreadyExists
                | ErrorCode::ConfigError
        )
    }
}

/// What went wrong on one host during one attempt.
#[derive(Clone, Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("all connections to {address} are at capacity and the waiter queue is full")]
    BusyPool { address: SocketAddr },
    #[error("no free stream id on the borrowed connection to {address}")]
    BusyConnection { address: SocketAddr },
    #[error("no active connection pool for {address}")]
    NoPool { address: SocketAddr },
    #[error(transparent)]
    Server(#[from] ServerException),
    #[error("attempt on {address} timed out")]
    Timeout { address: SocketAddr },
}

/// Aggregate of per-host failures, in the order hosts were attempted.
#[derive(Clone, Debug, Default)]
pub struct NoHostAvailable {
    pub errors: Vec<(SocketAddr, AttemptError)>,
}

impl std::error::Error for NoHostAvailable {}

impl std::fmt::Display for NoHostAvailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.errors.is_empty() {
            return f.write_str("no host was tried (empty query plan)");
        }
        write!(f, "all {} attempted hosts failed:", self.errors.len())?;
        for (address, error) in &self.errors {
            write!(f, " [{address}: {error}]")?;
        }
        Ok(())
    }
}

/// Top-level error returned by session and cluster entry points.
#[derive(Clone, Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailable),
    #[error(transparent)]
    Server(#[from] ServerException),
    #[error("authentication to {address} failed: {message}")]
    Authentication { address: SocketAddr, message: String },
    #[error("cannot negotiate a protocol version with {address}: {detail}")]
    InvalidProtocolVersion { address: SocketAddr, detail: String },
    #[error("request did not complete within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("request was cancelled")]
    Cancelled,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("cluster is shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_host_available_preserves_attempt_order() {
        let a: SocketAddr = "10.0.0.1:9042".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:9042".parse().unwrap();
        let aggregate = NoHostAvailable {
            errors: vec![
                (a, AttemptError::BusyPool { address: a }),
                (
                    b,
                    AttemptError::Connection(ConnectionError::Closed { address: b }),
                ),
            ],
        };
        let rendered = aggregate.to_string();
        assert!(rendered.contains("2 attempted hosts"));
        assert!(rendered.find("10.0.0.1").unwrap() < rendered.find("10.0.0.2").unwrap());
    }

    #[test]
    fn fatal_classification_matches_propagation_policy() {
        let addr: SocketAddr = "10.0.0.1:9042".parse().unwrap();
        let fatal = ServerException {
            address: addr,
            code: ErrorCode::SyntaxError,
            message: "boom".into(),
            details: ErrorDetails::None,
        };
        assert!(fatal.is_fatal());
        let retryable = ServerException {
            address: addr,
            code: ErrorCode::Overloaded,
            message: "busy".into(),
            details: ErrorDetails::None,
        };
        assert!(!retryable.is_fatal());
    }
}
