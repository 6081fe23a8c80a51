//! Centralized error types for the session relay core library.
//!
//! Per the error taxonomy this crate follows, only *core-fatal* and
//! *session-fatal* conditions become a [`RelayError`]. Transient packet
//! conditions (malformed, duplicate, late, unknown session, endpoint
//! mismatch) and session-scoped conditions (memory pressure, format
//! mismatch) are not represented here at all - they are counters on
//! [`crate::session::SessionStats`], since callers are never meant to
//! handle them as exceptional.

use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across
/// different logging and reporting paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for structured logs.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the session relay core library.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The UDP socket could not be bound (core-fatal).
    #[error("failed to bind UDP socket on {addr}: {source}")]
    SocketBind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Configuration failed validation at startup (core-fatal).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A negotiator operation referenced a session id that isn't registered.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A session id failed the `[A-Za-z0-9_-]{1,128}` validity check.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// The sink refused delivery `N` times in a row; the session is
    /// being moved to Draining with reason ERROR (session-fatal).
    #[error("sink for session {session_id} failed {consecutive_failures} times in a row")]
    SinkExhausted {
        session_id: String,
        consecutive_failures: u32,
    },

    /// An unexpected I/O failure surfaced from the receiver task.
    #[error("receiver I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorCode for RelayError {
    fn code(&self) -> &'static str {
        match self {
            Self::SocketBind { .. } => "socket_bind_failed",
            Self::InvalidConfig(_) => "invalid_config",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidSessionId(_) => "invalid_session_id",
            Self::SinkExhausted { .. } => "sink_exhausted",
            Self::Io(_) => "io_error",
        }
    }
}

impl RelayError {
    /// Returns whether this error is specific to one session (vs. core-fatal).
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_) | Self::InvalidSessionId(_) | Self::SinkExhausted { .. }
        )
    }
}

/// Convenient Result alias for library-wide operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_exhausted_is_session_scoped() {
        let err = RelayError::SinkExhausted {
            session_id: "abc".into(),
            consecutive_failures: 5,
        };
        assert!(err.is_session_scoped());
        assert_eq!(err.code(), "sink_exhausted");
    }

    #[test]
    fn socket_bind_is_not_session_scoped() {
        let err = RelayError::SocketBind {
            addr: "0.0.0.0:8001".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(!err.is_session_scoped());
        assert_eq!(err.code(), "socket_bind_failed");
    }
}
