use crate::session::CloseReason;

use thiserror::Error;

/// Error taxonomy of the routing core. Variants are grouped by recovery
/// strategy rather than by subsystem: transient failures retry, routable
/// failures cost one backend connection, session-fatal failures close the
/// session with a reason the client can see.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Recovered by retrying on the same or an alternate backend.
    #[error("transient backend failure: {0}")]
    TransientBackend(#[from] std::io::Error),

    /// The router closes the offending backend connection only.
    #[error("backend {backend} returned an error: {message}")]
    RoutableFailure { backend: String, message: String },

    /// The session is closed with the given reason.
    #[error("session fatal: {}", .reason.phrase())]
    SessionFatal { reason: CloseReason },

    /// Treated as UNKNOWN, which routes to the master.
    #[error("could not classify statement")]
    ClassifierParseFailure,

    /// Logged and survived.
    #[error("cache book-keeping discrepancy: {0} bytes unaccounted for")]
    CacheBookkeeping(i64),

    /// New work is refused until pressure clears.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_to_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        let err: ProxyError = io.into();
        assert!(matches!(err, ProxyError::TransientBackend(_)));
    }

    #[test]
    fn session_fatal_carries_the_client_phrase() {
        let err = ProxyError::SessionFatal {
            reason: CloseReason::TooManyConnections,
        };
        assert!(err.to_string().contains("Too many connections"));
    }
}
