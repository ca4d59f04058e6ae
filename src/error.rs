//! Transport error taxonomy.
//!
//! Every failure surfaced on a completion handle or from a facade call is
//! one of these variants. Internal plumbing uses `anyhow` and converts at
//! the public boundary via the `Unexpected` variant.

use thiserror::Error;

/// Errors surfaced by the transport to callers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed frames or a signature that does not verify. Inbound
    /// occurrences are dropped with a log line and never reach the
    /// application; outbound occurrences fail the request.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The remote peer's protocol version was rejected by the
    /// compatibility gate.
    #[error("peer runs an incompatible protocol version")]
    DifferentVersion,

    /// The per-request deadline elapsed during send or receive.
    #[error("request timed out")]
    Timeout,

    /// The caller went away or the transport shut down before the
    /// request completed. Never logged as an error.
    #[error("request cancelled")]
    Cancelled,

    /// `start` was invoked on a transport that is not in the `New` state.
    #[error("transport already running")]
    AlreadyRunning,

    /// The transport was disposed; the instance is single-use.
    #[error("transport disposed")]
    Disposed,

    /// Anything else. Outbound requests hitting this are retried up to
    /// the retry budget before the final failure is surfaced.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl TransportError {
    /// Whether a worker may requeue the request after this failure.
    pub(crate) fn is_retryable_kind(&self) -> bool {
        matches!(self, TransportError::Unexpected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Unexpected(anyhow::anyhow!("boom")).is_retryable_kind());
        assert!(!TransportError::Timeout.is_retryable_kind());
        assert!(!TransportError::DifferentVersion.is_retryable_kind());
        assert!(!TransportError::Cancelled.is_retryable_kind());
    }
}
