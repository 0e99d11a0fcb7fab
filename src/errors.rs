// =============================================================================
// Error taxonomy for the scanning engine
// =============================================================================
//
// Every fallible operation in the engine returns a `Result<_, EngineError>`
// (or an `anyhow::Result` at task-spawn boundaries). Callers branch on the
// kind: transient failures are retried locally, permanent ones tear down the
// connection, storage outages degrade the detectors to a no-alert mode.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Recoverable network failure (timeout, reset, DNS hiccup). Retried
    /// locally with backoff, never propagated past the owning component.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Unrecoverable network failure on a persistent connection. The owning
    /// connection is closed and re-established from scratch.
    #[error("permanent network error: {0}")]
    PermanentNetwork(String),

    /// The store cannot be reached. Consumers skip history-dependent work
    /// until it recovers; the feed keeps streaming.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Upstream sent something we cannot parse (bad JSON, bad numerics).
    /// The offending message is dropped with a warning.
    #[error("malformed upstream data: {0}")]
    Malformed(String),

    /// A stored or incoming row violates a data invariant (e.g. high < low).
    /// The row is skipped and counted, never fatal.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// A configuration value failed validation. The last-known-good value
    /// stays in effect.
    #[error("invalid config value for {field}: {reason}")]
    ConfigInvalid { field: String, reason: String },

    /// The venue is throttling us. Treated like a transient failure with a
    /// longer backoff.
    #[error("upstream rate limit: {0}")]
    UpstreamRateLimit(String),
}

impl EngineError {
    /// True for error kinds that a local retry loop is allowed to absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::UpstreamRateLimit(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::TransientNetwork(err.to_string())
        } else if err.status().is_some_and(|s| s.as_u16() == 429) {
            Self::UpstreamRateLimit(err.to_string())
        } else {
            Self::PermanentNetwork(err.to_string())
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::TransientNetwork("reset".into()).is_retryable());
        assert!(EngineError::UpstreamRateLimit("429".into()).is_retryable());
        assert!(!EngineError::PermanentNetwork("tls".into()).is_retryable());
        assert!(!EngineError::StorageUnavailable("down".into()).is_retryable());
        assert!(!EngineError::Malformed("bad json".into()).is_retryable());
    }

    #[test]
    fn config_invalid_message_names_the_field() {
        let err = EngineError::ConfigInvalid {
            field: "VOLUME_MULTIPLIER".into(),
            reason: "not a number".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("VOLUME_MULTIPLIER"));
        assert!(msg.contains("not a number"));
    }
}
