//! Error taxonomy for every outbound call.
//!
//! Library functions return [`HarvestError`]; the CLI wraps it in
//! `anyhow` with context. Use [`HarvestError::kind`] to branch on the
//! failure class without matching every variant.

use std::time::Duration;

use thiserror::Error;

/// Coarse failure class, used for reporting and exit decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or expired credential. Fatal before any fetch.
    Auth,
    /// Rate limit, 5xx, or network failure. Retried.
    Transient,
    /// Retry budget exhausted on a transient failure.
    Aborted,
    /// The API answered but reported a failure (`ok: false`, 4xx).
    ApiLogic,
    /// Object storage or local file write failure.
    Storage,
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transient HTTP failure on {endpoint}: {detail}")]
    TransientHttp {
        endpoint: String,
        status: Option<u16>,
        detail: String,
    },

    #[error("{endpoint} aborted after {attempts} attempts: {last}")]
    FetchAborted {
        endpoint: String,
        attempts: u32,
        last: String,
    },

    #[error("{endpoint} returned an error: {detail}")]
    ApiLogic { endpoint: String, detail: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::Auth(_) => ErrorKind::Auth,
            HarvestError::TransientHttp { .. } => ErrorKind::Transient,
            HarvestError::FetchAborted { .. } => ErrorKind::Aborted,
            HarvestError::ApiLogic { .. } => ErrorKind::ApiLogic,
            HarvestError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn api(endpoint: &str, detail: impl Into<String>) -> Self {
        HarvestError::ApiLogic {
            endpoint: endpoint.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn storage(detail: impl Into<String>) -> Self {
        HarvestError::Storage(detail.into())
    }
}

/// What one attempt produced, as seen by the retry policy.
#[derive(Debug)]
pub(crate) enum AttemptFailure {
    /// HTTP 429 with the server's wait hint.
    RateLimited { retry_after: Duration },
    /// Any other retryable failure.
    Retryable(HarvestError),
    /// Failure that must not be retried.
    Fatal(HarvestError),
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_one_to_one() {
        assert_eq!(HarvestError::Auth("x".into()).kind(), ErrorKind::Auth);
        assert_eq!(
            HarvestError::api("conversations.history", "channel_not_found").kind(),
            ErrorKind::ApiLogic
        );
        assert_eq!(HarvestError::storage("no creds").kind(), ErrorKind::Storage);
        let aborted = HarvestError::FetchAborted {
            endpoint: "conversations.history".into(),
            attempts: 3,
            last: "HTTP 503".into(),
        };
        assert_eq!(aborted.kind(), ErrorKind::Aborted);
        assert_eq!(
            aborted.to_string(),
            "conversations.history aborted after 3 attempts: HTTP 503"
        );
    }
}
