//! Error types for the trust engine

use thiserror::Error;

use crate::models::ObjectKind;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, TrustError>;

/// Errors raised while establishing trust in a reference.
///
/// "Not signed" and "no good signature" are not errors: the parser reports
/// them as `Ok(None)` and the verifier as an absent key id.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("Malformed {kind} object: {reason}")]
    MalformedObject { kind: ObjectKind, reason: String },

    #[error("{kind} object not found: {id}")]
    ObjectNotFound { kind: ObjectKind, id: String },

    #[error("Invalid reference: {value}")]
    InvalidReference { value: String },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Fetch from {remote} failed: {reason}")]
    Fetch { remote: String, reason: String },

    #[error("API request to {url} failed with status {status}: {body}")]
    Api { url: String, status: u16, body: String },

    #[error("Key download for {key_id} failed: {reason}")]
    KeyDownload { key_id: String, reason: String },

    #[error("Signature backend error: {reason}")]
    Backend { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TrustError {
    pub(crate) fn malformed(kind: ObjectKind, reason: impl Into<String>) -> Self {
        TrustError::MalformedObject {
            kind,
            reason: reason.into(),
        }
    }

    /// Whether the error came from discovering tags in a pull request's fork
    pub fn is_fork_discovery(&self) -> bool {
        matches!(
            self,
            TrustError::Fetch { .. } | TrustError::Api { .. } | TrustError::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrustError::malformed(ObjectKind::Commit, "missing message separator");
        assert_eq!(
            err.to_string(),
            "Malformed commit object: missing message separator"
        );

        let err = TrustError::ObjectNotFound {
            kind: ObjectKind::Tag,
            id: "v1.0".to_string(),
        };
        assert_eq!(err.to_string(), "tag object not found: v1.0");
    }

    #[test]
    fn test_fork_discovery_classification() {
        let fetch = TrustError::Fetch {
            remote: "https://example.com/fork.git".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(fetch.is_fork_discovery());

        let api = TrustError::Api {
            url: "https://api.github.com/repos/o/r/pulls/1".to_string(),
            status: 404,
            body: "Not Found".to_string(),
        };
        assert!(api.is_fork_discovery());

        assert!(!TrustError::malformed(ObjectKind::Tag, "empty").is_fork_discovery());
    }
}
