//! Data models for the Keygate engine
//!
//! This module defines the verification outcomes, collaborator data and
//! status/health types shared by the library, the CLI and the dispatcher.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Git Object Models
// ============================================================================

/// Kind of git object that can carry a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Commit,
    Tag,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The exact signed bytes of an object together with its detached signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedObject {
    /// Byte sequence that was originally signed
    pub payload: Vec<u8>,
    /// Detached signature, usually ASCII armored
    pub signature: Vec<u8>,
}

/// A tag advertised by a remote, already dereferenced to the object it tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTag {
    pub commit_id: String,
    pub name: String,
}

// ============================================================================
// Verification Models
// ============================================================================

/// Result of verifying a single object.
///
/// A key id is only ever present together with `any_signature_present`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationOutcome {
    key_id: Option<String>,
    any_signature_present: bool,
}

impl VerificationOutcome {
    /// A good signature from `key_id`
    pub fn verified(key_id: impl Into<String>) -> Self {
        Self {
            key_id: Some(key_id.into()),
            any_signature_present: true,
        }
    }

    /// A signature was present but did not verify
    pub fn unverified() -> Self {
        Self {
            key_id: None,
            any_signature_present: true,
        }
    }

    /// No signature construct at all
    pub fn unsigned() -> Self {
        Self::default()
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub fn any_signature_present(&self) -> bool {
        self.any_signature_present
    }

    pub fn is_verified(&self) -> bool {
        self.key_id.is_some()
    }
}

/// Where a verified signature was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum TrustSource {
    Commit,
    Tag(String),
}

impl fmt::Display for TrustSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustSource::Commit => f.write_str("commit"),
            TrustSource::Tag(name) => write!(f, "tag {}", name),
        }
    }
}

/// Aggregate result of a trust search over a commit and its tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrustSearchResult {
    #[serde(flatten)]
    outcome: VerificationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<TrustSource>,
}

impl TrustSearchResult {
    pub fn trusted(key_id: impl Into<String>, source: TrustSource) -> Self {
        Self {
            outcome: VerificationOutcome::verified(key_id),
            source: Some(source),
        }
    }

    pub fn untrusted(any_signature_present: bool) -> Self {
        let outcome = if any_signature_present {
            VerificationOutcome::unverified()
        } else {
            VerificationOutcome::unsigned()
        };
        Self {
            outcome,
            source: None,
        }
    }

    pub fn key_id(&self) -> Option<&str> {
        self.outcome.key_id()
    }

    pub fn any_signature_present(&self) -> bool {
        self.outcome.any_signature_present()
    }

    pub fn source(&self) -> Option<&TrustSource> {
        self.source.as_ref()
    }

    pub fn is_trusted(&self) -> bool {
        self.outcome.is_verified()
    }

    pub fn verdict(&self) -> TrustVerdict {
        match (self.key_id(), &self.source) {
            (Some(key_id), Some(source)) => TrustVerdict::Trusted {
                key_id: key_id.to_string(),
                source: source.clone(),
            },
            (Some(key_id), None) => TrustVerdict::Trusted {
                key_id: key_id.to_string(),
                source: TrustSource::Commit,
            },
            (None, _) if self.any_signature_present() => TrustVerdict::Unverified,
            (None, _) => TrustVerdict::Unsigned,
        }
    }
}

/// Binary trust decision with a reporting distinction for failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustVerdict {
    Trusted { key_id: String, source: TrustSource },
    /// A signature was seen but none verified
    Unverified,
    Unsigned,
}

impl TrustVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustVerdict::Trusted { .. } => "trusted",
            TrustVerdict::Unverified => "unverified",
            TrustVerdict::Unsigned => "unsigned",
        }
    }

    /// Human-readable description for status reporting
    pub fn description(&self) -> String {
        match self {
            TrustVerdict::Trusted { key_id, source } => {
                format!("Signed by key {} ({})", key_id, source)
            }
            TrustVerdict::Unverified => "Signature found but could not be verified".to_string(),
            TrustVerdict::Unsigned => "No signature found".to_string(),
        }
    }

    pub fn status_state(&self) -> StatusState {
        match self {
            TrustVerdict::Trusted { .. } => StatusState::Success,
            TrustVerdict::Unverified | TrustVerdict::Unsigned => StatusState::Failure,
        }
    }
}

// ============================================================================
// Pull Request / Status Models
// ============================================================================

/// Pull request whose head commit is being checked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestContext {
    /// API URL of the pull request (e.g. https://api.github.com/repos/o/r/pulls/7)
    pub api_url: String,
}

impl PullRequestContext {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
        }
    }
}

/// Pull request metadata needed for fork tag discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestMetadata {
    pub number: u64,
    pub head_sha: String,
    /// Clone URL of the repository the pull request comes from; `None` when
    /// that repository no longer exists
    pub source_clone_url: Option<String>,
}

/// Commit status state as understood by the hosting API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Error => "error",
        }
    }
}

/// Maximum description length accepted by the GitHub statuses API
pub const STATUS_DESCRIPTION_MAX: usize = 140;

/// Commit status to publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub state: StatusState,
    pub description: String,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

impl CommitStatus {
    pub fn new(state: StatusState, description: impl Into<String>, context: impl Into<String>) -> Self {
        let mut description: String = description.into();
        if description.chars().count() > STATUS_DESCRIPTION_MAX {
            description = description.chars().take(STATUS_DESCRIPTION_MAX).collect();
        }
        Self {
            state,
            description,
            context: context.into(),
            target_url: None,
        }
    }

    pub fn from_verdict(verdict: &TrustVerdict, context: impl Into<String>) -> Self {
        Self::new(verdict.status_state(), verdict.description(), context)
    }

    /// Status for a search that could not complete
    pub fn undetermined(error: &dyn fmt::Display, context: impl Into<String>) -> Self {
        Self::new(
            StatusState::Error,
            format!("Trust undetermined: {}", error),
            context,
        )
    }
}

// ============================================================================
// Health Models
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub queued_checks: usize,
    pub completed_checks: u64,
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

// ============================================================================
// API Models
// ============================================================================

/// Webhook acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// Whether a check was queued for this delivery
    pub queued: bool,
    /// Delivery id of the queued check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<Uuid>,
    pub message: String,
}

impl WebhookResponse {
    pub fn queued(delivery_id: Uuid) -> Self {
        Self {
            queued: true,
            delivery_id: Some(delivery_id),
            message: "Check queued".to_string(),
        }
    }

    pub fn ignored(message: impl Into<String>) -> Self {
        Self {
            queued: false,
            delivery_id: None,
            message: message.into(),
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_invariant() {
        let verified = VerificationOutcome::verified("0xKEYID");
        assert!(verified.any_signature_present());
        assert_eq!(verified.key_id(), Some("0xKEYID"));

        let unverified = VerificationOutcome::unverified();
        assert!(unverified.any_signature_present());
        assert!(!unverified.is_verified());

        let unsigned = VerificationOutcome::unsigned();
        assert!(!unsigned.any_signature_present());
        assert_eq!(unsigned.key_id(), None);
    }

    #[test]
    fn test_verdicts() {
        let trusted = TrustSearchResult::trusted("ABCD", TrustSource::Tag("v1.0".to_string()));
        assert_eq!(trusted.verdict().description(), "Signed by key ABCD (tag v1.0)");
        assert_eq!(trusted.verdict().status_state(), StatusState::Success);

        let unverified = TrustSearchResult::untrusted(true);
        assert_eq!(unverified.verdict(), TrustVerdict::Unverified);
        assert_eq!(unverified.verdict().status_state(), StatusState::Failure);

        let unsigned = TrustSearchResult::untrusted(false);
        assert_eq!(unsigned.verdict(), TrustVerdict::Unsigned);
        assert_eq!(unsigned.verdict().description(), "No signature found");
    }

    #[test]
    fn test_result_serialization() {
        let result = TrustSearchResult::trusted("ABCD", TrustSource::Commit);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["key_id"], "ABCD");
        assert_eq!(json["any_signature_present"], true);
        assert_eq!(json["source"]["type"], "commit");

        let json = serde_json::to_value(TrustSearchResult::untrusted(false)).unwrap();
        assert!(json["key_id"].is_null());
        assert!(json.get("source").is_none());
    }

    #[test]
    fn test_status_description_truncated() {
        let long = "x".repeat(300);
        let status = CommitStatus::new(StatusState::Error, long, "keygate");
        assert_eq!(status.description.chars().count(), STATUS_DESCRIPTION_MAX);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "error");
        assert!(json.get("target_url").is_none());
    }
}
